//! Request execution core for axum services.
//!
//! Requests run through a [`Chain`] of [`Handler`]s sharing one pooled
//! [`Context`]. Handlers read the request, bind its body through the
//! [`Parsers`] table, write the response and may abort the rest of the chain.

pub mod config;
pub mod context;
pub mod engine;
pub mod humanize;
pub mod observability;
pub mod parser;
pub mod pool;
pub mod storage;
pub mod validate;

pub use context::{
    Abort, Chain, Context, DataError, Exit, Flow, Handler, chain, exit_fn, handler_fn,
};
pub use engine::{Engine, EngineBuilder};
pub use parser::{ParseError, Parser, Parsers};
pub use validate::{Validator, ValidationError};

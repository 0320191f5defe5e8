//! Content-type driven body parsing.
//!
//! A [`Parsers`] table is an ordered list of [`Parser`]s. The first parser
//! whose [`Parser::matches`] accepts the request decodes the body into a
//! [`Payload`], which is then deserialized into the caller's destination type.
//! When nothing matches the table fails with [`ParseError`].
//!
//! Ordering is the caller's responsibility: put exact content-type matches
//! ahead of broad ones.
//!
//! ## Built-in parsers
//!
//! - [`FormParser`] - `application/x-www-form-urlencoded`
//! - [`JsonParser`] - `application/json`
//! - [`MultipartParser`] - anything containing `multipart/form-data`

mod builtin;
mod multipart;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::context::{Context, DataError, Values};

pub use builtin::{FormParser, JsonParser, MultipartParser, QueryParser};
pub use multipart::{MultipartForm, UploadData, UploadFile};

#[cfg(test)]
pub(crate) use multipart::tests as multipart_tests;

/// No parser in the table accepted the request.
#[derive(Debug, Clone, Copy, Default, Error, PartialEq, Eq)]
#[error("no parser matched the request content type")]
pub struct ParseError;

/// A matched parser could not decode the body into the destination type.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid form body: {0}")]
    Form(#[from] serde::de::value::Error),
}

/// Body decoded by a parser but not yet bound to a Rust type.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Raw JSON document.
    Json(Bytes),
    /// Flat key/value pairs from a form or multipart body.
    Form(Values),
    /// Self-describing tree, for third-party formats that convert into JSON values.
    Value(serde_json::Value),
}

impl Payload {
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, DecodeError> {
        match self {
            Payload::Json(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Payload::Form(values) => Ok(values.deserialize()?),
            Payload::Value(value) => Ok(serde_json::from_value(value)?),
        }
    }
}

#[async_trait]
pub trait Parser: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Whether this parser handles the request.
    fn matches(&self, ctx: &Context) -> bool;

    /// Reads and decodes the request body.
    async fn parse(&self, ctx: &mut Context) -> Result<Payload, DataError>;
}

/// Ordered parser table; the first match wins.
#[derive(Clone, Default)]
pub struct Parsers {
    parsers: Vec<Arc<dyn Parser>>,
}

impl Parsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Form, JSON, then multipart.
    pub fn defaults() -> Self {
        Self::new()
            .with(FormParser)
            .with(JsonParser)
            .with(MultipartParser)
    }

    pub fn with(mut self, parser: impl Parser + 'static) -> Self {
        self.push(Arc::new(parser));
        self
    }

    pub fn push(&mut self, parser: Arc<dyn Parser>) {
        self.parsers.push(parser);
    }

    /// Returns a table holding `self` followed by `rest`.
    pub fn chain(&self, rest: &Parsers) -> Parsers {
        self.parsers
            .iter()
            .chain(rest.parsers.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    pub fn clear(&mut self) {
        self.parsers.clear();
    }

    /// First parser whose predicate accepts the request.
    pub fn select(&self, ctx: &Context) -> Option<Arc<dyn Parser>> {
        self.parsers
            .iter()
            .find(|parser| parser.matches(ctx))
            .cloned()
    }

    pub async fn parse(&self, ctx: &mut Context) -> Result<Payload, DataError> {
        let Some(parser) = self.select(ctx) else {
            debug!(content_type = ?ctx.content_type(), "no parser matched");
            return Err(ParseError.into());
        };

        debug!(parser = parser.name(), "parsing request body");
        parser.parse(ctx).await
    }

    /// Parses and binds the body onto `T`.
    pub async fn parse_into<T: DeserializeOwned>(&self, ctx: &mut Context) -> Result<T, DataError> {
        let payload = self.parse(ctx).await?;
        Ok(payload.decode()?)
    }
}

impl FromIterator<Arc<dyn Parser>> for Parsers {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Parser>>>(iter: I) -> Self {
        Self {
            parsers: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for Parsers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.parsers.iter().map(|parser| parser.name()))
            .finish()
    }
}

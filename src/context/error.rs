use thiserror::Error;

use crate::parser::{DecodeError, ParseError};
use crate::validate::ValidationError;

/// Failures surfaced by body access, binding and validation on a context.
///
/// Handlers decide how each case maps onto a response; the core never writes
/// an error body on its own.
#[derive(Debug, Error)]
pub enum DataError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(u64),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid multipart body: {0}")]
    Multipart(String),

    #[error("upload spill failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl DataError {
    /// True when no parser accepted the request's content type.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, DataError::Parse(_))
    }
}

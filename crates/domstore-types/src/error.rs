use thiserror::Error;

/// Errors produced by identifier validation and key decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid persistent namespace id {id:?}: {reason}")]
    InvalidNamespaceId { id: String, reason: &'static str },

    #[error("invalid origin {origin:?}: {reason}")]
    InvalidOrigin { origin: String, reason: &'static str },

    #[error("malformed physical key {0:?}")]
    MalformedKey(String),

    #[error("invalid decimal number {0:?}")]
    InvalidNumber(String),
}

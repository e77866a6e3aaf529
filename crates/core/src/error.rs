//! Failure classification shared by every layer.

use thiserror::Error;

/// A failure that carries a stable classifier next to its human-readable message.
///
/// The classifier is what observers branch on programmatically (`"BackendError"`,
/// `"ValidationError"`, ...). It must not change with the wording of the message.
pub trait Classified: std::error::Error {
    /// Stable category name of this failure.
    fn kind(&self) -> &str;
}

/// Rejected input to one of the pure primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Empty identifier, or one containing whitespace.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

impl Classified for DomainError {
    fn kind(&self) -> &str {
        "ValidationError"
    }
}

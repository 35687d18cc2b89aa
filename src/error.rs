use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Storage-core failure.
///
/// `Conflict` is the soft outcome: a concurrent, visibility-incompatible
/// mutation was seen and the transaction has to be rolled back or retried.
/// Every other variant is a hard error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Allocation failed: {0}")]
    Alloc(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("An internal operation failed: {0}")]
    Internal(String),
}

impl Error {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True when the caller should abort or retry rather than fail hard.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(err: std::collections::TryReserveError) -> Self {
        Error::Alloc(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

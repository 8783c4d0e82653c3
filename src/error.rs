//! Error types for jobtree.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No active counter record for the job (never registered, already
    /// finalized, or already drained to zero).
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    /// A worker unit failed while handling an item.
    #[error("worker {worker} failed: {message}")]
    Processing { worker: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// The forward-only source ended before its declared length.
    #[error("source exhausted at {available} bytes, expected {expected}")]
    SourceExhausted { expected: u64, available: u64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the "job already gone" case that completion paths may tolerate.
    pub fn is_job_not_found(&self) -> bool {
        matches!(self, Error::JobNotFound(_))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::OutOfRange(_) => std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
            Error::SourceExhausted { .. } => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err)
            }
            other => std::io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

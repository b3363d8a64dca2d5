use thiserror::Error;

use crate::events::PublishError;
use crate::storage::StorageError;

/// Errors surfaced by the observation store, query and reporting operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or logically inconsistent input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// Well-formed input that cannot be processed, e.g. an inverted date range.
    #[error("unprocessable entity: {0}")]
    Unprocessable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// True for errors caused by the caller's input rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Unprocessable(_) | Error::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

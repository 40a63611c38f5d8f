use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Processor-level errors.
///
/// These abort a whole invocation. Failures of individual documents never
/// surface here; they are recorded in the queue and the status ledger.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Queue store error: {0}")]
    Store(String),

    #[error("Invalid invocation payload: {0}")]
    InvalidRequest(String),

    #[error("Queue item not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Store(format!("{:#}", err))
    }
}

/// Classification of an external service failure.
///
/// Drives the retry decision: only `RateLimited` and `Timeout` are retryable,
/// and `PaymentRequired` halts the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    RateLimited,
    Timeout,
    PaymentRequired,
    Other,
}

impl ServiceErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceErrorKind::RateLimited | ServiceErrorKind::Timeout)
    }
}

/// A typed failure returned by the extraction or analysis service shims.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Timeout, message)
    }

    pub fn payment_required(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::PaymentRequired, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Other, message)
    }
}

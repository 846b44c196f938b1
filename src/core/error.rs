use super::types::StageHandle;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Invalid stage handle: {0}")]
    InvalidHandle(StageHandle),

    #[error("Stage file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Stage '{}' is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on '{}': {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Capacity exceeded: {resident} resident stages, capacity {capacity}")]
    CapacityExceeded { resident: usize, capacity: usize },

    #[error("Document error: {0}")]
    Document(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Stage registry is shut down")]
    RegistryClosed,
}

impl StageError {
    pub fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Whether retrying the same call may succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, StageError>;

impl<T> From<std::sync::PoisonError<T>> for StageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

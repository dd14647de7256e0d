//! Error types for vecmem

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "Entry cannot be loaded into cache because it would not fit. \
         Entry size: {entry_kb} KB Current Cache Size: {current_kb} KB Max Cache Size: {max_kb} KB"
    )]
    CapacityExceeded {
        entry_kb: u64,
        current_kb: u64,
        max_kb: u64,
    },

    #[error("Failed to load cache entry {key}: {reason}")]
    LoadFailed { key: String, reason: String },

    #[error("Lock acquisition was interrupted")]
    LockInterrupted,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unable to run training job: No training capacity on node.")]
    NoCapacity,

    #[error("Training failed: {0}")]
    TrainingFailed(String),

    #[error("Execution rejected: {0}")]
    Rejected(String),

    #[error("Native engine error: {0}")]
    Native(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn native(msg: impl Into<String>) -> Self {
        Error::Native(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn load_failed(key: impl Into<String>, reason: impl ToString) -> Self {
        Error::LoadFailed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

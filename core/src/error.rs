//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
///
/// Per-host transport failures never show up here; they are captured in
/// [`ExecutionOutcome`](crate::ExecutionOutcome). These variants are for
/// precondition violations and for the collaborators around the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Host index {index} out of range (fleet has {len} hosts)")]
    HostIndexOutOfRange { index: usize, len: usize },

    #[error("Cannot dispatch to an empty fleet")]
    EmptyFleet,

    #[error("Invalid threshold rule: {0}")]
    InvalidThreshold(String),

    #[error("Invalid service name: {0:?}")]
    InvalidServiceName(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Cooldown store error: {0}")]
    CooldownStoreError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Precondition violations are fatal to the single invocation and must
    /// not be retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::HostIndexOutOfRange { .. }
                | Error::EmptyFleet
                | Error::InvalidThreshold(_)
                | Error::InvalidServiceName(_)
                | Error::InvalidOperation(_)
        )
    }
}

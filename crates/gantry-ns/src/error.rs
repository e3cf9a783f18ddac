//! Error types for the network-server core.

use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the session store and the device queue.
///
/// The originating backend message is carried verbatim; the core never
/// retries store calls itself.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The sought entity is absent. Deleting an absent entity also returns
    /// this, making deletes idempotent to observe.
    #[error("object does not exist")]
    NotFound,

    /// FPort 0 is reserved for MAC-layer traffic and rejected on queue items.
    #[error("invalid fport: fport must be between 1 - 255")]
    InvalidFPort,

    /// No session candidate matched the received frame: either no session
    /// uses the device address, the frame-counter fell outside the allowed
    /// gap, or the MIC failed against every candidate.
    #[error("device-session does not exist or invalid fcnt or mic")]
    InvalidMic,

    /// Transient backend error; the caller may retry.
    #[error("backend unavailable: {0}")]
    Backend(String),

    /// The caller's cancellation fired while the operation was in flight.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Broken invariant; programmer error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound,
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<gantry_lorawan::LorawanError> for StorageError {
    fn from(e: gantry_lorawan::LorawanError) -> Self {
        Self::Internal(e.to_string())
    }
}

//! Error types for the knock daemon.

use thiserror::Error;

/// Main error type for the daemon.
///
/// Authentication outcomes (wrong port, mistimed knock, exhausted mistake
/// budget) are never represented here; they are plain control flow inside
/// the trackers.
#[derive(Error, Debug)]
pub enum KnockError {
    /// Configuration-related errors, raised before any socket is bound.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A knock port could not be bound. Fatal for the whole listener.
    #[error("Failed to bind knock port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A receive loop or the processing worker failed after startup.
    #[error("Listener error: {message}")]
    Listener { message: String },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KnockError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        KnockError::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for daemon operations.
pub type KnockResult<T> = Result<T, KnockError>;

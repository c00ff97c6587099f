//! Server error types.

use thiserror::Error;

use crate::listener::StreamError;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Installing the change triggers failed. Nothing can be relayed without them.
    #[error("trigger setup failed: {0}")]
    Setup(#[source] sqlx::Error),

    /// The notification stream failed in a way that retrying cannot fix.
    #[error("notification stream error: {0}")]
    Stream(#[from] StreamError),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the driver layer.

use std::time::Duration;

use lodestar_bson::BsonError;
use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors raised while talking to servers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// An operation did not complete in time.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The limit that expired.
        after: Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// No suitable server could be selected.
    #[error("server selection failed: {0}")]
    ServerSelection(String),

    /// Too many operations are already waiting for a server.
    #[error("the server selection wait queue is full ({0} waiting)")]
    WaitQueueFull(usize),

    /// Connecting, writing or reading failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered a command with `ok: 0`.
    #[error("command failed with code {code} ({code_name}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
    },

    /// Invalid settings, such as an unparsable address.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Encoding or decoding a message body failed.
    #[error(transparent)]
    Bson(#[from] BsonError),
}

impl DriverError {
    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Network failures and timeouts may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

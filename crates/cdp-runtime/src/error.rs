//! Error types for the CDP runtime.

use crate::message::SessionId;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the CDP runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to establish the connection to the browser endpoint.
    #[error("Failed to connect to browser endpoint: {0}")]
    ConnectionFailed(String),

    /// Transport-level error (WebSocket stream failure).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Error returned by the remote endpoint in a command reply.
    #[error("CDP error {code}: {message}")]
    Cdp {
        /// Remote-supplied error code.
        code: i64,
        /// Human-readable error message.
        message: String,
    },

    /// The connection closed while the operation was in flight,
    /// or the operation was issued on an already-closed connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Internal channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// The target backing this session has crashed.
    #[error("Target crashed")]
    TargetCrashed,

    /// The session is closed; no further commands may be issued on it.
    #[error("Session {session} is closed")]
    TargetClosed {
        /// Identifier of the closed session.
        session: SessionId,
    },

    /// Closing a target via command is disallowed at this layer.
    #[error("To close the target, cancel its owning context instead of sending Target.closeTarget")]
    CloseTargetDenied,

    /// The event emitter has been closed; no further subscriptions accepted.
    #[error("Event emitter closed")]
    EmitterClosed,

    /// Deadline elapsed before the operation completed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the remote error code if this is a CDP error.
    pub fn cdp_code(&self) -> Option<i64> {
        match self {
            Error::Cdp { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the connection closed under the operation.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::ChannelClosed)
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

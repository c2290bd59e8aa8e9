//! Error types for the sync engine.

use exograph_model::ModelError;
use exograph_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Errors are `Clone` so one failure can be delivered to every caller
/// waiting on the same load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// Malformed wire data or change log misuse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The entity model refused an operation.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// A type could not be resolved.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A `(type, id)` reference could not be resolved to an entity.
    #[error("unresolved entity {type_name}|{id}")]
    UnresolvedEntity {
        /// Type name.
        type_name: String,
        /// Entity id as received.
        id: String,
    },

    /// A change record is not valid for the property it targets.
    #[error("invalid change for {type_name}.{property}: {reason}")]
    InvalidChange {
        /// Type name.
        type_name: String,
        /// Property name.
        property: String,
        /// What is wrong.
        reason: String,
    },

    /// The operation was abandoned before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an [`SyncError::UnresolvedEntity`].
    pub fn unresolved(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self::UnresolvedEntity {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building or decoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A change was added before any change set was started.
    #[error("no active change set")]
    NoActiveSet,

    /// A date string did not match `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    #[error("invalid date: {0}")]
    InvalidDate(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(ProtocolError::NoActiveSet.to_string(), "no active change set");
        assert!(ProtocolError::InvalidDate("yesterday".into())
            .to_string()
            .contains("yesterday"));
    }
}

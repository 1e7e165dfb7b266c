//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A text frame did not contain a well-formed resize request.
    #[error("malformed control frame: {0}")]
    MalformedControl(String),

    /// A resize request carried dimensions outside `1..=65535`.
    #[error("invalid terminal size {rows}x{cols}: rows and cols must be between 1 and 65535")]
    InvalidSize {
        /// Requested rows.
        rows: i64,
        /// Requested columns.
        cols: i64,
    },
}

impl ProtocolError {
    /// Returns true for errors the sender can recover from by sending a
    /// corrected message on the same connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::InvalidSize { .. })
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedControl(err.to_string())
    }
}

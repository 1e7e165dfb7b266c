//! Close codes sent when the server ends a connection.
//!
//! Standard RFC 6455 codes are used where one fits. Session-specific
//! failures use the private range (4000-4999), mirroring HTTP status
//! numbers so they read naturally in client logs.

use std::fmt;

/// Maximum length of a close reason in bytes (125 byte control payload
/// minus the 2 byte code).
pub const MAX_REASON_BYTES: usize = 123;

/// A close code paired with a short human-readable reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    /// Client or session ended normally.
    pub const NORMAL: CloseReason = CloseReason::new(1000, "session ended");

    /// Server is shutting down.
    pub const GOING_AWAY: CloseReason = CloseReason::new(1001, "server shutting down");

    /// Client violated the framing protocol.
    pub const PROTOCOL_ERROR: CloseReason = CloseReason::new(1002, "protocol error");

    /// Terminal could not be started or failed mid-session.
    pub const INTERNAL_ERROR: CloseReason = CloseReason::new(1011, "terminal failure");

    /// Session limit reached; retrying later may succeed.
    pub const TRY_AGAIN_LATER: CloseReason = CloseReason::new(1013, "session limit reached");

    /// Requested session does not exist.
    pub const SESSION_NOT_FOUND: CloseReason = CloseReason::new(4404, "session not found");

    /// Requested session already has a client attached.
    pub const SESSION_CONFLICT: CloseReason = CloseReason::new(4409, "session already attached");

    pub const fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    /// True for codes that indicate the server or client misbehaved.
    pub fn is_error(&self) -> bool {
        !matches!(self.code, 1000 | 1001)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}

/// Truncate a close reason to fit in a close frame without splitting a
/// UTF-8 character.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(CloseReason::NORMAL.code, 1000);
        assert_eq!(CloseReason::PROTOCOL_ERROR.code, 1002);
        assert_eq!(CloseReason::INTERNAL_ERROR.code, 1011);
        assert_eq!(CloseReason::TRY_AGAIN_LATER.code, 1013);
        assert_eq!(CloseReason::SESSION_NOT_FOUND.code, 4404);
        assert_eq!(CloseReason::SESSION_CONFLICT.code, 4409);
    }

    #[test]
    fn test_is_error() {
        assert!(!CloseReason::NORMAL.is_error());
        assert!(!CloseReason::GOING_AWAY.is_error());
        assert!(CloseReason::SESSION_CONFLICT.is_error());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CloseReason::SESSION_NOT_FOUND.to_string(),
            "4404 (session not found)"
        );
    }

    #[test]
    fn test_truncate_short_reason_unchanged() {
        assert_eq!(truncate_reason("bye"), "bye");
    }

    #[test]
    fn test_truncate_long_reason() {
        let long = "x".repeat(500);
        assert_eq!(truncate_reason(&long).len(), MAX_REASON_BYTES);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let long = "é".repeat(100); // 200 bytes
        let truncated = truncate_reason(&long);
        assert!(truncated.len() <= MAX_REASON_BYTES);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}

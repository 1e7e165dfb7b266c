//! Frame classification for the terminal channel.
//!
//! # Frame Kinds
//!
//! The WebSocket message type selects the meaning of a frame:
//! - binary messages are [`Frame::Data`], opaque terminal bytes
//! - text messages are [`Frame::Control`], a JSON resize request
//!
//! Data bytes are never inspected or re-encoded. A text message that is not
//! a JSON object with integer `rows` and `cols` fields is malformed; unknown
//! extra fields are ignored.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default terminal height used before the client sends a resize.
pub const DEFAULT_ROWS: u16 = 24;

/// Default terminal width used before the client sends a resize.
pub const DEFAULT_COLS: u16 = 80;

/// Which channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Raw terminal bytes.
    Data,
    /// Out-of-band control message.
    Control,
}

/// A decoded frame from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal input bytes, forwarded verbatim.
    Data(Vec<u8>),
    /// A resize request. Dimensions are not yet validated.
    Control(ResizeRequest),
}

impl Frame {
    /// Classify a binary message. Binary payloads are always data.
    #[inline]
    pub fn from_binary(payload: Vec<u8>) -> Self {
        Frame::Data(payload)
    }

    /// Parse a text message as a control frame.
    pub fn from_text(text: &str) -> Result<Self> {
        let request: ResizeRequest = serde_json::from_str(text)?;
        Ok(Frame::Control(request))
    }

    /// The channel this frame travels on.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data(_) => FrameKind::Data,
            Frame::Control(_) => FrameKind::Control,
        }
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Data(_))
    }

    /// Returns the resize request if this is a control frame.
    pub fn as_control(&self) -> Option<&ResizeRequest> {
        match self {
            Frame::Control(request) => Some(request),
            Frame::Data(_) => None,
        }
    }
}

/// Resize request as sent by the client.
///
/// Fields are wide signed integers so that out-of-range values (zero,
/// negative, larger than `u16`) parse successfully and can be rejected as a
/// validation error rather than a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub rows: i64,
    pub cols: i64,
}

impl ResizeRequest {
    pub fn new(rows: i64, cols: i64) -> Self {
        Self { rows, cols }
    }

    /// Check the requested dimensions and convert them to a [`TerminalSize`].
    pub fn validate(&self) -> Result<TerminalSize> {
        TerminalSize::new(self.rows, self.cols)
    }

    /// Serialize as the JSON text a client would send.
    pub fn to_json(&self) -> String {
        format!(r#"{{"rows":{},"cols":{}}}"#, self.rows, self.cols)
    }
}

/// A validated terminal size. Both dimensions are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    /// Validate and build a terminal size.
    ///
    /// Fails with [`ProtocolError::InvalidSize`] unless both values are in
    /// `1..=65535`.
    pub fn new(rows: i64, cols: i64) -> Result<Self> {
        let checked = |value: i64| u16::try_from(value).ok().filter(|v| *v > 0);
        match (checked(rows), checked(cols)) {
            (Some(rows), Some(cols)) => Ok(Self { rows, cols }),
            _ => Err(ProtocolError::InvalidSize { rows, cols }),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

impl TryFrom<ResizeRequest> for TerminalSize {
    type Error = ProtocolError;

    fn try_from(request: ResizeRequest) -> Result<Self> {
        request.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_is_data() {
        let frame = Frame::from_binary(vec![0x1b, b'[', b'A']);
        assert_eq!(frame.kind(), FrameKind::Data);
        assert_eq!(frame, Frame::Data(vec![0x1b, b'[', b'A']));
        assert!(frame.as_control().is_none());
    }

    #[test]
    fn test_binary_that_looks_like_json_is_still_data() {
        let frame = Frame::from_binary(br#"{"rows":10,"cols":10}"#.to_vec());
        assert!(frame.is_data());
    }

    #[test]
    fn test_text_resize() {
        let frame = Frame::from_text(r#"{"rows":40,"cols":120}"#).unwrap();
        assert_eq!(frame.kind(), FrameKind::Control);
        assert_eq!(frame.as_control(), Some(&ResizeRequest::new(40, 120)));
    }

    #[test]
    fn test_text_resize_ignores_extra_fields() {
        let frame = Frame::from_text(r#"{"cols":80,"rows":24,"type":"resize"}"#).unwrap();
        assert_eq!(frame.as_control(), Some(&ResizeRequest::new(24, 80)));
    }

    #[test]
    fn test_text_not_json() {
        let err = Frame::from_text("hello").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedControl(_)));
    }

    #[test]
    fn test_text_missing_field() {
        let err = Frame::from_text(r#"{"rows":24}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedControl(_)));
    }

    #[test]
    fn test_text_wrong_type() {
        assert!(Frame::from_text(r#"{"rows":"24","cols":80}"#).is_err());
        assert!(Frame::from_text(r#"{"rows":24.5,"cols":80}"#).is_err());
        assert!(Frame::from_text("[24,80]").is_err());
    }

    #[test]
    fn test_out_of_range_parses_but_fails_validation() {
        let frame = Frame::from_text(r#"{"rows":0,"cols":-5}"#).unwrap();
        let err = frame.as_control().unwrap().validate().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSize { rows: 0, cols: -5 }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_terminal_size_bounds() {
        assert!(TerminalSize::new(1, 1).is_ok());
        assert!(TerminalSize::new(65535, 65535).is_ok());
        assert!(TerminalSize::new(0, 80).is_err());
        assert!(TerminalSize::new(24, 0).is_err());
        assert!(TerminalSize::new(-1, 80).is_err());
        assert!(TerminalSize::new(65536, 80).is_err());
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
        assert_eq!(size.to_string(), "80x24");
    }

    #[test]
    fn test_try_from_request() {
        let size = TerminalSize::try_from(ResizeRequest::new(50, 200)).unwrap();
        assert_eq!(size, TerminalSize { rows: 50, cols: 200 });
    }

    #[test]
    fn test_request_to_json_parses_back() {
        let request = ResizeRequest::new(33, 101);
        let frame = Frame::from_text(&request.to_json()).unwrap();
        assert_eq!(frame.as_control(), Some(&request));
    }
}

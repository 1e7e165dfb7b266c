//! # webterm Protocol Library
//!
//! Wire-level definitions shared by the webterm relay and its clients.
//!
//! ## Overview
//!
//! A webterm connection is a single WebSocket carrying two kinds of frames:
//!
//! - **Data frames** (binary): raw terminal bytes. Client to server they are
//!   keystrokes written to the PTY; server to client they are PTY output.
//! - **Control frames** (text): a JSON object `{"rows": N, "cols": M}` asking
//!   the server to resize the terminal.
//!
//! The server ends a connection with a close frame whose code tells the
//! client why (see [`close`]).
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Frame, TerminalSize};
//!
//! let frame = Frame::from_text(r#"{"rows": 40, "cols": 120}"#).unwrap();
//! let request = frame.as_control().unwrap();
//! let size = request.validate().unwrap();
//! assert_eq!(size, TerminalSize { rows: 40, cols: 120 });
//!
//! let data = Frame::from_binary(b"ls -la\r".to_vec());
//! assert!(data.is_data());
//! ```
//!
//! ## Modules
//!
//! - [`frame`]: Frame classification and the resize control message
//! - [`close`]: Close codes and reasons
//! - [`error`]: Error types

pub mod close;
pub mod error;
pub mod frame;

pub use close::{truncate_reason, CloseReason, MAX_REASON_BYTES};
pub use error::{ProtocolError, Result};
pub use frame::{Frame, FrameKind, ResizeRequest, TerminalSize};

//! Session identifiers.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Number of random bytes in a session id.
const SESSION_ID_BYTES: usize = 16;

/// Opaque, unguessable session token: 128 random bits as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parse a client-supplied id.
    ///
    /// Returns `None` unless the input is exactly 32 hex characters.
    /// Uppercase input is accepted and normalized.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.len() != SESSION_ID_BYTES * 2 || !input.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(input.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for thread names and compact log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

//! Session management module.
//!
//! This module provides PTY spawning and the registry that owns every live
//! session. Sessions outlive the connections attached to them; a client may
//! detach and a later client may rejoin the same session by id.

pub mod id;
pub mod pty;
pub mod registry;

pub use id::SessionId;
pub use pty::{OutputStream, PtySession, SessionError, SessionState, ShellCommand};
pub use registry::{BridgeId, RegistryError, SessionInfo, SessionRegistry, SessionTarget};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

//! Unix Domain Socket IPC between the CLI and a running daemon.
//!
//! The protocol is newline-delimited JSON: one [`IpcRequest`] per line from
//! the client, one [`IpcResponse`] per line back.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/webterm/daemon.sock`
//! - Fallback: `/tmp/webterm-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Where the daemon's control socket lives.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/webterm/daemon.sock`
/// 2. Otherwise: `/tmp/webterm-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("webterm").join("daemon.sock")
        }
        _ => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/webterm-{}", uid)).join("daemon.sock")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        // SAFETY: serialized with other env-mutating tests
        unsafe {
            match value {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        let result = f();
        // SAFETY: as above
        unsafe {
            match original {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        result
    }

    #[test]
    #[serial]
    fn test_socket_path_with_xdg_runtime_dir() {
        let path = with_runtime_dir(Some("/run/user/1000"), get_socket_path);
        assert_eq!(path, PathBuf::from("/run/user/1000/webterm/daemon.sock"));
    }

    #[test]
    #[serial]
    fn test_socket_path_without_xdg_runtime_dir() {
        let path = with_runtime_dir(None, get_socket_path);
        let uid = nix::unistd::getuid();
        assert_eq!(
            path,
            PathBuf::from(format!("/tmp/webterm-{uid}/daemon.sock"))
        );
    }

    #[test]
    #[serial]
    fn test_empty_runtime_dir_falls_back() {
        let path = with_runtime_dir(Some(""), get_socket_path);
        assert!(path.starts_with("/tmp"));
    }
}

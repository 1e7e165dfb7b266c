//! PID file handling.
//!
//! The daemon records its process id on start so `webterm stop --force` can
//! find it even when the control socket is unresponsive.
//!
//! ## PID File Location
//!
//! - `$XDG_DATA_HOME/webterm/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/webterm/daemon.pid` otherwise
//!
//! ```rust
//! use daemon::ipc::pidfile::{get_daemon_pid, is_daemon_running};
//!
//! if is_daemon_running() {
//!     if let Some(pid) = get_daemon_pid() {
//!         println!("Daemon is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Default PID file location.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("webterm").join("daemon.pid")
}

/// Whether a daemon recorded in the default PID file is alive.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// PID of the running daemon, if any. Stale PID files are removed.
pub fn get_daemon_pid() -> Option<u32> {
    read_pid_file(&get_pid_file_path())
}

/// Read a PID file and return the PID if that process is alive.
///
/// A file that does not parse, or names a dead process, is removed.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    match contents.trim().parse::<u32>() {
        Ok(pid) if is_process_running(pid) => Some(pid),
        _ => {
            cleanup_stale_pid_file(path);
            None
        }
    }
}

/// Record the current process id at `path`.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove `path` if it holds the current process id.
///
/// Returns true if the file was removed.
pub fn remove_pid_file(path: &Path) -> bool {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());

    ours && fs::remove_file(path).is_ok()
}

/// Signal 0 checks for existence without delivering anything.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists, but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_pid_file_path_honours_xdg_data_home() {
        let original = std::env::var("XDG_DATA_HOME").ok();

        // SAFETY: serialized with other env-mutating tests
        unsafe {
            std::env::set_var("XDG_DATA_HOME", "/var/lib/test-data");
        }
        assert_eq!(
            get_pid_file_path(),
            PathBuf::from("/var/lib/test-data/webterm/daemon.pid")
        );

        // SAFETY: as above
        unsafe {
            match original {
                Some(value) => std::env::set_var("XDG_DATA_HOME", value),
                None => std::env::remove_var("XDG_DATA_HOME"),
            }
        }
    }

    #[test]
    fn test_write_read_remove() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("daemon.pid");

        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path), Some(std::process::id()));

        assert!(remove_pid_file(&path));
        assert!(!path.exists());
        assert!(!remove_pid_file(&path));
    }

    #[test]
    fn test_remove_leaves_foreign_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "1\n").unwrap();

        assert!(!remove_pid_file(&path));
        assert!(path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_cleaned_up() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "4000000000\n").unwrap();

        assert_eq!(read_pid_file(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_pid_file_is_cleaned_up() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "not a pid").unwrap();

        assert_eq!(read_pid_file(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(read_pid_file(&temp_dir.path().join("absent.pid")), None);
    }

    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(is_process_running(1));
        assert!(!is_process_running(0));
        assert!(!is_process_running(4_000_000_000));
    }
}

//! IPC message types for CLI-daemon communication.
//!
//! Requests and responses are exchanged as newline-delimited JSON over the
//! daemon's Unix socket.

use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all live sessions.
    ListSessions,
    /// Close a session. Accepts a full id or a unique prefix of one.
    KillSession { session_id: String },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        running: bool,
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Address the WebSocket listener is bound to.
        listen_addr: Option<String>,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Every live session, oldest first.
    Sessions { sessions: Vec<IpcSessionInfo> },
    /// Confirmation that a session was closed.
    SessionKilled { session_id: String },
    /// An error occurred processing the request.
    Error { message: String },
}

/// A session as reported over IPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub state: String,
    pub rows: u16,
    pub cols: u16,
    /// Whether a client is currently attached.
    pub attached: bool,
    /// Unix timestamp (seconds) when the session was created.
    pub created_at: u64,
    pub idle_secs: u64,
}

impl From<&SessionInfo> for IpcSessionInfo {
    fn from(info: &SessionInfo) -> Self {
        Self {
            id: info.id.to_string(),
            pid: info.pid,
            state: info.state.to_string(),
            rows: info.size.rows,
            cols: info.size.cols,
            attached: info.attached,
            created_at: info
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            idle_secs: info.idle.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionId, SessionState};
    use protocol::TerminalSize;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_unit_requests_serialize_as_strings() {
        assert_eq!(serde_json::to_string(&IpcRequest::Ping).unwrap(), r#""Ping""#);
        assert_eq!(
            serde_json::to_string(&IpcRequest::ListSessions).unwrap(),
            r#""ListSessions""#
        );

        let request: IpcRequest = serde_json::from_str(r#""Stop""#).unwrap();
        assert_eq!(request, IpcRequest::Stop);
    }

    #[test]
    fn test_kill_session_request() {
        let request = IpcRequest::KillSession {
            session_id: "0123abcd".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"KillSession":{"session_id":"0123abcd"}}"#);

        let parsed: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_status_response() {
        let response = IpcResponse::Status {
            running: true,
            uptime_secs: 3600,
            session_count: 2,
            listen_addr: Some("127.0.0.1:8080".to_string()),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"session_count\":2"));
        assert!(json.contains("127.0.0.1:8080"));

        let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_unknown_request_is_rejected() {
        assert!(serde_json::from_str::<IpcRequest>(r#""Reboot""#).is_err());
        assert!(serde_json::from_str::<IpcRequest>("not json").is_err());
    }

    #[test]
    fn test_session_info_conversion() {
        let id = SessionId::generate();
        let info = SessionInfo {
            id: id.clone(),
            pid: Some(4242),
            state: SessionState::Active,
            size: TerminalSize::new(40, 120).unwrap(),
            attached: true,
            created_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            idle: Duration::from_millis(2500),
        };

        let ipc = IpcSessionInfo::from(&info);
        assert_eq!(ipc.id, id.as_str());
        assert_eq!(ipc.pid, Some(4242));
        assert_eq!(ipc.state, "active");
        assert_eq!((ipc.rows, ipc.cols), (40, 120));
        assert!(ipc.attached);
        assert_eq!(ipc.created_at, 1_700_000_000);
        assert_eq!(ipc.idle_secs, 2);
    }

    #[test]
    fn test_session_info_before_epoch() {
        let info = SessionInfo {
            id: SessionId::generate(),
            pid: None,
            state: SessionState::Starting,
            size: TerminalSize::default(),
            attached: false,
            created_at: SystemTime::UNIX_EPOCH - Duration::from_secs(1),
            idle: Duration::ZERO,
        };
        assert_eq!(IpcSessionInfo::from(&info).created_at, 0);
    }
}

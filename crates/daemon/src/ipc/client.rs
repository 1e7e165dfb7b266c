//! IPC client used by the CLI to talk to a running daemon.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Errors
    ///
    /// Fails if nothing is listening at `path`, which usually means the
    /// daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect with a custom timeout, used for the connect itself and for
    /// every request afterwards.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    /// Close a session by id or unique id prefix.
    pub async fn kill_session(&mut self, session_id: &str) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::KillSession {
            session_id: session_id.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::messages::IpcSessionInfo;
    use crate::ipc::server::IpcServer;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    /// Start a server that answers every request with `respond`.
    async fn fake_daemon(
        socket_path: &Path,
        respond: fn(IpcRequest) -> IpcResponse,
    ) -> CancellationToken {
        let server = IpcServer::bind(socket_path).await.unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(move |request| async move { respond(request) }, shutdown.clone()));
        shutdown
    }

    #[tokio::test]
    async fn test_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        assert!(IpcClient::connect(&socket_path).await.is_err());
    }

    #[tokio::test]
    async fn test_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _shutdown = fake_daemon(&socket_path, |request| match request {
            IpcRequest::Ping => IpcResponse::Pong,
            _ => IpcResponse::Error {
                message: "unexpected".to_string(),
            },
        })
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_several_requests_on_one_connection() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _shutdown = fake_daemon(&socket_path, |request| match request {
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: 100,
                session_count: 1,
                listen_addr: Some("127.0.0.1:8080".to_string()),
            },
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: vec![IpcSessionInfo {
                    id: "ab".repeat(16),
                    pid: Some(10),
                    state: "active".to_string(),
                    rows: 24,
                    cols: 80,
                    attached: false,
                    created_at: 1000,
                    idle_secs: 5,
                }],
            },
            IpcRequest::Stop => IpcResponse::Stopping,
            _ => IpcResponse::Pong,
        })
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();

        match client.status().await.unwrap() {
            IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                listen_addr,
            } => {
                assert!(running);
                assert_eq!(uptime_secs, 100);
                assert_eq!(session_count, 1);
                assert_eq!(listen_addr.as_deref(), Some("127.0.0.1:8080"));
            }
            other => panic!("Expected Status response, got {other:?}"),
        }

        match client.list_sessions().await.unwrap() {
            IpcResponse::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].pid, Some(10));
            }
            other => panic!("Expected Sessions response, got {other:?}"),
        }

        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);
    }

    #[tokio::test]
    async fn test_kill_session() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _shutdown = fake_daemon(&socket_path, |request| match request {
            IpcRequest::KillSession { session_id } => IpcResponse::SessionKilled { session_id },
            _ => IpcResponse::Pong,
        })
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let response = client.kill_session("0123abcd").await.unwrap();
        assert_eq!(
            response,
            IpcResponse::SessionKilled {
                session_id: "0123abcd".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        // Accepts but never answers.
        let _server_handle = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .unwrap();

        match client.ping().await {
            Err(IpcError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}

//! IPC server for the daemon's control socket.
//!
//! The server accepts CLI connections on a Unix socket and answers one
//! response per request until the client hangs up.

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::{IpcRequest, IpcResponse};

/// A server that listens for IPC connections on a Unix Domain Socket.
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created with mode 0700. A stale socket file at
    /// the path is replaced.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Answer requests with `handler` until `shutdown` fires.
    ///
    /// Each client is served on its own task. A request that fails to parse
    /// gets an [`IpcResponse::Error`] and the connection stays open.
    pub async fn serve<H, Fut>(self, handler: H, shutdown: CancellationToken)
    where
        H: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IpcResponse> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(handle_client(conn, Arc::clone(&handler)));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                },
            }
        }

        debug!(path = %self.path.display(), "Control socket closed");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_client<H, Fut>(mut conn: IpcConnection, handler: Arc<H>)
where
    H: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IpcResponse> + Send + 'static,
{
    loop {
        let response = match conn.read_request().await {
            Ok(Some(request)) => {
                debug!(request = ?request, "Control request");
                handler(request).await
            }
            Ok(None) => break,
            Err(IpcError::Json(e)) => IpcResponse::Error {
                message: format!("invalid request: {e}"),
            },
            Err(IpcError::Io(e)) => {
                debug!(error = %e, "Control connection failed");
                break;
            }
        };

        if let Err(e) = conn.send_response(&response).await {
            debug!(error = %e, "Failed to send control response");
            break;
        }
    }
}

/// A connection to an IPC client.
///
/// Wraps a Unix stream and speaks the newline-delimited JSON protocol.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

//! Transport listener: accepts TCP connections and upgrades them to
//! WebSocket terminal connections.
//!
//! Each accepted socket is handled on its own task, so a slow handshake
//! never blocks the accept loop. The handshake decides which session the
//! client wants:
//!
//! | Request                    | Session                        |
//! |----------------------------|--------------------------------|
//! | `GET /ws`                  | new session                    |
//! | `GET /ws/{id}`             | rejoin `{id}`                  |
//! | `GET /ws?session={id}`     | rejoin `{id}`                  |
//!
//! The chosen session id is returned in the `x-webterm-session` response
//! header.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::ConnectionBridge;
use crate::config::ServerConfig;
use crate::orchestrator::OrchestratorEvent;
use crate::session::{RegistryError, SessionId, SessionRegistry, SessionTarget};
use crate::supervisor::CloseCause;

/// Response header carrying the session id.
pub const SESSION_HEADER: &str = "x-webterm-session";

/// Query parameters accepted as a session id.
const SESSION_QUERY_KEYS: &[&str] = &["session", "session_id"];

/// Time allowed for the HTTP upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Time allowed for cancelled bridges to send their close frames.
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// An HTTP-level refusal issued before the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: String,
}

impl Rejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.message));
        *response.status_mut() = self.status;
        response
    }
}

/// Check an upgrade request against the server configuration.
///
/// Returns the session id the client supplied, if any, or the HTTP error
/// to refuse the upgrade with.
pub fn inspect_request(
    uri: &Uri,
    origin: Option<&str>,
    config: &ServerConfig,
) -> Result<Option<String>, Rejection> {
    let base = config.path.trim_end_matches('/');
    let path = uri.path();

    let path_id = if path == base || path == format!("{base}/") {
        None
    } else {
        match path.strip_prefix(base).and_then(|rest| rest.strip_prefix('/')) {
            Some(rest) if !rest.contains('/') => Some(rest.to_string()),
            _ => return Err(Rejection::new(StatusCode::NOT_FOUND, "not found")),
        }
    };

    if !config.origin_allowed(origin) {
        return Err(Rejection::new(StatusCode::FORBIDDEN, "origin not allowed"));
    }

    let query_id = uri.query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| SESSION_QUERY_KEYS.contains(&key.as_ref()))
            .map(|(_, value)| value.into_owned())
    });

    Ok(path_id.or(query_id).filter(|id| !id.is_empty()))
}

/// Turn the supplied id into a registry target.
///
/// No id means a new session. An id that cannot be a session id is
/// reported as not found.
pub fn resolve_target(supplied: Option<&str>) -> Result<SessionTarget, RegistryError> {
    match supplied {
        None => Ok(SessionTarget::New(SessionId::generate())),
        Some(raw) => SessionId::parse(raw)
            .map(SessionTarget::Existing)
            .ok_or_else(|| RegistryError::NotFound(raw.to_string())),
    }
}

/// Shared state for connection tasks.
struct ConnectionContext {
    config: ServerConfig,
    ws_config: WebSocketConfig,
    registry: Arc<SessionRegistry>,
    events: broadcast::Sender<OrchestratorEvent>,
    /// Cancelled when the shutdown grace period runs out.
    bridges: CancellationToken,
}

impl ConnectionContext {
    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }
}

/// Accepts WebSocket terminal connections until shutdown.
pub struct TransportListener {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    events: broadcast::Sender<OrchestratorEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TransportListener {
    /// Bind to `config.bind_addr`.
    pub async fn bind(
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
        events: broadcast::Sender<OrchestratorEvent>,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let addr = config
            .socket_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(addr).await?;

        info!(addr = %listener.local_addr()?, path = %config.path, "Listening for terminal connections");

        Ok(Self {
            listener,
            config,
            registry,
            events,
            shutdown,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepted connections, one at a time, forever.
    pub fn incoming(&self) -> impl Stream<Item = io::Result<(TcpStream, SocketAddr)>> + '_ {
        incoming(&self.listener)
    }

    /// Number of connections currently being handled.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Accept connections until the shutdown token fires, then drain.
    ///
    /// In-flight connections get `shutdown_grace` to finish on their own;
    /// whatever is left after that is closed with "going away".
    pub async fn serve(self) -> io::Result<()> {
        let TransportListener {
            listener,
            config,
            registry,
            events,
            shutdown,
            tracker,
        } = self;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_message_size);

        let grace = config.shutdown_grace();
        let ctx = Arc::new(ConnectionContext {
            config,
            ws_config,
            registry,
            events,
            bridges: CancellationToken::new(),
        });

        {
            let incoming = incoming(&listener);
            futures_util::pin_mut!(incoming);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = incoming.next() => match next {
                        Some(Ok((stream, peer))) => {
                            debug!(peer = %peer, "Accepted connection");
                            tracker.spawn(handle_connection(stream, peer, Arc::clone(&ctx)));
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        None => break,
                    },
                }
            }
        }
        drop(listener);

        tracker.close();
        if !tracker.is_empty() {
            info!(
                active = tracker.len(),
                grace_secs = grace.as_secs(),
                "Waiting for connections to finish"
            );
        }
        if timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                "Grace period elapsed, closing remaining connections"
            );
            ctx.bridges.cancel();
            let _ = timeout(FORCE_CLOSE_TIMEOUT, tracker.wait()).await;
        }

        info!("Listener stopped");
        Ok(())
    }
}

fn incoming(
    listener: &TcpListener,
) -> impl Stream<Item = io::Result<(TcpStream, SocketAddr)>> + '_ {
    stream::unfold(listener, |listener| async move {
        Some((listener.accept().await, listener))
    })
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) {
    let _ = stream.set_nodelay(true);

    let mut requested: Option<Result<SessionTarget, RegistryError>> = None;
    let callback = |request: &Request, mut response: Response| {
        let origin = request
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());

        let supplied = match inspect_request(request.uri(), origin, &ctx.config) {
            Ok(supplied) => supplied,
            Err(rejection) => {
                info!(
                    peer = %peer,
                    uri = %request.uri(),
                    origin = ?origin,
                    status = rejection.status.as_u16(),
                    "Refused upgrade"
                );
                return Err(rejection.into_response());
            }
        };

        let target = resolve_target(supplied.as_deref());
        if let Ok(target) = &target {
            if let Ok(value) = HeaderValue::from_str(target.id().as_str()) {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
        }
        requested = Some(target);
        Ok(response)
    };

    let handshake = timeout(
        HANDSHAKE_TIMEOUT,
        accept_hdr_async_with_config(stream, callback, Some(ctx.ws_config)),
    )
    .await;
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };

    let Some(target) = requested else {
        return;
    };

    let target = match target {
        Ok(target) => target,
        Err(e) => return reject(ws, peer, &e).await,
    };

    let (session, created) = match ctx.registry.get_or_create(&target) {
        Ok(resolved) => resolved,
        Err(e) => return reject(ws, peer, &e).await,
    };
    let session_id = session.id().clone();
    if created {
        ctx.emit(OrchestratorEvent::SessionCreated {
            session_id: session_id.clone(),
        });
    }

    let bridge_id = Uuid::new_v4();
    if let Err(e) = ctx.registry.attach(&session_id, bridge_id) {
        return reject(ws, peer, &e).await;
    }

    ctx.emit(OrchestratorEvent::BridgeOpened {
        bridge_id,
        session_id: session_id.clone(),
        peer,
    });

    let summary = ConnectionBridge::new(bridge_id, ctx.bridges.child_token())
        .with_peer(peer)
        .with_ping_interval(ctx.config.ping_interval())
        .run(ws, Arc::clone(&session))
        .await;

    ctx.registry.detach(&session_id, bridge_id);

    if (summary.outcome.session_ended() || session.state().is_ending())
        && reclaim_ended(&ctx.registry, &session_id).await
    {
        ctx.emit(OrchestratorEvent::SessionClosed {
            session_id: session_id.clone(),
            cause: CloseCause::Exited,
        });
    }

    ctx.emit(OrchestratorEvent::BridgeClosed {
        bridge_id,
        session_id,
        outcome: summary.outcome,
    });
}

/// Remove a session whose bridge saw it end, closing it if nobody has.
///
/// Returns true only if this call did the closing. Sessions closed by the
/// supervisor already reported their own cause.
async fn reclaim_ended(registry: &SessionRegistry, session_id: &SessionId) -> bool {
    let Some(ended) = registry.remove_if_detached(session_id) else {
        return false;
    };
    if ended.is_closed() {
        return false;
    }
    if let Err(e) = ended.close().await {
        warn!(session_id = %session_id, error = %e, "Failed to close session");
    }
    true
}

/// Refuse an upgraded connection with a close frame.
async fn reject<S>(mut ws: WebSocketStream<S>, peer: SocketAddr, error: &RegistryError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = error.close_reason();
    info!(peer = %peer, code = reason.code, error = %error, "Rejecting connection");

    if let RegistryError::Session(e) = error {
        let notice = format!("\r\nwebterm: {e}\r\n");
        let _ = ws.send(Message::Binary(notice.into_bytes())).await;
    }

    let frame = CloseFrame {
        code: CloseCode::from(reason.code),
        reason: Cow::Borrowed(reason.reason),
    };
    if ws.close(Some(frame)).await.is_ok() {
        // Wait briefly for the client's close reply.
        let _ = timeout(FORCE_CLOSE_TIMEOUT, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
    }
}

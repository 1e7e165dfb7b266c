//! Connection bridge: relays one WebSocket connection to one PTY session.
//!
//! Two pumps run as separate tasks:
//!
//! ```text
//!   client ──binary──▶ inbound pump ──write──▶ PTY
//!          ──text────▶              ──resize─▶
//!   client ◀─binary── outbound pump ◀─read─── PTY
//!          ◀─ping────
//! ```
//!
//! The bridge ends as soon as either pump finishes. The other pump is
//! cancelled through the shared token and the client gets a close frame
//! whose code says why.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{truncate_reason, CloseReason, Frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Interval};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{BridgeId, OutputStream, PtySession, SessionError, SessionId};

/// How long a cancelled pump gets to stop before it is aborted.
const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on sending the final close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type SharedSink<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// Why a bridge ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The client closed the connection.
    ClientClosed,
    /// The PTY closed: the shell exited or the session was closed.
    SessionEnded,
    /// The client sent a frame that is not valid protocol.
    ProtocolViolation(String),
    /// The WebSocket failed.
    TransportFailed(String),
    /// Writing to the PTY failed.
    PtyFailed(String),
    /// Another bridge holds the session's output.
    OutputBusy,
    /// The server is shutting down.
    Shutdown,
}

impl BridgeOutcome {
    /// Close code and default reason for this outcome.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            BridgeOutcome::ClientClosed | BridgeOutcome::SessionEnded => CloseReason::NORMAL,
            BridgeOutcome::ProtocolViolation(_) => CloseReason::PROTOCOL_ERROR,
            BridgeOutcome::TransportFailed(_) | BridgeOutcome::PtyFailed(_) => {
                CloseReason::INTERNAL_ERROR
            }
            BridgeOutcome::OutputBusy => CloseReason::SESSION_CONFLICT,
            BridgeOutcome::Shutdown => CloseReason::GOING_AWAY,
        }
    }

    /// The close frame to send, or `None` when the connection is already
    /// gone or the client started the close handshake.
    fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let reason = self.close_reason();
        let text = match self {
            BridgeOutcome::ClientClosed | BridgeOutcome::TransportFailed(_) => return None,
            BridgeOutcome::ProtocolViolation(detail) => {
                truncate_reason(&format!("{}: {}", reason.reason, detail)).to_string()
            }
            _ => reason.reason.to_string(),
        };
        Some(CloseFrame {
            code: CloseCode::from(reason.code),
            reason: Cow::Owned(text),
        })
    }

    /// True when the session itself is finished, not just this connection.
    pub fn session_ended(&self) -> bool {
        matches!(self, BridgeOutcome::SessionEnded | BridgeOutcome::PtyFailed(_))
    }

    fn from_session_error(err: SessionError) -> Self {
        match err {
            SessionError::Closed(_) => BridgeOutcome::SessionEnded,
            other => BridgeOutcome::PtyFailed(other.to_string()),
        }
    }
}

impl std::fmt::Display for BridgeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeOutcome::ClientClosed => write!(f, "client closed"),
            BridgeOutcome::SessionEnded => write!(f, "session ended"),
            BridgeOutcome::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            BridgeOutcome::TransportFailed(detail) => write!(f, "transport failed: {detail}"),
            BridgeOutcome::PtyFailed(detail) => write!(f, "pty failed: {detail}"),
            BridgeOutcome::OutputBusy => write!(f, "output busy"),
            BridgeOutcome::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Totals for one finished bridge.
#[derive(Debug, Clone)]
pub struct BridgeSummary {
    pub bridge_id: BridgeId,
    pub session_id: SessionId,
    pub outcome: BridgeOutcome,
    /// Input bytes written to the PTY.
    pub bytes_in: u64,
    /// Output bytes sent to the client.
    pub bytes_out: u64,
    pub resizes: u64,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    resizes: AtomicU64,
}

/// Relay between one WebSocket connection and one session.
pub struct ConnectionBridge {
    id: BridgeId,
    peer: Option<SocketAddr>,
    ping_interval: Option<Duration>,
    cancel: CancellationToken,
}

impl ConnectionBridge {
    /// Create a bridge. Cancelling `cancel` ends it with
    /// [`BridgeOutcome::Shutdown`].
    pub fn new(id: BridgeId, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer: None,
            ping_interval: None,
            cancel,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Send a WebSocket ping this often. `None` disables the heartbeat.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Pump bytes until either side closes, then close the connection.
    pub async fn run<S>(self, ws: WebSocketStream<S>, session: Arc<PtySession>) -> BridgeSummary
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let counters = Arc::new(Counters::default());
        let (sink, stream) = ws.split();
        let sink: SharedSink<S> = Arc::new(Mutex::new(sink));

        info!(
            bridge_id = %self.id,
            session_id = %session.id(),
            peer = ?self.peer,
            "Bridge started"
        );

        let outcome = match session.read() {
            Ok(output) => self.pump(output, stream, &session, &sink, &counters).await,
            Err(e) => {
                warn!(bridge_id = %self.id, session_id = %session.id(), error = %e, "Cannot read session output");
                BridgeOutcome::OutputBusy
            }
        };

        {
            let mut sink = sink.lock().await;
            if let Some(frame) = outcome.close_frame() {
                let _ = timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
            }
            let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
        }

        let summary = BridgeSummary {
            bridge_id: self.id,
            session_id: session.id().clone(),
            outcome,
            bytes_in: counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: counters.bytes_out.load(Ordering::Relaxed),
            resizes: counters.resizes.load(Ordering::Relaxed),
            duration: started.elapsed(),
        };

        info!(
            bridge_id = %summary.bridge_id,
            session_id = %summary.session_id,
            outcome = %summary.outcome,
            bytes_in = summary.bytes_in,
            bytes_out = summary.bytes_out,
            duration_ms = summary.duration.as_millis() as u64,
            "Bridge finished"
        );

        summary
    }

    /// Run both pumps and return the outcome of whichever finishes first.
    async fn pump<S>(
        &self,
        output: OutputStream,
        stream: SplitStream<WebSocketStream<S>>,
        session: &Arc<PtySession>,
        sink: &SharedSink<S>,
        counters: &Arc<Counters>,
    ) -> BridgeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let pumps = self.cancel.child_token();

        let mut outbound = tokio::spawn(pump_output(
            output,
            Arc::clone(session),
            Arc::clone(sink),
            self.ping_interval,
            pumps.clone(),
            Arc::clone(counters),
        ));
        let mut inbound = tokio::spawn(pump_input(
            stream,
            Arc::clone(session),
            self.id,
            pumps.clone(),
            Arc::clone(counters),
        ));

        let (first, outbound_finished) = tokio::select! {
            result = &mut outbound => (result, true),
            result = &mut inbound => (result, false),
        };
        let other = if outbound_finished { inbound } else { outbound };

        pumps.cancel();
        stop_pump(other).await;

        match first {
            Ok(outcome) => outcome,
            Err(e) => BridgeOutcome::TransportFailed(format!("pump task failed: {e}")),
        }
    }
}

/// Wait for a cancelled pump to finish, aborting it if it does not.
///
/// Returns only once the task is gone, so the session's output stream is
/// free for the next bridge.
async fn stop_pump(mut handle: JoinHandle<BridgeOutcome>) {
    if timeout(PUMP_STOP_TIMEOUT, &mut handle).await.is_err() {
        debug!("Pump did not stop in time, aborting");
        handle.abort();
        let _ = handle.await;
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// PTY to client.
async fn pump_output<S>(
    mut output: OutputStream,
    session: Arc<PtySession>,
    sink: SharedSink<S>,
    ping_interval: Option<Duration>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) -> BridgeOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut heartbeat = ping_interval
        .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

    let send = |message: Message| {
        let sink = Arc::clone(&sink);
        async move { sink.lock().await.send(message).await }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return BridgeOutcome::Shutdown,
            chunk = output.next() => match chunk {
                Some(data) => {
                    let len = data.len() as u64;
                    if let Err(e) = send(Message::Binary(data)).await {
                        return BridgeOutcome::TransportFailed(e.to_string());
                    }
                    counters.bytes_out.fetch_add(len, Ordering::Relaxed);
                }
                None => return BridgeOutcome::SessionEnded,
            },
            _ = session.closed() => {
                // Flush what the PTY produced before it was closed.
                for data in output.drain_ready() {
                    let len = data.len() as u64;
                    if send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                    counters.bytes_out.fetch_add(len, Ordering::Relaxed);
                }
                return BridgeOutcome::SessionEnded;
            }
            _ = tick(&mut heartbeat) => {
                if let Err(e) = send(Message::Ping(Vec::new())).await {
                    return BridgeOutcome::TransportFailed(e.to_string());
                }
            }
        }
    }
}

/// Client to PTY.
async fn pump_input<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    session: Arc<PtySession>,
    bridge_id: BridgeId,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) -> BridgeOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return BridgeOutcome::Shutdown,
            message = stream.next() => message,
        };

        let frame = match message {
            None | Some(Ok(Message::Close(_))) => return BridgeOutcome::ClientClosed,
            Some(Err(e)) => return BridgeOutcome::TransportFailed(e.to_string()),
            Some(Ok(Message::Binary(data))) => Frame::from_binary(data),
            Some(Ok(Message::Text(text))) => match Frame::from_text(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        bridge_id = %bridge_id,
                        session_id = %session.id(),
                        error = %e,
                        "Malformed control frame"
                    );
                    return BridgeOutcome::ProtocolViolation(e.to_string());
                }
            },
            // Pongs are answered by tungstenite itself.
            Some(Ok(_)) => continue,
        };

        match frame {
            Frame::Data(data) => {
                let len = data.len() as u64;
                if let Err(e) = session.write(&data).await {
                    return BridgeOutcome::from_session_error(e);
                }
                counters.bytes_in.fetch_add(len, Ordering::Relaxed);
            }
            Frame::Control(request) => match session.resize(request.rows, request.cols) {
                Ok(_) => {
                    counters.resizes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e @ SessionError::InvalidSize { .. }) => {
                    warn!(
                        bridge_id = %bridge_id,
                        session_id = %session.id(),
                        error = %e,
                        "Ignoring invalid resize"
                    );
                }
                Err(e) => return BridgeOutcome::from_session_error(e),
            },
        }
    }
}

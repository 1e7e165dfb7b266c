//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the session registry and runs the WebSocket
//! listener, the lifecycle supervisor and the control socket. Stopping it
//! drains connections, then closes every session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::BridgeOutcome;
use crate::config::Config;
use crate::ipc::pidfile::{remove_pid_file, write_pid_file};
use crate::ipc::{IpcRequest, IpcResponse, IpcServer, IpcSessionInfo};
use crate::listener::TransportListener;
use crate::session::{lock, SessionId, SessionRegistry};
use crate::supervisor::{CloseCause, LifecycleSupervisor};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shortest id prefix accepted by kill requests.
const MIN_ID_PREFIX: usize = 4;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding sockets.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator and its components.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The WebSocket listener is bound.
    Listening(SocketAddr),
    /// A PTY session was spawned.
    SessionCreated { session_id: SessionId },
    /// A PTY session was closed.
    SessionClosed {
        session_id: SessionId,
        cause: CloseCause,
    },
    /// A client was attached to a session.
    BridgeOpened {
        bridge_id: Uuid,
        session_id: SessionId,
        peer: SocketAddr,
    },
    /// A client was detached from a session.
    BridgeClosed {
        bridge_id: Uuid,
        session_id: SessionId,
        outcome: BridgeOutcome,
    },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    supervisor: Arc<LifecycleSupervisor>,
    /// Control socket path, if the control socket is enabled.
    ipc_socket: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    local_addr: Option<SocketAddr>,
    started_at: Option<Instant>,
    /// Listener first, so it drains before sessions are closed.
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    /// Cancelled to stop every background task.
    shutdown_token: CancellationToken,
    /// Cancelled when a client asks the daemon to stop.
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator. Nothing is bound until [`start`].
    ///
    /// [`start`]: DaemonOrchestrator::start
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let registry = Arc::new(SessionRegistry::from_config(&config.session));
        let supervisor = Arc::new(
            LifecycleSupervisor::new(Arc::clone(&registry), config.supervisor.clone())
                .with_events(event_tx.clone()),
        );

        debug!(
            shell = %config.session.shell,
            max_sessions = config.session.max_sessions,
            "Session registry ready"
        );

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            supervisor,
            ipc_socket: None,
            pid_file: None,
            local_addr: None,
            started_at: None,
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        })
    }

    /// Serve the control socket at `path` while running.
    pub fn with_ipc_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.ipc_socket = Some(path.into());
        self
    }

    /// Record the daemon's PID at `path` while running.
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    async fn set_state(&self, state: OrchestratorState) {
        *self.state.write().await = state;
        self.emit_event(OrchestratorEvent::StateChanged(state));
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the listener, supervisor and control socket.
    ///
    /// Returns the address the listener is bound to.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator cannot be restarted after stop");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        match self.spawn_components().await {
            Ok(addr) => {
                self.local_addr = Some(addr);
                self.started_at = Some(Instant::now());
                self.set_state(OrchestratorState::Running).await;
                info!(addr = %addr, "Daemon orchestrator started successfully");
                Ok(addr)
            }
            Err(e) => {
                error!(error = %e, "Failed to start daemon orchestrator");
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("{e:#}"),
                });
                self.shutdown_token.cancel();
                self.join_tasks().await;
                self.shutdown_token = CancellationToken::new();
                self.set_state(OrchestratorState::Stopped).await;
                Err(e)
            }
        }
    }

    async fn spawn_components(&mut self) -> Result<SocketAddr> {
        let listener = TransportListener::bind(
            self.config.server.clone(),
            Arc::clone(&self.registry),
            self.event_tx.clone(),
            self.shutdown_token.child_token(),
        )
        .await
        .with_context(|| format!("Failed to bind {}", self.config.server.bind_addr))?;
        let addr = listener.local_addr()?;
        self.emit_event(OrchestratorEvent::Listening(addr));

        let event_tx = self.event_tx.clone();
        self.track(
            "listener",
            tokio::spawn(async move {
                if let Err(e) = listener.serve().await {
                    error!(error = %e, "Listener failed");
                    let _ = event_tx.send(OrchestratorEvent::Error {
                        message: format!("listener failed: {e}"),
                    });
                }
            }),
        );

        let supervisor = Arc::clone(&self.supervisor);
        let shutdown = self.shutdown_token.child_token();
        self.track(
            "supervisor",
            tokio::spawn(async move { supervisor.run(shutdown).await }),
        );
        debug!("Started lifecycle supervisor");

        if let Some(path) = &self.ipc_socket {
            let server = IpcServer::bind(path)
                .await
                .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
            info!(path = %path.display(), "Control socket ready");

            let control = Arc::new(ControlHandler {
                registry: Arc::clone(&self.registry),
                supervisor: Arc::clone(&self.supervisor),
                started_at: Instant::now(),
                listen_addr: addr,
                stop_requested: self.stop_requested.clone(),
            });
            let shutdown = self.shutdown_token.child_token();
            self.track(
                "control",
                tokio::spawn(server.serve(
                    move |request| {
                        let control = Arc::clone(&control);
                        async move { control.handle(request).await }
                    },
                    shutdown,
                )),
            );
        }

        if let Some(path) = &self.pid_file {
            write_pid_file(path)
                .with_context(|| format!("Failed to write PID file {}", path.display()))?;
            debug!(path = %path.display(), "Wrote PID file");
        }

        Ok(addr)
    }

    fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        lock(&self.tasks).push((name, handle));
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background task failed");
            }
        }
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Connections get the configured grace period, then every session is
    /// closed. Calling this on a stopped orchestrator does nothing.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        self.join_tasks().await;

        let closed = self.supervisor.shutdown_all().await;
        debug!(closed, "Sessions closed");

        if let Some(path) = &self.pid_file {
            if remove_pid_file(path) {
                debug!(path = %path.display(), "Removed PID file");
            }
        }

        self.set_state(OrchestratorState::Stopped).await;

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<LifecycleSupervisor> {
        &self.supervisor
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Time since the last successful start.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Resolves when a client asks the daemon to stop over the control socket.
    pub fn stop_requested(&self) -> WaitForCancellationFutureOwned {
        self.stop_requested.clone().cancelled_owned()
    }
}

/// Answers control socket requests.
struct ControlHandler {
    registry: Arc<SessionRegistry>,
    supervisor: Arc<LifecycleSupervisor>,
    started_at: Instant,
    listen_addr: SocketAddr,
    stop_requested: CancellationToken,
}

impl ControlHandler {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.registry.len(),
                listen_addr: Some(self.listen_addr.to_string()),
            },
            IpcRequest::Stop => {
                info!("Stop requested over control socket");
                self.stop_requested.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self
                    .registry
                    .snapshot()
                    .iter()
                    .map(IpcSessionInfo::from)
                    .collect(),
            },
            IpcRequest::KillSession { session_id } => match self.resolve(&session_id) {
                Ok(id) => {
                    if self.supervisor.kill(&id).await {
                        IpcResponse::SessionKilled {
                            session_id: id.to_string(),
                        }
                    } else {
                        IpcResponse::Error {
                            message: format!("session not found: {id}"),
                        }
                    }
                }
                Err(message) => IpcResponse::Error { message },
            },
        }
    }

    /// Match a full id or a unique prefix of at least [`MIN_ID_PREFIX`] chars.
    fn resolve(&self, raw: &str) -> Result<SessionId, String> {
        if let Some(id) = SessionId::parse(raw) {
            return Ok(id);
        }

        let prefix = raw.trim().to_ascii_lowercase();
        if prefix.len() < MIN_ID_PREFIX {
            return Err(format!("invalid session id: {raw:?}"));
        }

        let mut matches = self
            .registry
            .snapshot()
            .into_iter()
            .map(|info| info.id)
            .filter(|id| id.as_str().starts_with(&prefix));

        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id),
            (None, _) => Err(format!("session not found: {prefix}")),
            (Some(_), Some(_)) => Err(format!("session id prefix is ambiguous: {prefix}")),
        }
    }
}

//! Lifecycle supervisor.
//!
//! Periodically sweeps the registry and reclaims sessions whose shell has
//! exited, that have been idle too long, or that have had no client
//! attached for too long. Closed sessions with no client are removed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::orchestrator::OrchestratorEvent;
use crate::session::{PtySession, SessionId, SessionRegistry};

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The shell exited.
    Exited,
    /// No input or output within the idle timeout.
    Idle,
    /// No client attached within the orphan timeout.
    Orphaned,
    /// Closed on request over the control socket.
    Killed,
    /// The daemon is shutting down.
    Shutdown,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CloseCause::Exited => "exited",
            CloseCause::Idle => "idle",
            CloseCause::Orphaned => "orphaned",
            CloseCause::Killed => "killed",
            CloseCause::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub exited: usize,
    pub idle: usize,
    pub orphaned: usize,
    /// Sessions dropped from the registry.
    pub removed: usize,
}

impl SweepReport {
    pub fn closed(&self) -> usize {
        self.exited + self.idle + self.orphaned
    }

    pub fn is_empty(&self) -> bool {
        self.closed() == 0 && self.removed == 0
    }
}

/// Reclaims sessions that are no longer needed.
pub struct LifecycleSupervisor {
    registry: Arc<SessionRegistry>,
    config: SupervisorConfig,
    events: Option<broadcast::Sender<OrchestratorEvent>>,
}

impl LifecycleSupervisor {
    pub fn new(registry: Arc<SessionRegistry>, config: SupervisorConfig) -> Self {
        Self {
            registry,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit_closed(&self, session_id: SessionId, cause: CloseCause) {
        if let Some(events) = &self.events {
            let _ = events.send(OrchestratorEvent::SessionClosed { session_id, cause });
        }
    }

    async fn close(&self, session: &PtySession, cause: CloseCause) {
        info!(session_id = %session.id(), cause = %cause, "Closing session");
        if let Err(e) = session.close().await {
            warn!(session_id = %session.id(), error = %e, "Failed to close session");
        }
        self.emit_closed(session.id().clone(), cause);
    }

    /// One pass over every session.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let idle_timeout = self.config.idle_timeout();
        let orphan_timeout = self.config.orphan_timeout();

        // Attachment can change while earlier sessions are being closed, so
        // the idle and orphan checks are made by the registry under its lock.
        for session_id in self.registry.ids() {
            let Some(session) = self.registry.get(&session_id) else {
                continue;
            };

            if !session.is_closed() {
                if self.has_exited(&session) {
                    // An attached bridge sees the close and ends on its own.
                    self.close(&session, CloseCause::Exited).await;
                    report.exited += 1;
                } else if let Some((idle, removed)) =
                    idle_timeout.and_then(|limit| self.registry.take_if_idle(&session_id, limit))
                {
                    self.close(&idle, CloseCause::Idle).await;
                    report.idle += 1;
                    if removed {
                        report.removed += 1;
                        continue;
                    }
                } else if let Some(orphan) = orphan_timeout
                    .and_then(|limit| self.registry.take_if_orphaned(&session_id, limit))
                {
                    self.close(&orphan, CloseCause::Orphaned).await;
                    report.orphaned += 1;
                    report.removed += 1;
                    continue;
                }
            }

            if session.is_closed() && self.registry.remove_if_detached(&session_id).is_some() {
                report.removed += 1;
            }
        }

        if !report.is_empty() {
            info!(
                exited = report.exited,
                idle = report.idle,
                orphaned = report.orphaned,
                removed = report.removed,
                remaining = self.registry.len(),
                "Sweep reclaimed sessions"
            );
        }

        report
    }

    fn has_exited(&self, session: &PtySession) -> bool {
        match session.try_wait() {
            Ok(Some(code)) => {
                debug!(session_id = %session.id(), exit_code = code, "Shell exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Failed to poll shell status");
                false
            }
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            interval_secs = self.config.sweep_interval_secs,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }

        debug!("Supervisor stopped");
    }

    /// Close one session on request. Returns false if it does not exist.
    pub async fn kill(&self, session_id: &SessionId) -> bool {
        let Some(session) = self.registry.get(session_id) else {
            return false;
        };
        self.close(&session, CloseCause::Killed).await;
        // An attached bridge removes the session when it finishes.
        self.registry.remove_if_detached(session_id);
        true
    }

    /// Close and remove every session. Returns how many were closed.
    pub async fn shutdown_all(&self) -> usize {
        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            self.close(&session, CloseCause::Shutdown).await;
        }
        if count > 0 {
            info!(count, "Closed all sessions");
        }
        count
    }
}

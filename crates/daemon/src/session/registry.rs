//! Session registry.
//!
//! The registry is the single owner of all sessions. Every mutation of the
//! session map happens under one mutex, so capacity checks, inserts and
//! attachment changes never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use protocol::{CloseReason, TerminalSize};
use thiserror::Error;
use uuid::Uuid;

use super::pty::{PtySession, SessionError, SessionState, ShellCommand, DEFAULT_OUTPUT_BUFFER};
use super::SessionId;
use crate::config::SessionConfig;

/// Identifies one connection bridge.
pub type BridgeId = Uuid;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Creating another session would exceed the configured limit.
    #[error("session limit reached ({max} sessions)")]
    AtCapacity { max: usize },

    /// The session already has a client attached.
    #[error("session {0} already has a client attached")]
    Conflict(SessionId),

    /// No session with the supplied id exists.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session exists but is closing or closed.
    #[error("session {0} has ended")]
    Ended(SessionId),

    /// Spawning the session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RegistryError {
    /// Close frame sent to a client rejected with this error.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            RegistryError::AtCapacity { .. } => CloseReason::TRY_AGAIN_LATER,
            RegistryError::Conflict(_) => CloseReason::SESSION_CONFLICT,
            RegistryError::NotFound(_) => CloseReason::SESSION_NOT_FOUND,
            RegistryError::Ended(_) => CloseReason::new(4404, "session has ended"),
            RegistryError::Session(_) => CloseReason::new(1011, "failed to start terminal"),
        }
    }
}

/// Which session a connection wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// Create a session under this freshly generated id.
    New(SessionId),
    /// Rejoin an existing session.
    Existing(SessionId),
}

impl SessionTarget {
    pub fn id(&self) -> &SessionId {
        match self {
            SessionTarget::New(id) | SessionTarget::Existing(id) => id,
        }
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub size: TerminalSize,
    pub attached: bool,
    pub created_at: SystemTime,
    pub idle: Duration,
}

struct SessionEntry {
    session: Arc<PtySession>,
    owner: Option<BridgeId>,
    detached_since: Option<Instant>,
}

/// Owner of all live sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    command: ShellCommand,
    default_size: TerminalSize,
    max_sessions: usize,
    output_buffer: usize,
}

impl SessionRegistry {
    pub fn new(command: ShellCommand, default_size: TerminalSize, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            command,
            default_size,
            max_sessions,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            ShellCommand::from_config(config),
            config.default_size(),
            config.max_sessions,
        )
        .with_output_buffer(config.output_buffer)
    }

    pub fn with_output_buffer(mut self, chunks: usize) -> Self {
        self.output_buffer = chunks;
        self
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        super::lock(&self.sessions)
    }

    /// Resolve a target to a session, spawning one for [`SessionTarget::New`].
    ///
    /// Returns the session and whether it was created by this call.
    pub fn get_or_create(
        &self,
        target: &SessionTarget,
    ) -> Result<(Arc<PtySession>, bool), RegistryError> {
        let mut sessions = self.lock();

        match target {
            SessionTarget::Existing(id) => {
                let entry = sessions
                    .get(id)
                    .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
                if entry.session.state().is_ending() {
                    return Err(RegistryError::Ended(id.clone()));
                }
                Ok((Arc::clone(&entry.session), false))
            }
            SessionTarget::New(id) => {
                if let Some(entry) = sessions.get(id) {
                    return Ok((Arc::clone(&entry.session), false));
                }

                if sessions.len() >= self.max_sessions {
                    tracing::warn!(
                        max_sessions = self.max_sessions,
                        "Session limit reached, refusing new session"
                    );
                    return Err(RegistryError::AtCapacity {
                        max: self.max_sessions,
                    });
                }

                let session = Arc::new(PtySession::spawn_with_buffer(
                    id.clone(),
                    &self.command,
                    self.default_size,
                    self.output_buffer,
                )?);
                sessions.insert(
                    id.clone(),
                    SessionEntry {
                        session: Arc::clone(&session),
                        owner: None,
                        detached_since: Some(Instant::now()),
                    },
                );

                tracing::info!(
                    session_id = %id,
                    pid = ?session.pid(),
                    total = sessions.len(),
                    "Created new session"
                );

                Ok((session, true))
            }
        }
    }

    /// Bind a bridge to a session. Only one bridge may own a session.
    pub fn attach(
        &self,
        session_id: &SessionId,
        bridge: BridgeId,
    ) -> Result<Arc<PtySession>, RegistryError> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        if let Some(owner) = entry.owner {
            tracing::debug!(
                session_id = %session_id,
                owner = %owner,
                bridge_id = %bridge,
                "Attach refused, session already owned"
            );
            return Err(RegistryError::Conflict(session_id.clone()));
        }
        if entry.session.state().is_ending() {
            return Err(RegistryError::Ended(session_id.clone()));
        }

        entry.owner = Some(bridge);
        entry.detached_since = None;
        tracing::debug!(session_id = %session_id, bridge_id = %bridge, "Bridge attached");

        Ok(Arc::clone(&entry.session))
    }

    /// Unbind a bridge. Does nothing unless `bridge` is the current owner.
    pub fn detach(&self, session_id: &SessionId, bridge: BridgeId) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(entry) if entry.owner == Some(bridge) => {
                entry.owner = None;
                entry.detached_since = Some(Instant::now());
                tracing::debug!(session_id = %session_id, bridge_id = %bridge, "Bridge detached");
                true
            }
            _ => false,
        }
    }

    /// Remove a session from the registry.
    ///
    /// The session is not closed; callers close the returned handle.
    pub fn remove(&self, session_id: &SessionId) -> Option<Arc<PtySession>> {
        let removed = self.lock().remove(session_id).map(|entry| entry.session);
        if removed.is_some() {
            tracing::debug!(session_id = %session_id, "Session removed from registry");
        }
        removed
    }

    /// Remove a session only if no bridge is attached to it.
    pub fn remove_if_detached(&self, session_id: &SessionId) -> Option<Arc<PtySession>> {
        let mut sessions = self.lock();
        if sessions.get(session_id)?.owner.is_some() {
            return None;
        }
        sessions.remove(session_id).map(|entry| entry.session)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<PtySession>> {
        self.lock()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// The bridge currently attached to a session.
    pub fn owner(&self, session_id: &SessionId) -> Option<BridgeId> {
        self.lock().get(session_id).and_then(|entry| entry.owner)
    }

    /// Info for every session, oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .lock()
            .values()
            .map(|entry| SessionInfo {
                id: entry.session.id().clone(),
                pid: entry.session.pid(),
                state: entry.session.state(),
                size: entry.session.size(),
                attached: entry.owner.is_some(),
                created_at: entry.session.created_at(),
                idle: entry.session.idle_for(),
            })
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Ids of every session, in no particular order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.lock().keys().cloned().collect()
    }

    /// Remove a session that has had no bridge for at least `limit`.
    ///
    /// The check and the removal happen under the map lock, so a client
    /// that attaches first keeps its session and one that arrives later
    /// finds it gone.
    pub fn take_if_orphaned(
        &self,
        session_id: &SessionId,
        limit: Duration,
    ) -> Option<Arc<PtySession>> {
        let mut sessions = self.lock();
        let entry = sessions.get(session_id)?;
        let orphaned = entry.owner.is_none()
            && entry
                .detached_since
                .is_some_and(|since| since.elapsed() >= limit);
        if !orphaned {
            return None;
        }
        sessions.remove(session_id).map(|entry| entry.session)
    }

    /// Claim a session with no input or output for at least `limit`.
    ///
    /// A detached session is removed under the map lock and the second
    /// value is true. An attached one stays registered for its bridge to
    /// clean up.
    pub fn take_if_idle(
        &self,
        session_id: &SessionId,
        limit: Duration,
    ) -> Option<(Arc<PtySession>, bool)> {
        let mut sessions = self.lock();
        let entry = sessions.get(session_id)?;
        if entry.session.is_closed() || entry.session.idle_for() < limit {
            return None;
        }
        if entry.owner.is_some() {
            return Some((Arc::clone(&entry.session), false));
        }
        sessions
            .remove(session_id)
            .map(|entry| (entry.session, true))
    }

    /// Remove and return every session.
    pub(crate) fn drain(&self) -> Vec<Arc<PtySession>> {
        self.lock().drain().map(|(_, entry)| entry.session).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

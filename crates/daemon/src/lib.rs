//! # webterm daemon
//!
//! Owns shell sessions running in pseudo-terminals and bridges them to
//! WebSocket clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐        ┌──────────────────────┐  │
//! │  │ Transport Listener │───────▶│  Connection Bridge   │  │
//! │  │  (WebSocket, TCP)  │        │  (one per client)    │  │
//! │  └────────────────────┘        └──────────┬───────────┘  │
//! │                                           │              │
//! │  ┌────────────────────┐        ┌──────────▼───────────┐  │
//! │  │ Lifecycle          │───────▶│  Session Registry    │  │
//! │  │ Supervisor         │        │  (PTY sessions)      │  │
//! │  └────────────────────┘        └──────────────────────┘  │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │        Control socket (CLI over Unix socket)       │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     let addr = orchestrator.start().await?;
//!     println!("listening on {addr}");
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and the registry that owns them
//! - [`bridge`]: Pumps bytes between one WebSocket and one session
//! - [`listener`]: Accepts WebSocket connections and routes them to sessions
//! - [`supervisor`]: Reclaims exited, idle and orphaned sessions
//! - [`ipc`]: Control socket for the CLI
//! - [`logging`]: Tracing subscriber setup
//! - [`orchestrator`]: Main daemon coordinator

pub mod bridge;
pub mod config;
pub mod ipc;
pub mod listener;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod supervisor;

// Re-export protocol for convenience
pub use protocol;

pub use bridge::{BridgeOutcome, BridgeSummary, ConnectionBridge};
pub use config::Config;
pub use listener::{inspect_request, resolve_target, Rejection, TransportListener, SESSION_HEADER};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use session::{
    BridgeId, PtySession, RegistryError, SessionError, SessionId, SessionInfo, SessionRegistry,
    SessionState, SessionTarget, ShellCommand,
};
pub use supervisor::{CloseCause, LifecycleSupervisor, SweepReport};

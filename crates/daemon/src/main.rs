//! webterm
//!
//! Serves shell sessions to WebSocket clients.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, is_daemon_running, IpcClient,
    IpcResponse, IpcSessionInfo,
};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};

/// How long CLI commands wait to reach the daemon.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// webterm - browser terminals backed by local shell sessions.
#[derive(Parser, Debug)]
#[command(name = "webterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long, short, value_name = "ADDR")]
        bind: Option<String>,

        /// Shell to run in each session (overrides config)
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage live sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Close a session
    Kill {
        /// Session ID, or a unique prefix of one
        session_id: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // `config init` must work even when the existing file does not parse.
    if run_without_config(&cli.command, &config_path)? {
        return Ok(());
    }

    let mut config = Config::load(&config_path)?;
    let overrides = config.apply_env_overrides();

    let _log_guard = daemon::logging::init(&config.logging, cli.verbose)?;
    tracing::debug!(path = %config_path.display(), "Configuration loaded");
    for (setting, value) in overrides {
        tracing::info!(setting, value = %value, "Overriding setting from environment");
    }

    match cli.command {
        Commands::Serve { bind, shell } => {
            apply_serve_overrides(&mut config, bind, shell);

            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  webterm stop");
                std::process::exit(1);
            }

            let orchestrator = DaemonOrchestrator::new(config)?
                .with_ipc_socket(get_socket_path())
                .with_pid_file(get_pid_file_path());

            run_foreground(orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::debug!(force, timeout, "Stopping daemon");

            let result = if force {
                force_stop_daemon()
            } else {
                graceful_stop_daemon(timeout).await
            };

            match result {
                Ok(()) => {
                    println!("Daemon stopped");
                    std::process::exit(0);
                }
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: webterm stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query_daemon_status().await {
            Ok(status) => {
                println!(
                    "Daemon Status: {}",
                    if status.running { "running" } else { "stopped" }
                );
                println!("  Uptime:    {}", format_duration(status.uptime_secs));
                println!("  Sessions:  {}", status.session_count);
                if let Some(addr) = status.listen_addr {
                    println!("  Listening: {}", addr);
                }
                if let Some(pid) = get_daemon_pid() {
                    println!("  PID:       {}", pid);
                }
            }
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => match cmd {
            SessionsCommands::List { json } => match query_sessions_list().await {
                Ok(sessions) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                Err(e) => {
                    eprintln!("Failed to list sessions: {}", e);
                    std::process::exit(1);
                }
            },
            SessionsCommands::Kill { session_id } => match kill_session(&session_id).await {
                Ok(killed) => println!("Session {} closed", killed),
                Err(e) => {
                    eprintln!("Failed to close session {}: {}", session_id, e);
                    std::process::exit(1);
                }
            },
        },
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                println!("# {}", config_path.display());
                print!("{}", config.to_toml()?);
            }
            // Handled by `run_without_config`.
            ConfigCommands::Init { .. } => {}
        },
    }

    Ok(())
}

/// Run commands that must not load the configuration first.
///
/// Returns true if `command` was one of them.
fn run_without_config(command: &Commands, config_path: &Path) -> anyhow::Result<bool> {
    match command {
        Commands::Config(ConfigCommands::Init { force }) => {
            init_config_file(config_path, *force)?;
            println!("Wrote default configuration to {}", config_path.display());
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Apply `serve` flags on top of the loaded configuration.
fn apply_serve_overrides(config: &mut Config, bind: Option<String>, shell: Option<String>) {
    if let Some(bind) = bind {
        config.server.bind_addr = bind;
    }
    if let Some(shell) = shell {
        config.session.shell = shell;
    }
}

fn init_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)
}

/// Run the daemon until a signal or a stop request arrives.
async fn run_foreground(mut orchestrator: DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(event);
        }
    });

    let addr = orchestrator.start().await?;
    tracing::info!(
        "Serving terminals on ws://{}{}",
        addr,
        orchestrator.config().server.path
    );

    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = orchestrator.stop_requested() => {
            tracing::info!("Received stop request");
        }
    }

    orchestrator.stop().await
}

fn log_event(event: OrchestratorEvent) {
    match event {
        OrchestratorEvent::StateChanged(state) => {
            tracing::debug!("Orchestrator state: {:?}", state);
        }
        OrchestratorEvent::Listening(addr) => {
            tracing::debug!(addr = %addr, "Listener bound");
        }
        OrchestratorEvent::SessionCreated { session_id } => {
            tracing::debug!(session_id = %session_id, "Session created");
        }
        OrchestratorEvent::SessionClosed { session_id, cause } => {
            tracing::debug!(session_id = %session_id, cause = %cause, "Session closed");
        }
        OrchestratorEvent::BridgeOpened {
            bridge_id,
            session_id,
            peer,
        } => {
            tracing::debug!(bridge_id = %bridge_id, session_id = %session_id, peer = %peer, "Client attached");
        }
        OrchestratorEvent::BridgeClosed {
            bridge_id,
            session_id,
            outcome,
        } => {
            tracing::debug!(bridge_id = %bridge_id, session_id = %session_id, outcome = %outcome, "Client detached");
        }
        OrchestratorEvent::Error { message } => {
            tracing::error!("Orchestrator error: {}", message);
        }
    }
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}

async fn connect_daemon() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Daemon status as reported over IPC.
struct DaemonStatus {
    running: bool,
    uptime_secs: u64,
    session_count: usize,
    listen_addr: Option<String>,
}

async fn query_daemon_status() -> anyhow::Result<DaemonStatus> {
    let mut client = connect_daemon().await?;

    match client.status().await? {
        IpcResponse::Status {
            running,
            uptime_secs,
            session_count,
            listen_addr,
        } => Ok(DaemonStatus {
            running,
            uptime_secs,
            session_count,
            listen_addr,
        }),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

async fn query_sessions_list() -> anyhow::Result<Vec<IpcSessionInfo>> {
    let mut client = connect_daemon().await?;

    match client.list_sessions().await? {
        IpcResponse::Sessions { sessions } => Ok(sessions),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Close a session via IPC. Returns the full id of the closed session.
async fn kill_session(session_id: &str) -> anyhow::Result<String> {
    let mut client = connect_daemon().await?;

    match client.kill_session(session_id).await? {
        IpcResponse::SessionKilled { session_id } => Ok(session_id),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    println!(
        "{:<32}  {:>7}  {:<8}  {:>9}  {:<8}  {:>10}  {:>8}",
        "ID", "PID", "STATE", "SIZE", "ATTACHED", "CREATED", "IDLE"
    );
    println!("{}", "-".repeat(96));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32}  {:>7}  {:<8}  {:>9}  {:<8}  {:>10}  {:>8}",
            session.id,
            pid,
            session.state,
            format!("{}x{}", session.cols, session.rows),
            if session.attached { "yes" } else { "no" },
            format_relative_time(session.created_at),
            format_duration(session.idle_secs),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Ask the daemon to stop and wait for its control socket to go away.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect_daemon().await?;

    println!("Sending shutdown request...");

    match client.stop().await? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
    drop(client);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Kill the daemon named in the PID file with SIGKILL.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = get_pid_file_path();
    let pid = get_daemon_pid()
        .ok_or_else(|| anyhow::anyhow!("No running daemon found in {}", pid_path.display()))?;
    let raw = i32::try_from(pid)?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(get_socket_path());

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["webterm", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { bind, shell } => {
                assert!(bind.is_none());
                assert!(shell.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "webterm",
            "serve",
            "--bind",
            "127.0.0.1:9000",
            "--shell",
            "/bin/bash",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { bind, shell } => {
                assert_eq!(bind.as_deref(), Some("127.0.0.1:9000"));
                assert_eq!(shell.as_deref(), Some("/bin/bash"));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_apply_serve_overrides() {
        let mut config = Config::default();
        apply_serve_overrides(&mut config, Some("127.0.0.1:9000".to_string()), None);
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.session.shell, Config::default().session.shell);

        apply_serve_overrides(&mut config, None, Some("/bin/sh".to_string()));
        assert_eq!(config.session.shell, "/bin/sh");
    }

    #[test]
    fn test_stop_command() {
        let cli = Cli::try_parse_from(["webterm", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(!force);
                assert_eq!(timeout, 30);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_with_force_and_timeout() {
        let cli = Cli::try_parse_from(["webterm", "stop", "-f", "--timeout", "5"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(force);
                assert_eq!(timeout, 5);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["webterm", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["webterm", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_kill() {
        let cli = Cli::try_parse_from(["webterm", "sessions", "kill", "0123abcd"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Kill { session_id }) => {
                assert_eq!(session_id, "0123abcd");
            }
            _ => panic!("Expected Sessions Kill command"),
        }
    }

    #[test]
    fn test_sessions_kill_requires_id() {
        assert!(Cli::try_parse_from(["webterm", "sessions", "kill"]).is_err());
    }

    #[test]
    fn test_config_commands() {
        let cli = Cli::try_parse_from(["webterm", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["webterm", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["webterm", "status", "-v", "-c", "/etc/webterm.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/webterm.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["webterm"]).is_err());
        assert!(Cli::try_parse_from(["webterm", "sessions"]).is_err());
        assert!(Cli::try_parse_from(["webterm", "invalid"]).is_err());
    }

    #[test]
    fn test_help_available() {
        let err = Cli::try_parse_from(["webterm", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_init_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("webterm").join("config.toml");

        init_config_file(&path, false).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());

        assert!(init_config_file(&path, false).is_err());
        init_config_file(&path, true).unwrap();
    }

    #[test]
    fn test_config_init_replaces_unparseable_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "server = [broken\n").unwrap();
        assert!(Config::load(&path).is_err());

        let cli = Cli::try_parse_from([
            "webterm",
            "-c",
            path.to_str().unwrap(),
            "config",
            "init",
            "--force",
        ])
        .unwrap();
        assert!(run_without_config(&cli.command, &path).unwrap());
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_other_commands_need_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        for args in [["webterm", "status"], ["webterm", "serve"]] {
            let cli = Cli::try_parse_from(args).unwrap();
            assert!(!run_without_config(&cli.command, &path).unwrap());
        }
        let cli = Cli::try_parse_from(["webterm", "config", "show"]).unwrap();
        assert!(!run_without_config(&cli.command, &path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_format_relative_time() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(format_relative_time(now).ends_with("s ago"));
        assert_eq!(format_relative_time(now - 150), "2m ago");
        assert_eq!(format_relative_time(now - 7200), "2h ago");
        assert_eq!(format_relative_time(now - 172_800), "2d ago");
        // Clock skew never goes negative.
        assert_eq!(format_relative_time(now + 100), "0s ago");
    }
}

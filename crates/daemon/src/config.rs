//! Configuration management for the webterm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/webterm/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::TerminalSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be a socket address like 0.0.0.0:8080, got {0}")]
    InvalidBindAddr(String),

    #[error("path must start with '/', got {0}")]
    InvalidPath(String),

    #[error("max_message_size must be between 1 KiB and 64 MiB, got {0}")]
    InvalidMaxMessageSize(usize),

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("output_buffer must be between 1 and 65536 chunks, got {0}")]
    InvalidOutputBuffer(usize),

    #[error("default terminal size must be positive, got {rows}x{cols}")]
    InvalidDefaultSize { rows: u16, cols: u16 },

    #[error("sweep_interval_secs must be between 1 and 3600, got {0}")]
    InvalidSweepInterval(u64),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("cwd is not a directory: {0}")]
    InvalidCwd(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
pub(crate) const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the webterm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// WebSocket listener configuration.
    pub server: ServerConfig,

    /// PTY session configuration.
    pub session: SessionConfig,

    /// Lifecycle sweep configuration.
    pub supervisor: SupervisorConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: String,

    /// URL path clients connect to. `/{session_id}` may follow it.
    pub path: String,

    /// Origins allowed to connect. Empty allows every origin.
    pub allowed_origins: Vec<String>,

    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,

    /// Seconds between heartbeat pings (0 disables).
    pub ping_interval_secs: u64,

    /// Seconds in-flight connections get to finish on shutdown.
    pub shutdown_grace_secs: u64,
}

/// PTY session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Program started inside each PTY.
    pub shell: String,

    /// Arguments passed to the shell.
    pub args: Vec<String>,

    /// Value of TERM in the child environment.
    pub term: String,

    /// Working directory for new sessions. Defaults to the daemon's cwd.
    pub cwd: Option<PathBuf>,

    /// Initial rows before the client sends a resize.
    pub default_rows: u16,

    /// Initial columns before the client sends a resize.
    pub default_cols: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Output chunks buffered per session while no client is reading.
    pub output_buffer: usize,

    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
}

/// Lifecycle sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,

    /// Close sessions with no input or output for this many seconds (0 = never).
    pub idle_timeout_secs: u64,

    /// Close sessions with no client attached for this many seconds (0 = never).
    pub orphan_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Optional log file. Rotated daily.
    pub file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            path: "/ws".to_string(),
            allowed_origins: Vec::new(),
            max_message_size: 1024 * 1024, // 1 MiB
            ping_interval_secs: 30,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: Vec::new(),
            term: "xterm-256color".to_string(),
            cwd: None,
            default_rows: 24,
            default_cols: 80,
            max_sessions: 32,
            output_buffer: 256,
            env: BTreeMap::new(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 1,
            idle_timeout_secs: 0,
            orphan_timeout_secs: 300, // 5 minutes
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl ServerConfig {
    /// Parse the bind address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.bind_addr.clone()))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Returns true if a request with this Origin header may connect.
    ///
    /// Requests without an Origin header (non-browser clients) are always
    /// allowed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            _ if self.allowed_origins.is_empty() => true,
            None => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin)),
        }
    }
}

impl SessionConfig {
    /// Initial terminal size for new sessions.
    pub fn default_size(&self) -> TerminalSize {
        TerminalSize {
            rows: self.default_rows,
            cols: self.default_cols,
        }
    }
}

impl SupervisorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn orphan_timeout(&self) -> Option<Duration> {
        (self.orphan_timeout_secs > 0).then(|| Duration::from_secs(self.orphan_timeout_secs))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webterm")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WEBTERM_BIND: Override the listen address
    /// - WEBTERM_SHELL: Override the session shell
    /// - WEBTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the `(setting, value)` pairs that were applied. Logging is
    /// usually not set up yet at this point, so callers log them later.
    pub fn apply_env_overrides(&mut self) -> Vec<(&'static str, String)> {
        let mut applied = Vec::new();

        if let Some(bind) = non_empty_env("WEBTERM_BIND") {
            self.server.bind_addr = bind.clone();
            applied.push(("bind_addr", bind));
        }

        if let Some(shell) = non_empty_env("WEBTERM_SHELL") {
            self.session.shell = shell.clone();
            applied.push(("shell", shell));
        }

        if let Some(level) = non_empty_env("WEBTERM_LOG_LEVEL") {
            self.logging.level = level.clone();
            applied.push(("log_level", level));
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.server.path.clone()));
        }

        let message_size = self.server.max_message_size;
        if !(1024..=64 * 1024 * 1024).contains(&message_size) {
            return Err(ConfigError::InvalidMaxMessageSize(message_size));
        }

        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.output_buffer < 1 || self.session.output_buffer > 65536 {
            return Err(ConfigError::InvalidOutputBuffer(self.session.output_buffer));
        }

        if self.session.default_rows == 0 || self.session.default_cols == 0 {
            return Err(ConfigError::InvalidDefaultSize {
                rows: self.session.default_rows,
                cols: self.session.default_cols,
            });
        }

        let sweep = self.supervisor.sweep_interval_secs;
        if !(1..=3600).contains(&sweep) {
            return Err(ConfigError::InvalidSweepInterval(sweep));
        }

        let shell_path = Path::new(&self.session.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        if let Some(cwd) = &self.session.cwd {
            if !cwd.is_dir() {
                return Err(ConfigError::InvalidCwd(cwd.display().to_string()));
            }
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

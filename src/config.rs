//! Configuration module for the hearth server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Number of distinct connection identifiers (`prefix` + 0..ID_SPACE).
pub const ID_SPACE: u32 = 100_000;

/// Command-line arguments for the WebSocket server
#[derive(Parser, Debug, Default)]
#[command(name = "hearth")]
#[command(author = "hearth authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded WebSocket server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of registered connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Message handler to run
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Which dispatch hook the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// JSON chat room
    #[default]
    Chat,
    /// Send every message back to its sender
    Echo,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: String,
    /// Listen backlog
    pub backlog: i32,
    pub max_connections: usize,
    /// Longest sleep between loop passes, in milliseconds
    pub tick_ms: u64,
    /// Bytes read from a socket per call
    pub read_buffer_size: usize,
    /// Largest accepted inbound frame payload
    pub max_frame_size: usize,
    /// Largest outbound backlog per connection before it is dropped
    pub max_pending_bytes: usize,
    pub handshake_timeout_secs: u64,
    /// Prefix of generated connection ids
    pub id_prefix: String,
    /// Connections accepted per pass at most
    pub accepts_per_pass: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            backlog: 15,
            max_connections: 1024,
            tick_ms: 250,
            read_buffer_size: 2048,
            max_frame_size: 1024 * 1024, // 1 MiB
            max_pending_bytes: 1024 * 1024,
            handshake_timeout_secs: 10,
            id_prefix: "user-".to_string(),
            accepts_per_pass: 16,
        }
    }
}

/// Idle detection configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Silence before a heartbeat is sent
    pub idle_secs: u64,
    /// Silence before the connection is evicted
    pub timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            timeout_secs: 80,
        }
    }
}

/// Dispatch hook configuration
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HandlerConfig {
    pub kind: HandlerKind,
    /// Chat welcome banner; the built-in one when unset
    pub welcome: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub max_connections: usize,
    pub tick_ms: u64,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
    pub max_pending_bytes: usize,
    pub handshake_timeout_secs: u64,
    pub id_prefix: String,
    pub id_space: u32,
    pub accepts_per_pass: usize,
    pub idle_secs: u64,
    pub timeout_secs: u64,
    pub handler: HandlerKind,
    pub welcome: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over a parsed file and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            liveness,
            handler,
            logging,
        } = toml_config;

        let listen_str = cli.listen.unwrap_or(server.listen);
        let listen: SocketAddr = listen_str.parse().map_err(|_| {
            ConfigError::Invalid(format!("listen address '{listen_str}' is not host:port"))
        })?;

        let config = Config {
            listen,
            backlog: server.backlog,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            tick_ms: server.tick_ms,
            read_buffer_size: server.read_buffer_size,
            max_frame_size: server.max_frame_size,
            max_pending_bytes: server.max_pending_bytes,
            handshake_timeout_secs: server.handshake_timeout_secs,
            id_prefix: server.id_prefix,
            id_space: ID_SPACE,
            accepts_per_pass: server.accepts_per_pass,
            idle_secs: liveness.idle_secs,
            timeout_secs: liveness.timeout_secs,
            handler: cli.handler.unwrap_or(handler.kind),
            welcome: handler.welcome,
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs <= self.idle_secs {
            return Err(ConfigError::Invalid(format!(
                "liveness timeout ({}s) must exceed idle threshold ({}s)",
                self.timeout_secs, self.idle_secs
            )));
        }
        if self.max_connections == 0 || self.max_connections > self.id_space as usize {
            return Err(ConfigError::Invalid(format!(
                "max_connections must be between 1 and {}, got {}",
                self.id_space, self.max_connections
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be > 0".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be > 0".into()));
        }
        Ok(())
    }
}

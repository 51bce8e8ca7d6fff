//! Configuration module for the tether server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "tether")]
#[command(author = "tether authors")]
#[command(version = "0.1.0")]
#[command(about = "A framed binary protocol server with liveness pings", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of connection workers (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of accepted connections waiting for a worker
    #[arg(short = 'q', long)]
    pub max_connections: Option<usize>,

    /// Ping interval used when a client does not request one, in milliseconds
    #[arg(short = 'p', long)]
    pub ping_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of connection workers
    pub workers: Option<usize>,
    /// Capacity of the pending connection queue
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection session configuration
#[derive(Debug, Deserialize)]
pub struct SessionSettings {
    /// Fallback ping interval in milliseconds
    #[serde(default = "default_ping_interval_ms")]
    pub default_ping_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_ping_interval_ms: default_ping_interval_ms(),
        }
    }
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

fn default_listen() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_ping_interval_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub max_connections: usize,
    pub default_ping_interval: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            max_connections: default_max_connections(),
            default_ping_interval: Duration::from_millis(default_ping_interval_ms()),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli
                .workers
                .or(toml_config.server.workers)
                .unwrap_or_else(default_workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            default_ping_interval: Duration::from_millis(
                cli.ping_interval_ms
                    .unwrap_or(toml_config.session.default_ping_interval_ms),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.default_ping_interval.is_zero() {
            return Err(ConfigError::Invalid("default ping interval must be non-zero"));
        }
        Ok(())
    }

    /// Session settings derived from this configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig::new(self.default_ping_interval)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

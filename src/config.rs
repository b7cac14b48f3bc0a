//! Configuration module for delimiter-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::session::Strategy;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "delimiter-server")]
#[command(author = "delimiter-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Answers delimiter-terminated messages with a framed payload", long_about = None)]
pub struct CliArgs {
    /// Respond on the first received bytes instead of waiting for the delimiter
    #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub parallel: Option<bool>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and framing configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Byte sequence marking the end of a client message
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Maximum number of bytes buffered per connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Number of runtime worker threads (1 = single-threaded)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            delimiter: default_delimiter(),
            buffer_size: default_buffer_size(),
            workers: default_workers(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection policy
#[derive(Debug, Deserialize, Default)]
pub struct SessionConfig {
    /// Seconds a read or response write may stall before the connection is closed (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
    /// Stop the whole server when any connection hits a socket error
    #[serde(default)]
    pub fail_fast: bool,
}

/// Shutdown policy
#[derive(Debug, Deserialize, Default)]
pub struct ShutdownConfig {
    /// Seconds to wait for in-flight connections (0 = wait forever)
    #[serde(default)]
    pub drain_timeout: u64,
}

/// Response payload source
#[derive(Debug, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_payload_path")]
    pub path: PathBuf,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            path: default_payload_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// File the shutdown record is appended to (empty = disabled)
    #[serde(default = "default_stats_file")]
    pub stats_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats_file: default_stats_file(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_delimiter() -> String {
    "$::_$".to_string()
}

fn default_buffer_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_workers() -> usize {
    1
}

fn default_max_connections() -> usize {
    10000
}

fn default_payload_path() -> PathBuf {
    PathBuf::from("assets/payload.txt")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_file() -> String {
    "log/logs.log".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub delimiter: Vec<u8>,
    pub buffer_size: usize,
    pub strategy: Strategy,
    pub workers: usize,
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub fail_fast: bool,
    pub drain_timeout: Option<Duration>,
    pub payload_path: PathBuf,
    pub stats_file: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level.clone()
        };

        Self::resolve(toml_config, cli.parallel.unwrap_or(false), log_level)
    }

    /// Merge a parsed file with the mode flag and validate the result.
    pub fn resolve(
        toml_config: TomlConfig,
        parallel: bool,
        log_level: String,
    ) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            session,
            shutdown,
            payload,
            logging,
        } = toml_config;

        if server.delimiter.is_empty() {
            return Err(ConfigError::Invalid("delimiter must not be empty".into()));
        }
        if server.buffer_size < server.delimiter.len() {
            return Err(ConfigError::Invalid(format!(
                "buffer_size ({}) is smaller than the delimiter ({} bytes)",
                server.buffer_size,
                server.delimiter.len()
            )));
        }
        if server.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }

        let strategy = if parallel {
            Strategy::Parallel
        } else {
            Strategy::Sequential
        };

        Ok(Config {
            host: server.host,
            port: server.port,
            delimiter: server.delimiter.into_bytes(),
            buffer_size: server.buffer_size,
            strategy,
            workers: server.workers,
            max_connections: server.max_connections,
            idle_timeout: seconds(session.idle_timeout),
            fail_fast: session.fail_fast,
            drain_timeout: seconds(shutdown.drain_timeout),
            payload_path: payload.path,
            stats_file: if logging.stats_file.is_empty() {
                None
            } else {
                Some(PathBuf::from(logging.stats_file))
            },
            log_level,
        })
    }

    /// The `host:port` pair the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

//! Configuration module for the chatlogd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Inactivity window; reset after every successful read or write.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat messages longer than this are truncated before being echoed.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Upper bound on a line still waiting for its `\n`.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "chatlogd")]
#[command(author = "chatlogd authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP chat server with per-client logs", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port number to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory to store client logs
    #[arg(short = 'd', long)]
    pub logdir: Option<PathBuf>,

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
    pub chatlog: ChatLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on (all interfaces)
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Per-client log configuration
#[derive(Debug, Deserialize)]
pub struct ChatLogConfig {
    /// Directory holding one `<host>.log` per client host
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for ChatLogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
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

fn default_port() -> u16 {
    4000
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("client_logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub idle_timeout: Duration,
    pub max_message_size: usize,
    pub max_line_bytes: usize,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref config_path) => Self::read_file(config_path)?,
            None => TomlConfig::default(),
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn read_file(path: &Path) -> Result<TomlConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            port: cli.port.unwrap_or(toml_config.server.port),
            log_dir: cli.logdir.unwrap_or(toml_config.chatlog.dir),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            idle_timeout: IDLE_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                port: None,
                logdir: None,
                log_level: default_log_level(),
            },
            TomlConfig::default(),
        )
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}

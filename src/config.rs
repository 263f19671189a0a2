//! Configuration for the forwarder.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::addr::{self, AddrError, BindSpec};
use crate::forwarder::{DEFAULT_WORKERS, MAX_WORKERS};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the forwarder
#[derive(Parser, Debug)]
#[command(name = "tcp-fanout")]
#[command(version = "0.1.0")]
#[command(about = "A multi-threaded TCP fan-out proxy", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Endpoint to listen on: ip:port or ip:minport-maxport
    /// (e.g. 127.0.0.1:9000 or 127.0.0.1:9000-9005)
    #[arg(long = "bind", value_name = "IP-PORT-RANGE", required_unless_present = "config")]
    pub bind: Vec<String>,

    /// Upstream server every accepted connection is replicated to
    /// (e.g. 127.0.0.1:9100 or [::1]:9100)
    #[arg(
        long = "upstream-server",
        value_name = "IP-PORT",
        required_unless_present = "config"
    )]
    pub upstream_server: Vec<String>,

    /// Number of worker threads (1 - 32)
    #[arg(long = "number-workers", value_name = "N")]
    pub number_workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config: None,
            bind: Vec::new(),
            upstream_server: Vec::new(),
            number_workers: None,
            log_level: default_log_level(),
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Forwarder-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ForwarderConfig {
    /// Endpoints to listen on
    #[serde(default)]
    pub bind: Vec<String>,
    /// Upstream servers
    #[serde(default)]
    pub upstream: Vec<String>,
    /// Number of worker threads
    pub workers: Option<usize>,
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
    pub binds: Vec<BindSpec>,
    pub upstreams: Vec<SocketAddr>,
    pub workers: usize,
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

    /// Merge CLI args with TOML config (CLI takes precedence) and
    /// validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let bind_specs = if cli.bind.is_empty() {
            toml_config.forwarder.bind
        } else {
            cli.bind
        };
        let upstream_specs = if cli.upstream_server.is_empty() {
            toml_config.forwarder.upstream
        } else {
            cli.upstream_server
        };

        if bind_specs.is_empty() {
            return Err(ConfigError::NoBind);
        }
        if upstream_specs.is_empty() {
            return Err(ConfigError::NoUpstream);
        }

        let binds = bind_specs
            .iter()
            .map(|s| addr::parse_bind_spec(s).map_err(|e| ConfigError::Bind(s.clone(), e)))
            .collect::<Result<Vec<_>, _>>()?;

        let upstreams = upstream_specs
            .iter()
            .map(|s| addr::parse_endpoint(s).map_err(|e| ConfigError::Upstream(s.clone(), e)))
            .collect::<Result<Vec<_>, _>>()?;

        let workers = cli
            .number_workers
            .or(toml_config.forwarder.workers)
            .unwrap_or(DEFAULT_WORKERS);
        if !(1..=MAX_WORKERS).contains(&workers) {
            return Err(ConfigError::Workers(workers));
        }

        Ok(Config {
            binds,
            upstreams,
            workers,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Bind(String, AddrError),
    Upstream(String, AddrError),
    NoBind,
    NoUpstream,
    Workers(usize),
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
            ConfigError::Bind(spec, e) => {
                write!(f, "Invalid bind specification '{spec}': {e}")
            }
            ConfigError::Upstream(spec, e) => {
                write!(f, "Invalid upstream server '{spec}': {e}")
            }
            ConfigError::NoBind => {
                write!(f, "At least one bind address has to be specified")
            }
            ConfigError::NoUpstream => {
                write!(f, "At least one upstream server has to be specified")
            }
            ConfigError::Workers(n) => {
                write!(f, "Invalid number of workers {n} (expected 1 - {MAX_WORKERS})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

//! Command line and configuration file handling

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use gdbadapter::GdbConfig;
use qconn::{PairingConfig, TransportConfig, DEFAULT_DOOR_PORT, DEFAULT_QCONN_PORT};
use serde::{Deserialize, Serialize};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "targetlink")]
#[command(about = "Pair with a QNX target and debug it over GDB/MI")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Target address, overrides the configuration file
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Show the merged configuration and exit
    #[arg(long)]
    pub show_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Unlock the target and keep the pairing alive until interrupted
    Pair {
        /// Device password
        #[arg(long, env = "TARGETLINK_PASSWORD", hide_env_values = true, default_value = "")]
        password: String,

        /// Public key file installed on the target
        #[arg(long)]
        ssh_key: PathBuf,
    },
    /// Query the qconn agent for target properties and services
    Info,
    /// List a target directory through the file service
    Ls {
        /// Directory on the target
        #[arg(default_value = "/")]
        path: String,
    },
    /// Connect GDB to the target and list its processes
    Gdb {
        /// Attach to the process running this executable
        #[arg(long)]
        attach: Option<String>,

        /// Local copy of the executable with symbols
        #[arg(long)]
        symbols: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gdb: GdbConfig,
    pub target: TargetConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub door_port: u16,
    pub qconn_port: u16,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub chunk_size: usize,
    pub response_capacity: usize,
    pub keep_alive_ms: u64,
    pub gdb_retries: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        let pairing = PairingConfig::default();
        Self {
            host: pairing.host,
            door_port: DEFAULT_DOOR_PORT,
            qconn_port: DEFAULT_QCONN_PORT,
            connect_timeout_ms: transport.connect_timeout_ms,
            send_timeout_ms: transport.send_timeout_ms,
            receive_timeout_ms: transport.receive_timeout_ms,
            chunk_size: transport.chunk_size,
            response_capacity: pairing.response_capacity,
            keep_alive_ms: 2000,
            gdb_retries: 3,
        }
    }
}

impl TargetConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            send_timeout_ms: self.send_timeout_ms,
            receive_timeout_ms: self.receive_timeout_ms,
            chunk_size: self.chunk_size,
        }
    }

    pub fn pairing(&self) -> PairingConfig {
        PairingConfig {
            host: self.host.clone(),
            door_port: self.door_port,
            transport: self.transport(),
            response_capacity: self.response_capacity,
            ..PairingConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> Result<log::LevelFilter> {
        self.level
            .parse()
            .map_err(|_| anyhow!("Invalid log level \"{}\"", self.level))
    }
}

impl Config {
    /// Load configuration from file or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content).context("Invalid TOML syntax")?;
        config.validate()?;
        Ok(config)
    }

    /// Command line flags win over the file
    pub fn merge_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.target.host = host.clone();
        }
        if let Some(level) = &args.log_level {
            self.log.level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.host.is_empty() {
            bail!("target.host must not be empty");
        }
        if self.target.chunk_size == 0 {
            bail!("target.chunk_size must be > 0");
        }
        if self.target.response_capacity < 6 {
            bail!("target.response_capacity must hold at least a frame header");
        }
        self.log.level_filter()?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

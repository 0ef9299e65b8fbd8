//! Configuration for the solo mining client
//!
//! Command line arguments with environment variable fallbacks, validated
//! before any transport opens.

use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use std::fmt;
use std::time::Duration;

/// Default node JSON-RPC port
pub const DEFAULT_RPC_PORT: u16 = 8232;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Complete configuration for the solo mining client
#[derive(Debug, Clone, Parser)]
#[command(
    name = "solo-mining-client",
    version = env!("CARGO_PKG_VERSION"),
    about = "Solo mining client",
    long_about = "Tracks block templates from a full node over JSON-RPC polling and \
                  ZMQ-style push notifications, and submits completed block solutions"
)]
pub struct Config {
    /// Node RPC address as host or host:port
    #[arg(short = 'n', long, default_value = "localhost:8232", env = "SOLO_NODE")]
    pub node: String,

    /// RPC username
    #[arg(long, env = "SOLO_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password
    #[arg(long, env = "SOLO_RPC_PASS")]
    pub rpc_pass: Option<String>,

    /// Use TLS for the RPC path
    #[arg(short = 't', long)]
    pub tls: bool,

    /// Accept self-signed TLS certificates
    #[arg(short = 'x', long)]
    pub insecure: bool,

    /// Port of the node's block-notification publisher; poll-only when unset
    #[arg(long, env = "SOLO_NOTIFY_PORT")]
    pub notify_port: Option<u16>,

    /// Template poll interval in milliseconds, also used as the retry backoff
    #[arg(short = 'p', long, default_value = "2000")]
    pub poll_interval_ms: u64,

    /// HTTP request timeout in seconds
    #[arg(long, default_value = "10")]
    pub http_timeout_secs: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.rpc_endpoint()?;
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll interval must be positive"));
        }
        if self.rpc_pass.is_some() && self.rpc_user.is_none() {
            return Err(Error::config("--rpc-pass requires --rpc-user"));
        }
        Ok(())
    }

    /// Split the node address into host and RPC port
    pub fn rpc_endpoint(&self) -> Result<(String, u16)> {
        let node = self.node.trim();
        if node.is_empty() {
            return Err(Error::config("node address is empty"));
        }

        match node.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(Error::config(format!("node address `{node}` has no host")));
                }
                let port = port
                    .parse()
                    .map_err(|e| Error::config(format!("invalid node port `{port}`: {e}")))?;
                Ok((host.to_string(), port))
            }
            None => Ok((node.to_string(), DEFAULT_RPC_PORT)),
        }
    }

    /// Base URL for the node's JSON-RPC interface
    pub fn node_url(&self) -> Result<String> {
        let (host, port) = self.rpc_endpoint()?;
        let scheme = if self.tls { "https" } else { "http" };
        Ok(format!("{scheme}://{host}:{port}/"))
    }

    /// RPC basic-auth credentials, when configured
    pub fn rpc_auth(&self) -> Option<(String, String)> {
        self.rpc_user
            .as_ref()
            .map(|user| (user.clone(), self.rpc_pass.clone().unwrap_or_default()))
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// HTTP timeout as a duration
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

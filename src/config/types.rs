//! Configuration types and structures.

use crate::ports::PortRange;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default HTTP listen port.
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ports: PortConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Interface the HTTP API binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP API port (default: 3000).
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            host: default_host(),
            port: default_http_port(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("taskport/taskport.db")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

/// Port pool and allocation retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Lowest allocatable port (inclusive).
    #[serde(default = "default_min_port")]
    pub min_port: u16,

    /// Highest allocatable port (inclusive).
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Ports handed out when a request does not name a count.
    #[serde(default = "default_count")]
    pub default_count: u32,

    /// Upper bound on ports a single project may hold.
    #[serde(default = "default_max_per_project")]
    pub max_per_project: u32,

    /// Extra attempts after a lost race on the ledger.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed pause between attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            min_port: default_min_port(),
            max_port: default_max_port(),
            default_count: default_count(),
            max_per_project: default_max_per_project(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_min_port() -> u16 {
    1000
}

fn default_max_port() -> u16 {
    2000
}

fn default_count() -> u32 {
    10
}

fn default_max_per_project() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl PortConfig {
    /// The configured pool as a closed range.
    pub fn range(&self) -> PortRange {
        PortRange::new(self.min_port, self.max_port)
    }

    /// Reject pools and limits that can never satisfy a request.
    pub fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            return Err(anyhow!(
                "ports.min_port ({}) must not exceed ports.max_port ({})",
                self.min_port,
                self.max_port
            ));
        }
        if self.max_per_project == 0 {
            return Err(anyhow!("ports.max_per_project must be at least 1"));
        }
        if self.default_count == 0 || self.default_count > self.max_per_project {
            return Err(anyhow!(
                "ports.default_count ({}) must be between 1 and ports.max_per_project ({})",
                self.default_count,
                self.max_per_project
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a single YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.ports.validate()
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

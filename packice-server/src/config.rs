use packice_core::{PackError, PeerConfig, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Serve the UDS transport on this socket path when set.
    #[serde(default)]
    pub uds_path: Option<PathBuf>,
    #[serde(default)]
    pub peer: PeerSection,
    #[serde(default)]
    pub lease_store: LeaseStoreSection,
    /// When present the node runs a tiered hot/cold peer instead of a
    /// single-backend one.
    #[serde(default)]
    pub tiered: Option<TieredSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    #[serde(default)]
    pub backend: BackendChoice,
    /// Data directory for the file and shared_fs backends.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub max_objects: Option<usize>,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Memory,
            root: None,
            max_objects: None,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    #[default]
    Memory,
    File,
    SharedFs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseStoreSection {
    #[serde(default)]
    pub backend: LeaseStoreBackend,
    pub url: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for LeaseStoreSection {
    fn default() -> Self {
        Self {
            backend: LeaseStoreBackend::Memory,
            url: None,
            namespace: default_namespace(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredSection {
    pub hot_max_objects: usize,
    pub cold_root: PathBuf,
    #[serde(default = "default_promote_on_read")]
    pub promote_on_read: bool,
    #[serde(default = "default_promote_max_bytes")]
    pub promote_max_bytes: u64,
    #[serde(default = "default_demote_retries")]
    pub demote_retries: u32,
}

fn default_http_addr() -> String {
    "127.0.0.1:9190".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_namespace() -> String {
    "packice".to_string()
}

fn default_promote_on_read() -> bool {
    true
}

fn default_promote_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_demote_retries() -> u32 {
    3
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("PACKICE"))
            .build()
            .map_err(|e| PackError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| PackError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Core peer configuration for the single-backend (non-tiered) case.
    pub fn peer_config(&self) -> Result<PeerConfig> {
        let sweep = Duration::from_millis(self.peer.sweep_interval_ms);
        let mut config = match self.peer.backend {
            BackendChoice::Memory => PeerConfig::memory(),
            BackendChoice::File => PeerConfig::file(self.require_root()?),
            BackendChoice::SharedFs => PeerConfig::shared_fs(self.require_root()?),
        };
        config = config.with_sweep_interval(sweep);
        if let Some(max) = self.peer.max_objects {
            config = config.with_max_objects(max);
        }
        Ok(config)
    }

    fn require_root(&self) -> Result<PathBuf> {
        self.peer.root.clone().ok_or_else(|| {
            PackError::Config("peer.root is required for file-backed peers".to_string())
        })
    }
}

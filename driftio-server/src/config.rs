use driftio_core::{DriftError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the local zone; used in log lines only.
    pub zone: String,
    /// Admin API bind address.
    pub bind_addr: String,
    /// Where sync status lives.
    pub store: StoreConfig,
    /// Internal endpoint of the local object layer that executes object
    /// fetches and removals.
    pub transfer: TransferConfig,
    /// Source zones to replicate from.
    pub sources: Vec<SourceZoneConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceZoneConfig {
    /// Source zone name; keys the persisted sync status.
    pub name: String,
    /// Admin endpoint of the source zone, e.g. http://zone-a:8000
    pub endpoint: String,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("DRIFTIO"))
            .build()
            .map_err(|e| DriftError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| DriftError::Config(e.to_string()))?;

        if config.sources.is_empty() {
            return Err(DriftError::Config(
                "at least one source zone is required".to_string(),
            ));
        }

        Ok(config)
    }
}

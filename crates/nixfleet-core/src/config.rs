//! nixfleet.toml configuration parser.
//!
//! Every section and field is optional; command-line flags fill in or
//! override whatever the file leaves out.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub agent: AgentConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Path of the redb state file.
    pub path: Option<PathBuf>,
    /// Object store chunk size in bytes.
    pub chunk_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub bind: Option<String>,
    pub secret_key_file: Option<PathBuf>,
    pub store_dir: Option<String>,
    pub want_mass_query: Option<bool>,
    pub priority: Option<u32>,
    pub max_upload_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub node_key_file: Option<PathBuf>,
    /// Dispatcher the agent polls and reports to, `http://host:port`.
    pub dispatcher_url: Option<String>,
    /// Node-local store backing the deployment cache proxy.
    pub cache_path: Option<PathBuf>,
    /// Key the per-deployment proxy signs with; normally the fleet cache key.
    pub cache_key_file: Option<PathBuf>,
    pub dry_run: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `text` or `json`.
    pub format: Option<String>,
    /// `tracing-subscriber` filter directive, e.g. `info,nixfleet_cache=debug`.
    pub filter: Option<String>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use nixfleet_core::{CacheInfo, SecretKey};
use nixfleet_state::Layout;

use crate::error::{CacheError, CacheResult};

pub const DEFAULT_BIND: &str = "127.0.0.1:5000";

/// Largest accepted PUT body (1 GiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// `/nix-cache-info` contents. Defaults when unset.
    pub info: Option<CacheInfo>,
    /// Signs narinfo documents on first read. The key's name is the cache name.
    pub secret_key: Option<Arc<SecretKey>>,
    pub bind: SocketAddr,
    pub max_upload_bytes: usize,
    pub narinfo_bucket: String,
    pub access_bucket: String,
    pub nar_store: String,
    /// Cache to pull missing narinfos and nars from (`http://host:port`).
    pub upstream: Option<String>,
    /// Skip per-request tracing. Used by the per-deployment proxy.
    pub quiet: bool,
}

impl CacheOptions {
    /// Options using the resource names of `layout`, bound to the default address.
    pub fn new(secret_key: Arc<SecretKey>, layout: &Layout) -> Self {
        Self {
            info: None,
            secret_key: Some(secret_key),
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            narinfo_bucket: layout.narinfo.clone(),
            access_bucket: layout.narinfo_access.clone(),
            nar_store: layout.nar.clone(),
            upstream: None,
            quiet: false,
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.secret_key.is_none() {
            return Err(CacheError::InvalidOptions(
                "a secret key is required".to_string(),
            ));
        }
        for (field, value) in [
            ("narinfo_bucket", &self.narinfo_bucket),
            ("access_bucket", &self.access_bucket),
            ("nar_store", &self.nar_store),
        ] {
            if value.is_empty() {
                return Err(CacheError::InvalidOptions(format!("{field} cannot be empty")));
            }
        }
        if let Some(upstream) = &self.upstream {
            if !upstream.starts_with("http://") {
                return Err(CacheError::InvalidOptions(format!(
                    "upstream '{upstream}' must be an http:// URL"
                )));
            }
        }
        if self.max_upload_bytes == 0 {
            return Err(CacheError::InvalidOptions(
                "max_upload_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.info.clone().unwrap_or_default()
    }

    /// Cache name, taken from the signing key.
    pub fn name(&self) -> Option<&str> {
        self.secret_key.as_deref().map(SecretKey::name)
    }
}

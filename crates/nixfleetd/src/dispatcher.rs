//! Dispatcher — the long-lived fleet process.
//!
//! Opens and bootstraps the state store, then serves the binary cache and
//! the control API over it on one listener until shutdown. It is the only
//! process that opens the fleet state file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::Router;
use nixfleet_cache::{CacheOptions, CacheServer};
use nixfleet_state::{Layout, StateStore, bootstrap};
use tokio::sync::watch;
use tracing::info;

/// Open the state file (creating its directory) and make sure every fleet
/// resource exists.
pub fn open_store(path: &Path, layout: &Layout) -> anyhow::Result<StateStore> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
    }
    let store = StateStore::open(path)
        .with_context(|| format!("opening state store {}", path.display()))?;
    bootstrap(&store, layout).context("bootstrapping state store")?;
    info!(path = %path.display(), "state store ready");
    Ok(store)
}

pub struct Dispatcher {
    state_path: PathBuf,
    layout: Layout,
    options: CacheOptions,
    store: Option<StateStore>,
    cache: Option<CacheServer>,
}

impl Dispatcher {
    pub fn new(state_path: PathBuf, layout: Layout, options: CacheOptions) -> Self {
        Self {
            state_path,
            layout,
            options,
            store: None,
            cache: None,
        }
    }

    /// Open the store and bind the cache. Any failure here is fatal.
    pub async fn init(&mut self) -> anyhow::Result<()> {
        let store = open_store(&self.state_path, &self.layout)?;
        let control = nixfleet_api::build_router(&store, &self.layout)
            .context("building control api")?;
        let mut cache = CacheServer::new(store.clone(), self.options.clone()).merge(control);
        cache.init().await.context("starting binary cache")?;

        self.store = Some(store);
        self.cache = Some(cache);
        Ok(())
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.cache.as_ref().and_then(CacheServer::listen_addr)
    }

    pub fn store(&self) -> Option<&StateStore> {
        self.store.as_ref()
    }

    pub fn router(&self) -> Option<Router> {
        self.cache.as_ref().and_then(CacheServer::router)
    }

    /// Serve until `shutdown` turns true.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let cache = self
            .cache
            .take()
            .context("dispatcher was not initialized")?;
        cache.run(shutdown).await.context("binary cache failed")?;
        info!("dispatcher stopped");
        Ok(())
    }
}

//! Effective settings: command-line flags layered over the config file
//! layered over built-in defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::ValueEnum;
use nixfleet_agent::ReconcilerOptions;
use nixfleet_cache::CacheOptions;
use nixfleet_core::{CacheInfo, FleetConfig, NodeIdentity, SecretKey};
use nixfleet_state::Layout;

use crate::cli::{AgentArgs, Cli, ServeArgs};
use crate::logging::{DEFAULT_FILTER, LogFormat};

pub const DEFAULT_STATE_PATH: &str = "/var/lib/nixfleet/state.redb";
pub const DEFAULT_AGENT_CACHE_PATH: &str = "/var/lib/nixfleet/agent-cache.redb";
pub const DEFAULT_DISPATCHER_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Clone)]
pub struct Settings {
    pub config: FleetConfig,
    pub state_path: PathBuf,
    pub layout: Layout,
    /// Control API and upstream cache of agents and operator commands.
    pub dispatcher_url: String,
    pub log_format: LogFormat,
    pub log_filter: String,
}

impl Settings {
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let config = match &cli.config {
            Some(path) => FleetConfig::from_file(path)
                .with_context(|| format!("reading config file {}", path.display()))?,
            None => FleetConfig::default(),
        };
        let mut settings = Self::from_config(config, cli.state_path.clone(), cli.log_format)?;
        if let Some(url) = &cli.dispatcher {
            settings.dispatcher_url = url.trim_end_matches('/').to_string();
        }
        Ok(settings)
    }

    pub fn from_config(
        config: FleetConfig,
        state_path: Option<PathBuf>,
        log_format: Option<LogFormat>,
    ) -> anyhow::Result<Self> {
        let state_path = state_path
            .or_else(|| config.store.path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH));

        let mut layout = Layout::default();
        if let Some(chunk_size) = config.store.chunk_size {
            if chunk_size == 0 {
                bail!("store.chunk_size must be positive");
            }
            layout.chunk_size = chunk_size;
        }

        let log_format = match (log_format, config.log.format.as_deref()) {
            (Some(format), _) => format,
            (None, Some(name)) => LogFormat::from_str(name, true)
                .map_err(|e| anyhow::anyhow!("log.format: {e}"))?,
            (None, None) => LogFormat::default(),
        };
        let log_filter = config
            .log
            .filter
            .clone()
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let dispatcher_url = config
            .agent
            .dispatcher_url
            .as_deref()
            .unwrap_or(DEFAULT_DISPATCHER_URL)
            .trim_end_matches('/')
            .to_string();
        if !dispatcher_url.starts_with("http://") {
            bail!("agent.dispatcher_url must be an http:// URL, got '{dispatcher_url}'");
        }

        Ok(Self {
            config,
            state_path,
            layout,
            dispatcher_url,
            log_format,
            log_filter,
        })
    }

    /// Options for the long-lived fleet cache.
    pub fn cache_options(&self, args: &ServeArgs) -> anyhow::Result<CacheOptions> {
        let cache = &self.config.cache;
        let key_file = args
            .secret_key_file
            .as_ref()
            .or(cache.secret_key_file.as_ref())
            .context("a cache secret key is required (--secret-key-file or cache.secret_key_file)")?;
        let key = load_key(key_file)?;

        let mut options = CacheOptions::new(Arc::new(key), &self.layout);
        if let Some(bind) = args.bind {
            options.bind = bind;
        } else if let Some(bind) = &cache.bind {
            options.bind = bind
                .parse()
                .with_context(|| format!("cache.bind: invalid address '{bind}'"))?;
        }

        let defaults = CacheInfo::default();
        options.info = Some(CacheInfo {
            store_dir: cache.store_dir.clone().unwrap_or(defaults.store_dir),
            want_mass_query: cache.want_mass_query.unwrap_or(defaults.want_mass_query),
            priority: args.priority.or(cache.priority).unwrap_or(defaults.priority),
        });
        if let Some(max) = args.max_upload_bytes.or(cache.max_upload_bytes) {
            options.max_upload_bytes = max;
        }
        Ok(options)
    }

    /// Options for this node's reconciler.
    pub fn reconciler_options(&self, args: &AgentArgs) -> anyhow::Result<ReconcilerOptions> {
        let agent = &self.config.agent;
        let node_key_file = args
            .node_key_file
            .as_ref()
            .or(agent.node_key_file.as_ref())
            .context("a node key is required (--node-key-file or agent.node_key_file)")?;
        let node_key = load_key(node_key_file)?;
        let identity = NodeIdentity::from_public_key(&node_key.public_key());

        let cache_key_file = args
            .cache_key_file
            .as_ref()
            .or(agent.cache_key_file.as_ref())
            .or(self.config.cache.secret_key_file.as_ref())
            .context("a cache key is required (--cache-key-file or agent.cache_key_file)")?;
        let cache_key = load_key(cache_key_file)?;

        let mut options = ReconcilerOptions::new(identity, Arc::new(cache_key));
        options.layout = self.layout.clone();
        options.dry_run = args.dry_run || agent.dry_run.unwrap_or(false);
        if let Some(ms) = args.poll_interval_ms.or(agent.poll_interval_ms) {
            options.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(max) = agent.max_output_bytes {
            options.max_output_bytes = max;
        }
        options.upstream = Some(self.dispatcher_url.clone());
        Ok(options)
    }

    /// Node-local store of the deployment cache proxy.
    pub fn agent_cache_path(&self, args: &AgentArgs) -> PathBuf {
        args.cache_path
            .clone()
            .or_else(|| self.config.agent.cache_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AGENT_CACHE_PATH))
    }
}

fn load_key(path: &Path) -> anyhow::Result<SecretKey> {
    SecretKey::load(path).with_context(|| format!("loading key {}", path.display()))
}

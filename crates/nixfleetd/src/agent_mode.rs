//! Agent mode — runs on every fleet node.
//!
//! Follows this node's desired state through the dispatcher's control API
//! and drives the host's Nix tools until shutdown. The deployment cache
//! proxy keeps its own store on the node and pulls from the dispatcher.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use nixfleet_agent::{Collaborators, NixSystem, Reconciler, ReconcilerOptions, RemoteBus};
use nixfleet_api::ControlClient;
use nixfleet_state::Layout;
use tokio::sync::watch;
use tracing::info;

use crate::dispatcher::open_store;

pub async fn run_agent(
    dispatcher_url: &str,
    cache_path: &Path,
    layout: &Layout,
    options: ReconcilerOptions,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = ControlClient::new(dispatcher_url).context("dispatcher url")?;
    let bus = Arc::new(RemoteBus::new(client, layout));
    let store = open_store(cache_path, layout)?;

    let identity = options.identity.clone();
    info!(
        node = %identity,
        dispatcher = %dispatcher_url,
        dry_run = options.dry_run,
        "agent starting"
    );

    let system = Arc::new(NixSystem::new());
    let mut reconciler = Reconciler::new(store, bus, options, Collaborators::from_system(system))
        .context("creating reconciler")?;
    reconciler.run(shutdown).await.context("reconciler failed")?;

    info!(node = %identity, "agent stopped");
    Ok(())
}

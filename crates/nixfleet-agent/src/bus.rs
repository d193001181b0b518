//! Where an agent reads its desired state and writes its outcomes.
//!
//! On a node the bus is the dispatcher's control API ([`RemoteBus`]).
//! [`LocalBus`] reads the buckets of a store in the same process.

use std::time::Duration;

use async_trait::async_trait;
use nixfleet_api::ControlClient;
use nixfleet_core::NodeIdentity;
use nixfleet_state::{DeploymentOutcome, KeyValue, KvEntry, Layout, StateStore, WatchEvent};

use crate::error::{AgentError, AgentResult};

#[async_trait]
pub trait DeploymentBus: Send + Sync {
    /// The first revision of `node`'s desired-state key newer than `after`,
    /// or `None` if none shows up within `wait`.
    async fn next_desired(
        &self,
        node: &NodeIdentity,
        after: u64,
        wait: Duration,
    ) -> AgentResult<Option<KvEntry>>;

    /// Store `outcome` as the latest result of `node`.
    async fn report(&self, node: &NodeIdentity, outcome: &DeploymentOutcome) -> AgentResult<()>;
}

/// Desired-state and result buckets of an in-process store.
#[derive(Clone)]
pub struct LocalBus {
    desired: KeyValue,
    results: KeyValue,
}

impl LocalBus {
    pub fn open(store: &StateStore, layout: &Layout) -> AgentResult<Self> {
        Ok(Self {
            desired: store.key_value(&layout.desired_state)?,
            results: store.key_value(&layout.results)?,
        })
    }
}

#[async_trait]
impl DeploymentBus for LocalBus {
    async fn next_desired(
        &self,
        node: &NodeIdentity,
        after: u64,
        wait: Duration,
    ) -> AgentResult<Option<KvEntry>> {
        let mut watcher = self.desired.watch_from(node.as_str(), after)?;
        match watcher.next(wait).await? {
            WatchEvent::Entry(entry) => Ok(Some(entry)),
            WatchEvent::Timeout => Ok(None),
            WatchEvent::Closed => Err(AgentError::FeedClosed),
        }
    }

    async fn report(&self, node: &NodeIdentity, outcome: &DeploymentOutcome) -> AgentResult<()> {
        self.results.put_json(node.as_str(), outcome)?;
        Ok(())
    }
}

/// The dispatcher's control API.
#[derive(Clone)]
pub struct RemoteBus {
    client: ControlClient,
    bucket: String,
}

impl RemoteBus {
    pub fn new(client: ControlClient, layout: &Layout) -> Self {
        Self {
            client,
            bucket: layout.desired_state.clone(),
        }
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }
}

#[async_trait]
impl DeploymentBus for RemoteBus {
    async fn next_desired(
        &self,
        node: &NodeIdentity,
        after: u64,
        wait: Duration,
    ) -> AgentResult<Option<KvEntry>> {
        let update = self.client.next_deployment(node, after, wait).await?;
        Ok(update.map(|update| update.into_entry(&self.bucket)))
    }

    async fn report(&self, node: &NodeIdentity, outcome: &DeploymentOutcome) -> AgentResult<()> {
        self.client.report(node, outcome).await?;
        Ok(())
    }
}

//! Resource layout shared by every fleet process.
//!
//! The cache server, the agents and the operator commands all open the
//! same named resources. [`bootstrap`] creates whatever is missing and
//! leaves existing resources (and their configs) alone, so it is safe to
//! run on every startup.

use tracing::info;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::*;

/// Retained deployment events.
const DEPLOYMENT_EVENTS_RETAINED: u64 = 10_000;

/// Names of the fleet's storage resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Bucket: node identity -> desired deployment.
    pub desired_state: String,
    /// Bucket: node identity -> last deployment outcome.
    pub results: String,
    /// Bucket: narinfo hash -> narinfo text.
    pub narinfo: String,
    /// Bucket: narinfo hash -> last access marker.
    pub narinfo_access: String,
    /// Object store: nar file name -> compressed nar.
    pub nar: String,
    /// Stream of published deployment events.
    pub deployments: String,
    pub chunk_size: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            desired_state: "agent-deployments".to_string(),
            results: "agent-deployment-results".to_string(),
            narinfo: "nar-info".to_string(),
            narinfo_access: "nar-info-access".to_string(),
            nar: "nar".to_string(),
            deployments: "deployments".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Create all fleet resources that don't exist yet.
pub fn bootstrap(store: &StateStore, layout: &Layout) -> StateResult<()> {
    let buckets = [
        (&layout.desired_state, "desired deployment per node"),
        (&layout.results, "last deployment outcome per node"),
        (&layout.narinfo, "narinfo documents by hash"),
        (&layout.narinfo_access, "narinfo last access by hash"),
    ];
    for (name, description) in buckets {
        if store.ensure_bucket(name, &BucketConfig::new(description))? {
            info!(bucket = %name, "bucket created");
        }
    }

    let nar = ObjectStoreConfig {
        description: "nar files".to_string(),
        chunk_size: layout.chunk_size,
    };
    if store.ensure_object_store(&layout.nar, &nar)? {
        info!(store = %layout.nar, chunk_size = layout.chunk_size, "object store created");
    }

    let deployments = StreamConfig {
        description: "published deployments".to_string(),
        max_messages: Some(DEPLOYMENT_EVENTS_RETAINED),
    };
    if store.ensure_stream(&layout.deployments, &deployments)? {
        info!(stream = %layout.deployments, "stream created");
    }

    Ok(())
}

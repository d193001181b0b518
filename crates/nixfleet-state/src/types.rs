//! Domain types for the nixfleet state store.
//!
//! Storage-level records (bucket entries, object metadata, stream
//! messages) plus the fleet records kept in buckets: deployment
//! descriptors, deployment outcomes, and narinfo access markers.

use std::time::{SystemTime, UNIX_EPOCH};

use nixfleet_core::NodeIdentity;
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Resource configs ───────────────────────────────────────────────

/// Default bucket value limit, matching the common 1 MiB message cap.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Default object chunk size (128 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 128 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    pub description: String,
    /// Largest value accepted by `put`/`update`.
    pub max_value_size: usize,
}

impl BucketConfig {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectStoreConfig {
    pub description: String,
    pub chunk_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    pub description: String,
    /// Oldest messages are dropped once the stream holds more than this.
    pub max_messages: Option<u64>,
}

// ── Key-value entries ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Put,
    Delete,
}

/// One revision of one bucket key, as returned by reads and watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    /// Empty for deletions.
    pub value: Vec<u8>,
    pub revision: u64,
    pub operation: Operation,
}

// ── Objects ────────────────────────────────────────────────────────

/// Metadata stored alongside every object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub chunks: u32,
    /// `sha256:<hex>` of the full payload.
    pub digest: String,
    pub modified_at: u64,
}

// ── Streams ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub seq: u64,
    pub payload: Vec<u8>,
}

// ── Deployments ────────────────────────────────────────────────────

/// What `switch-to-configuration` should do with the new closure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    #[default]
    Switch,
    Boot,
    Test,
    DryActivate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Switch => "switch",
            Action::Boot => "boot",
            Action::Test => "test",
            Action::DryActivate => "dry-activate",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(Action::Switch),
            "boot" => Ok(Action::Boot),
            "test" => Ok(Action::Test),
            "dry-activate" => Ok(Action::DryActivate),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Desired configuration for one node. Stored in the desired-state bucket
/// under the node's identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    /// Store path of the system closure.
    pub closure: String,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub dry_run: bool,
}

/// Result of one deployment attempt. Stored in the result bucket under
/// the node's identity, overwritten by the next attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentOutcome {
    pub deployment: DeploymentDescriptor,
    pub success: bool,
    pub output: String,
    pub elapsed_ms: u64,
    pub finished_at: u64,
}

/// Published to the deployment stream on every operator publish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentEvent {
    pub node: NodeIdentity,
    pub deployment: DeploymentDescriptor,
    pub published_at: u64,
}

// ── Narinfo access ─────────────────────────────────────────────────

/// Last-access record for a narinfo hash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessMarker {
    pub accessed_at: u64,
}

impl AccessMarker {
    pub fn now() -> Self {
        Self {
            accessed_at: unix_now(),
        }
    }
}

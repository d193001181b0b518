//! Operator commands: publish a deployment, read back its outcome. Both go
//! through the dispatcher's control API.

use anyhow::Context;
use nixfleet_api::ControlClient;
use nixfleet_core::NodeIdentity;
use nixfleet_state::{DeploymentDescriptor, DeploymentOutcome};
use tracing::info;

/// Make `descriptor` the desired state of `node`. Returns the bucket
/// revision.
pub async fn publish_deployment(
    dispatcher_url: &str,
    node: &NodeIdentity,
    descriptor: &DeploymentDescriptor,
) -> anyhow::Result<u64> {
    let client = ControlClient::new(dispatcher_url)?;
    let receipt = client
        .publish(node, descriptor)
        .await
        .with_context(|| format!("publishing to {dispatcher_url}"))?;
    info!(
        %node,
        closure = %descriptor.closure,
        revision = receipt.revision,
        seq = receipt.seq,
        "deployment published"
    );
    Ok(receipt.revision)
}

/// Last reported outcome for `node`, if it ever reported one.
pub async fn read_status(
    dispatcher_url: &str,
    node: &NodeIdentity,
) -> anyhow::Result<Option<DeploymentOutcome>> {
    let client = ControlClient::new(dispatcher_url)?;
    client
        .outcome(node)
        .await
        .with_context(|| format!("reading status from {dispatcher_url}"))
}

//! nixfleet-api — control API served by the dispatcher.
//!
//! Agents never open the dispatcher's state file. They long-poll their
//! desired state and report outcomes through these routes, and operators
//! publish deployments through them. Responses use the
//! `{success, data, error}` envelope of [`ApiResponse`].
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | PUT | `/api/v1/nodes/{node}/deployment` | Publish a deployment |
//! | GET | `/api/v1/nodes/{node}/deployment?after=REV&wait_ms=N` | Next desired-state revision after `REV`, 204 if none within the wait |
//! | GET | `/api/v1/nodes/{node}/outcome` | Last reported outcome |
//! | PUT | `/api/v1/nodes/{node}/outcome` | Report an outcome, 413 if over the bucket limit |
//!
//! An invalid node identity is a 400.

pub mod client;
pub mod error;
pub mod handlers;
pub mod types;

use axum::Router;
use axum::routing::get;
use nixfleet_core::NodeIdentity;
use nixfleet_state::{
    DeploymentDescriptor, DeploymentEvent, EventStream, KeyValue, Layout, StateResult, StateStore,
    unix_now,
};
use tracing::info;

pub use client::ControlClient;
pub use error::{ApiError, ApiResult};
pub use types::{ApiResponse, DeploymentUpdate, PublishReceipt};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub desired: KeyValue,
    pub results: KeyValue,
    pub deployments: EventStream,
}

impl ApiState {
    /// Handles on the resources named by `layout`. They must already exist.
    pub fn new(store: &StateStore, layout: &Layout) -> StateResult<Self> {
        Ok(Self {
            desired: store.key_value(&layout.desired_state)?,
            results: store.key_value(&layout.results)?,
            deployments: store.stream(&layout.deployments)?,
        })
    }

    /// Make `descriptor` the desired state of `node` and record the publish
    /// on the deployment stream.
    pub fn publish(
        &self,
        node: &NodeIdentity,
        descriptor: &DeploymentDescriptor,
    ) -> StateResult<PublishReceipt> {
        let revision = self.desired.put_json(node.as_str(), descriptor)?;
        let event = DeploymentEvent {
            node: node.clone(),
            deployment: descriptor.clone(),
            published_at: unix_now(),
        };
        let seq = self.deployments.append_json(&event)?;

        info!(
            %node,
            closure = %descriptor.closure,
            action = descriptor.action.as_str(),
            revision,
            seq,
            "deployment published"
        );
        Ok(PublishReceipt { revision, seq })
    }
}

/// Build the control router over `store`.
pub fn build_router(store: &StateStore, layout: &Layout) -> StateResult<Router> {
    let state = ApiState::new(store, layout)?;

    let api_routes = Router::new()
        .route(
            "/nodes/{node}/deployment",
            get(handlers::next_deployment).put(handlers::publish_deployment),
        )
        .route(
            "/nodes/{node}/outcome",
            get(handlers::get_outcome).put(handlers::report_outcome),
        )
        .with_state(state);

    Ok(Router::new().nest("/api/v1", api_routes))
}

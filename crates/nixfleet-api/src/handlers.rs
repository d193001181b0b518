//! Control API handlers.
//!
//! Each handler reads/writes one node's key and returns an [`ApiResponse`].

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nixfleet_core::NodeIdentity;
use nixfleet_state::{DeploymentDescriptor, DeploymentOutcome, StateError, WatchEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ApiState;
use crate::types::{ApiResponse, DeploymentUpdate};

/// Longest a deployment long-poll is held open.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
    .into_response()
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn state_error(e: StateError) -> Response {
    match e {
        StateError::ValueTooLarge { .. } => {
            error_response(&e.to_string(), StatusCode::PAYLOAD_TOO_LARGE)
        }
        e => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn parse_node(raw: &str) -> Result<NodeIdentity, Response> {
    NodeIdentity::parse(raw).map_err(|e| error_response(&e.to_string(), StatusCode::BAD_REQUEST))
}

// ── Desired state ──────────────────────────────────────────────────

/// PUT /api/v1/nodes/{node}/deployment
pub async fn publish_deployment(
    State(state): State<ApiState>,
    Path(node): Path<String>,
    Json(descriptor): Json<DeploymentDescriptor>,
) -> Response {
    let node = match parse_node(&node) {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    match state.publish(&node, &descriptor) {
        Ok(receipt) => ok(receipt),
        Err(e) => state_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    /// Last revision the caller has seen.
    #[serde(default)]
    pub after: u64,
    #[serde(default)]
    pub wait_ms: u64,
}

/// GET /api/v1/nodes/{node}/deployment?after=REV&wait_ms=N
///
/// Answers at once if the key holds a revision newer than `after`,
/// otherwise waits up to `wait_ms` (capped at [`MAX_WAIT`]) for one.
/// 204 when nothing arrived.
pub async fn next_deployment(
    State(state): State<ApiState>,
    Path(node): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let node = match parse_node(&node) {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    let mut watcher = match state.desired.watch_from(node.as_str(), query.after) {
        Ok(watcher) => watcher,
        Err(e) => return state_error(e),
    };

    let wait = Duration::from_millis(query.wait_ms).min(MAX_WAIT);
    match watcher.next(wait).await {
        Ok(WatchEvent::Entry(entry)) => {
            debug!(%node, revision = entry.revision, "desired state delivered");
            ok(DeploymentUpdate::from_entry(entry))
        }
        Ok(WatchEvent::Timeout) => StatusCode::NO_CONTENT.into_response(),
        Ok(WatchEvent::Closed) => {
            warn!(%node, "change feed closed during long-poll");
            error_response("change feed closed", StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => state_error(e),
    }
}

// ── Outcomes ───────────────────────────────────────────────────────

/// GET /api/v1/nodes/{node}/outcome
pub async fn get_outcome(State(state): State<ApiState>, Path(node): Path<String>) -> Response {
    let node = match parse_node(&node) {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    match state.results.get_json::<DeploymentOutcome>(node.as_str()) {
        Ok(Some(outcome)) => ok(outcome),
        Ok(None) => error_response("no outcome reported", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// PUT /api/v1/nodes/{node}/outcome
pub async fn report_outcome(
    State(state): State<ApiState>,
    Path(node): Path<String>,
    Json(outcome): Json<DeploymentOutcome>,
) -> Response {
    let node = match parse_node(&node) {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    match state.results.put_json(node.as_str(), &outcome) {
        Ok(revision) => {
            debug!(%node, revision, success = outcome.success, "outcome stored");
            ok(revision)
        }
        Err(e) => state_error(e),
    }
}

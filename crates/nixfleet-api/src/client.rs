//! HTTP client for the control API.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use nixfleet_core::NodeIdentity;
use nixfleet_state::{DeploymentDescriptor, DeploymentOutcome};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::types::{ApiResponse, DeploymentUpdate, PublishReceipt};

/// Upper bound for a request that is not a long-poll. Long-polls get this
/// on top of their wait.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Responses larger than this are rejected (4 MiB).
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Talks to a dispatcher's `/api/v1` routes.
#[derive(Clone)]
pub struct ControlClient {
    base: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl ControlClient {
    /// `base` is the dispatcher's `http://host:port`.
    pub fn new(base: &str) -> ApiResult<Self> {
        if !base.starts_with("http://") {
            return Err(ApiError::InvalidUrl(base.to_string()));
        }
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    pub async fn publish(
        &self,
        node: &NodeIdentity,
        descriptor: &DeploymentDescriptor,
    ) -> ApiResult<PublishReceipt> {
        let path = format!("/api/v1/nodes/{node}/deployment");
        self.send(Method::PUT, &path, Some(descriptor), REQUEST_TIMEOUT)
            .await?
            .data()
    }

    /// Next desired-state revision of `node` after `after`, waiting up to
    /// `wait` for one to be published.
    pub async fn next_deployment(
        &self,
        node: &NodeIdentity,
        after: u64,
        wait: Duration,
    ) -> ApiResult<Option<DeploymentUpdate>> {
        let path = format!(
            "/api/v1/nodes/{node}/deployment?after={after}&wait_ms={}",
            wait.as_millis()
        );
        let reply = self
            .send::<()>(Method::GET, &path, None, wait + REQUEST_TIMEOUT)
            .await?;
        if reply.status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        reply.data().map(Some)
    }

    /// Last outcome `node` reported, `None` if it never did.
    pub async fn outcome(&self, node: &NodeIdentity) -> ApiResult<Option<DeploymentOutcome>> {
        let path = format!("/api/v1/nodes/{node}/outcome");
        let reply = self
            .send::<()>(Method::GET, &path, None, REQUEST_TIMEOUT)
            .await?;
        if reply.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        reply.data().map(Some)
    }

    /// Store `outcome` as the result of `node`. Returns the bucket revision.
    pub async fn report(&self, node: &NodeIdentity, outcome: &DeploymentOutcome) -> ApiResult<u64> {
        let path = format!("/api/v1/nodes/{node}/outcome");
        self.send(Method::PUT, &path, Some(outcome), REQUEST_TIMEOUT)
            .await?
            .data()
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> ApiResult<Reply> {
        let url = format!("{}{path}", self.base);
        let failed = |message: String| ApiError::Http {
            url: url.clone(),
            message,
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::USER_AGENT, "nixfleet");
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(body).map_err(|e| failed(e.to_string()))?)
            }
            None => Bytes::new(),
        };
        let req = builder
            .body(Full::new(body))
            .map_err(|e| failed(e.to_string()))?;

        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| failed(e.to_string()))?;
            let status = resp.status();
            let body = Limited::new(resp.into_body(), MAX_RESPONSE_BYTES)
                .collect()
                .await
                .map_err(|e| failed(e.to_string()))?
                .to_bytes();
            Ok::<_, ApiError>((status, body))
        };
        let (status, body) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ApiError::Timeout { url: url.clone() })??;

        debug!(%url, %status, size = body.len(), "control api reply");
        Ok(Reply { url, status, body })
    }
}

struct Reply {
    url: String,
    status: StatusCode,
    body: Bytes,
}

impl Reply {
    /// `data` of a successful envelope.
    fn data<T: DeserializeOwned>(self) -> ApiResult<T> {
        if !self.status.is_success() {
            return Err(self.into_error());
        }
        let envelope: ApiResponse<T> =
            serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode {
                url: self.url.clone(),
                message: e.to_string(),
            })?;
        envelope.data.ok_or_else(|| ApiError::Decode {
            url: self.url,
            message: "response carries no data".to_string(),
        })
    }

    fn into_error(self) -> ApiError {
        // Rejections from the HTTP layer are plain text, not an envelope.
        let message = serde_json::from_slice::<ApiResponse<serde_json::Value>>(&self.body)
            .ok()
            .and_then(|envelope| envelope.error)
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).into_owned());
        if self.status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::TooLarge(message)
        } else {
            ApiError::Status {
                status: self.status.as_u16(),
                message,
            }
        }
    }
}

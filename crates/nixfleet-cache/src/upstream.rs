//! Pull-through source for a cache that starts out empty.
//!
//! A cache with an upstream answers misses by fetching the same path from
//! the upstream cache, storing the result and then serving it locally.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::{Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

#[derive(Clone)]
pub struct Upstream {
    base: String,
    client: Client<HttpConnector, Empty<Bytes>>,
    max_bytes: usize,
}

impl Upstream {
    /// `base` is an `http://host:port` cache URL. Responses larger than
    /// `max_bytes` are rejected.
    pub fn new(base: &str, max_bytes: usize) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
            max_bytes,
        }
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    /// `/{hash}.narinfo` from upstream, `None` if it has no such entry.
    pub async fn narinfo(&self, hash: &str) -> CacheResult<Option<Bytes>> {
        self.fetch(&format!("/{hash}.narinfo")).await
    }

    /// `/nar/{file}` from upstream, `None` if it has no such entry.
    pub async fn nar(&self, file: &str) -> CacheResult<Option<Bytes>> {
        self.fetch(&format!("/nar/{file}")).await
    }

    async fn fetch(&self, path: &str) -> CacheResult<Option<Bytes>> {
        let url = format!("{}{path}", self.base);
        let failed = |message: String| CacheError::Upstream {
            url: url.clone(),
            message,
        };

        let req = Request::get(url.as_str())
            .header(header::USER_AGENT, "nixfleet-cache")
            .body(Empty::new())
            .map_err(|e| failed(e.to_string()))?;
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| failed(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                debug!(%url, "upstream miss");
                return Ok(None);
            }
            status => return Err(failed(format!("unexpected status {status}"))),
        }

        let body = Limited::new(resp.into_body(), self.max_bytes)
            .collect()
            .await
            .map_err(|e| failed(e.to_string()))?
            .to_bytes();
        debug!(%url, size = body.len(), "fetched from upstream");
        Ok(Some(body))
    }
}

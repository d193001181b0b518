//! Cache server lifecycle: `new` -> `init` -> `run`.

use std::net::SocketAddr;

use axum::Router;
use nixfleet_state::StateStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};
use crate::options::CacheOptions;

pub struct CacheServer {
    store: StateStore,
    options: CacheOptions,
    extra: Option<Router>,
    router: Option<Router>,
    listener: Option<TcpListener>,
    addr: Option<SocketAddr>,
}

impl CacheServer {
    pub fn new(store: StateStore, options: CacheOptions) -> Self {
        Self {
            store,
            options,
            extra: None,
            router: None,
            listener: None,
            addr: None,
        }
    }

    /// Serve `routes` next to the cache routes. Takes effect at `init`.
    pub fn merge(mut self, routes: Router) -> Self {
        self.extra = Some(routes);
        self
    }

    /// Validate options, open the storage handles, build the router and
    /// bind the listener.
    pub async fn init(&mut self) -> CacheResult<()> {
        let mut router = crate::build_router(&self.store, &self.options)?;
        if let Some(extra) = self.extra.take() {
            router = router.merge(extra);
        }

        let listener = TcpListener::bind(self.options.bind)
            .await
            .map_err(|source| CacheError::Bind {
                addr: self.options.bind,
                source,
            })?;
        let addr = listener.local_addr()?;

        if self.options.quiet {
            debug!(%addr, "cache proxy bound");
        } else {
            info!(
                %addr,
                name = self.options.name().unwrap_or_default(),
                "binary cache listening"
            );
        }

        self.router = Some(router);
        self.listener = Some(listener);
        self.addr = Some(addr);
        Ok(())
    }

    /// Bound address. `None` until [`init`](Self::init) succeeded.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn router(&self) -> Option<Router> {
        self.router.clone()
    }

    /// Serve until `shutdown` turns true. Calls `init` first if needed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> CacheResult<()> {
        if self.listener.is_none() {
            self.init().await?;
        }
        let (Some(listener), Some(router)) = (self.listener.take(), self.router.take()) else {
            return Err(CacheError::InvalidOptions("server was not initialized".to_string()));
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        if self.options.quiet {
            debug!("cache proxy stopped");
        } else {
            info!("binary cache stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nixfleet_core::SecretKey;
    use nixfleet_state::{Layout, bootstrap};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn test_server() -> CacheServer {
        let store = StateStore::open_in_memory().unwrap();
        let layout = Layout::default();
        bootstrap(&store, &layout).unwrap();
        let key = Arc::new(SecretKey::from_seed("test-cache-1", [1; 32]));
        let mut options = CacheOptions::new(key, &layout);
        options.bind = SocketAddr::from(([127, 0, 0, 1], 0));
        CacheServer::new(store, options)
    }

    #[tokio::test]
    async fn init_binds_ephemeral_port() {
        let mut server = test_server();
        assert!(server.listen_addr().is_none());
        server.init().await.unwrap();

        let addr = server.listen_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn init_rejects_missing_key() {
        let store = StateStore::open_in_memory().unwrap();
        let layout = Layout::default();
        bootstrap(&store, &layout).unwrap();
        let mut options = CacheOptions::new(Arc::new(SecretKey::from_seed("k", [1; 32])), &layout);
        options.secret_key = None;

        let mut server = CacheServer::new(store, options);
        assert!(matches!(
            server.init().await,
            Err(CacheError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn init_requires_bootstrapped_store() {
        let store = StateStore::open_in_memory().unwrap();
        let options = CacheOptions::new(
            Arc::new(SecretKey::from_seed("k", [1; 32])),
            &Layout::default(),
        );
        let mut server = CacheServer::new(store, options);
        assert!(matches!(server.init().await, Err(CacheError::State(_))));
    }

    #[tokio::test]
    async fn run_serves_until_shutdown() {
        let mut server = test_server();
        server.init().await.unwrap();
        let addr = server.listen_addr().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(stop_rx));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /nix-cache-info HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 1\n"));

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn merged_routes_are_served() {
        use axum::routing::get;
        use tower::ServiceExt;

        let mut server = test_server().merge(Router::new().route("/extra", get(|| async { "extra" })));
        server.init().await.unwrap();
        let router = server.router().unwrap();

        for uri in ["/extra", "/nix-cache-info"] {
            let req = axum::http::Request::builder()
                .uri(uri)
                .body(axum::body::Body::empty())
                .unwrap();
            let resp = router.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), axum::http::StatusCode::OK, "{uri}");
        }
    }
}

//! nixfleet-cache — a Nix binary cache served from the state store.
//!
//! Narinfo documents live in a bucket keyed by store hash, nar files in an
//! object store keyed by `<hash>-<compression>`. Narinfos are signed with
//! the cache key the first time they are read, so uploaders never need the
//! key.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/nix-cache-info` | Cache metadata |
//! | GET, HEAD | `/{hash}.narinfo` | Narinfo, signed on first read |
//! | PUT | `/{hash}.narinfo` | Store a narinfo verbatim |
//! | GET | `/nar/{hash}.nar.{compression}` | Stream a nar file |
//! | HEAD | `/nar/{hash}.nar.{compression}` | Nar size, no body |
//! | PUT | `/nar/{hash}.nar.{compression}` | Store a nar file |
//!
//! Unknown paths and invalid hashes are a 404, a miss is a 404, and any
//! storage or decoding failure is a 500. Two statuses come from the HTTP
//! layer rather than the cache: a method a route doesn't serve is a 405,
//! and an upload over `max_upload_bytes` is a 413. Error responses carry
//! no body.
//!
//! With an `upstream` set, misses on narinfo and nar reads are fetched
//! from that cache and stored before being served.

pub mod error;
pub mod options;
pub mod routes;
pub mod server;
pub mod upstream;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use nixfleet_state::StateStore;
use tower_http::trace::TraceLayer;

pub use error::{CacheError, CacheResult};
pub use options::{CacheOptions, DEFAULT_BIND, DEFAULT_MAX_UPLOAD_BYTES};
pub use routes::{CONTENT_TYPE_NAR, CONTENT_TYPE_NARINFO, CacheState};
pub use server::CacheServer;
pub use upstream::Upstream;

/// Build the cache router over `store`. The store must already hold the
/// buckets and object store named in `options`.
pub fn build_router(store: &StateStore, options: &CacheOptions) -> CacheResult<Router> {
    options.validate()?;
    let key = options
        .secret_key
        .clone()
        .ok_or_else(|| CacheError::InvalidOptions("a secret key is required".to_string()))?;

    let state = CacheState {
        narinfo: store.key_value(&options.narinfo_bucket)?,
        access: store.key_value(&options.access_bucket)?,
        nar: store.object_store(&options.nar_store)?,
        key,
        info: options.cache_info(),
        upstream: options
            .upstream
            .as_deref()
            .map(|url| Upstream::new(url, options.max_upload_bytes)),
    };

    let router = Router::new()
        .route("/nix-cache-info", get(routes::cache_info))
        .route("/{file}", get(routes::get_narinfo).put(routes::put_narinfo))
        .route(
            "/nar/{file}",
            get(routes::get_nar)
                .head(routes::head_nar)
                .put(routes::put_nar),
        )
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .with_state(state);

    if options.quiet {
        Ok(router)
    } else {
        Ok(router.layer(TraceLayer::new_for_http()))
    }
}

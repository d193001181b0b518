//! nixfleet-state — the durable state layer shared by the fleet.
//!
//! Backed by [redb](https://docs.rs/redb), provides the three storage
//! primitives the cache server and the deployment agents rely on:
//!
//! - **key-value buckets**: last value per key, a store-wide revision
//!   stamped on every write, compare-and-swap updates, and watches
//! - **object stores**: chunked blobs with size and SHA-256 digest metadata
//! - **event streams**: append-only, sequence-numbered message logs
//!
//! # Architecture
//!
//! All resources live in one redb database. Bucket entries are keyed by
//! `(bucket, key)`, object chunks by `(store, name, index)`, and stream
//! messages by `(stream, seq)`, so each resource is a contiguous key range.
//! A resource must be created by [`bootstrap`] (or the individual
//! `ensure_*` calls) before handles to it can be opened.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Bucket writes are broadcast to
//! in-process watchers after they commit.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod bootstrap;
pub mod error;
pub mod kv;
pub mod object;
pub mod store;
pub mod stream;
pub mod tables;
pub mod types;

pub use bootstrap::{Layout, bootstrap};
pub use error::{StateError, StateResult};
pub use kv::{KeyValue, WatchEvent, Watcher};
pub use object::ObjectStore;
pub use store::StateStore;
pub use stream::EventStream;
pub use types::*;

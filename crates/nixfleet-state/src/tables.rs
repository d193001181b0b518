//! redb table definitions for the nixfleet state store.
//!
//! Resource registries use `&str` keys and JSON `&[u8]` configs. Data tables
//! use tuple keys whose first element is the owning resource name.

use redb::TableDefinition;

/// Bucket configs keyed by bucket name.
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");

/// Object store configs keyed by store name.
pub const OBJECT_STORES: TableDefinition<&str, &[u8]> = TableDefinition::new("object_stores");

/// Stream configs keyed by stream name.
pub const STREAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("streams");

/// Bucket values keyed by `(bucket, key)`.
pub const KV_ENTRIES: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("kv_entries");

/// Revision of the last write to `(bucket, key)`.
pub const KV_REVISIONS: TableDefinition<(&str, &str), u64> = TableDefinition::new("kv_revisions");

/// Object metadata keyed by `(store, name)`.
pub const OBJECT_INFO: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("object_info");

/// Object payload chunks keyed by `(store, name, index)`.
pub const OBJECT_CHUNKS: TableDefinition<(&str, &str, u32), &[u8]> =
    TableDefinition::new("object_chunks");

/// Stream messages keyed by `(stream, seq)`.
pub const STREAM_MESSAGES: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("stream_messages");

/// Monotonic counters: the store-wide bucket revision and one sequence per stream.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Key in [`SEQUENCES`] holding the last issued bucket revision.
pub const KV_REVISION_SEQ: &str = "kv";

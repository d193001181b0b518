//! StateStore — redb-backed state persistence for nixfleet.
//!
//! Owns the database and the in-process change feed. Resources are
//! registered with `ensure_*` and accessed through typed handles
//! ([`KeyValue`], [`ObjectStore`], [`EventStream`]). The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::KeyValue;
use crate::object::ObjectStore;
use crate::stream::EventStream;
use crate::tables::*;
use crate::types::*;

/// Watchers that fall further behind than this get a lag notice and
/// re-read the current value.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    changes: broadcast::Sender<KvEntry>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            changes,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(BUCKETS).map_err(map_err!(Table))?;
        txn.open_table(OBJECT_STORES).map_err(map_err!(Table))?;
        txn.open_table(STREAMS).map_err(map_err!(Table))?;
        txn.open_table(KV_ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(KV_REVISIONS).map_err(map_err!(Table))?;
        txn.open_table(OBJECT_INFO).map_err(map_err!(Table))?;
        txn.open_table(OBJECT_CHUNKS).map_err(map_err!(Table))?;
        txn.open_table(STREAM_MESSAGES).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Resource registration ──────────────────────────────────────

    /// Register a key-value bucket. Returns true if it was created.
    pub fn ensure_bucket(&self, name: &str, config: &BucketConfig) -> StateResult<bool> {
        self.ensure_resource(BUCKETS, name, config)
    }

    /// Register an object store. Returns true if it was created.
    pub fn ensure_object_store(&self, name: &str, config: &ObjectStoreConfig) -> StateResult<bool> {
        self.ensure_resource(OBJECT_STORES, name, config)
    }

    /// Register an event stream. Returns true if it was created.
    pub fn ensure_stream(&self, name: &str, config: &StreamConfig) -> StateResult<bool> {
        self.ensure_resource(STREAMS, name, config)
    }

    /// Insert `config` under `name` unless the resource already exists.
    /// An existing resource keeps its original config.
    fn ensure_resource<C: Serialize>(
        &self,
        table_def: TableDefinition<'static, &'static str, &'static [u8]>,
        name: &str,
        config: &C,
    ) -> StateResult<bool> {
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            created = table.get(name).map_err(map_err!(Read))?.is_none();
            if created {
                table
                    .insert(name, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, created, "resource ensured");
        Ok(created)
    }

    fn resource_config<C: DeserializeOwned>(
        &self,
        table_def: TableDefinition<'static, &'static str, &'static [u8]>,
        kind: &str,
        name: &str,
    ) -> StateResult<C> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::MissingResource(format!("{kind} '{name}'"))),
        }
    }

    // ── Handles ────────────────────────────────────────────────────

    /// Open a handle to an existing bucket.
    pub fn key_value(&self, name: &str) -> StateResult<KeyValue> {
        let config: BucketConfig = self.resource_config(BUCKETS, "bucket", name)?;
        Ok(KeyValue::new(self.clone(), name, config))
    }

    /// Open a handle to an existing object store.
    pub fn object_store(&self, name: &str) -> StateResult<ObjectStore> {
        let config: ObjectStoreConfig = self.resource_config(OBJECT_STORES, "object store", name)?;
        Ok(ObjectStore::new(self.clone(), name, config))
    }

    /// Open a handle to an existing event stream.
    pub fn stream(&self, name: &str) -> StateResult<EventStream> {
        let config: StreamConfig = self.resource_config(STREAMS, "stream", name)?;
        Ok(EventStream::new(self.clone(), name, config))
    }

    // ── Crate internals ────────────────────────────────────────────

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<KvEntry> {
        self.changes.subscribe()
    }

    /// Announce a committed bucket write. Having no watchers is fine.
    pub(crate) fn publish(&self, entry: KvEntry) {
        let _ = self.changes.send(entry);
    }
}

/// Advance the named counter in [`SEQUENCES`] and return the new value.
pub(crate) fn next_sequence(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let next = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_bucket_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let config = BucketConfig::new("desired state");

        assert!(store.ensure_bucket("agent-deployments", &config).unwrap());
        assert!(!store.ensure_bucket("agent-deployments", &config).unwrap());
    }

    #[test]
    fn existing_resource_keeps_its_config() {
        let store = StateStore::open_in_memory().unwrap();
        let first = ObjectStoreConfig {
            description: "nars".to_string(),
            chunk_size: 16,
        };
        let second = ObjectStoreConfig {
            description: "nars".to_string(),
            chunk_size: 4096,
        };
        store.ensure_object_store("nar", &first).unwrap();
        store.ensure_object_store("nar", &second).unwrap();

        assert_eq!(store.object_store("nar").unwrap().chunk_size(), 16);
    }

    #[test]
    fn handles_require_registration() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.key_value("nope"),
            Err(StateError::MissingResource(_))
        ));
        assert!(matches!(
            store.object_store("nope"),
            Err(StateError::MissingResource(_))
        ));
        assert!(matches!(
            store.stream("nope"),
            Err(StateError::MissingResource(_))
        ));
    }

    #[test]
    fn resource_kinds_are_separate_namespaces() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .ensure_bucket("shared-name", &BucketConfig::new("kv"))
            .unwrap();
        assert!(store.key_value("shared-name").is_ok());
        assert!(store.object_store("shared-name").is_err());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .ensure_bucket("results", &BucketConfig::new("results"))
                .unwrap();
            store
                .key_value("results")
                .unwrap()
                .put("node-a", b"done")
                .unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let entry = store.key_value("results").unwrap().get("node-a").unwrap();
        assert_eq!(entry.unwrap().value, b"done");
    }
}

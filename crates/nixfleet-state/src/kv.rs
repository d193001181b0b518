//! Key-value buckets.
//!
//! Every write to any bucket takes the next value of one store-wide
//! revision counter. `update` is a compare-and-swap against that revision;
//! a key that was never written (or was deleted) has revision 0.

use std::time::Duration;

use redb::{ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, next_sequence};
use crate::tables::*;
use crate::types::*;

/// Handle to one registered bucket.
#[derive(Clone)]
pub struct KeyValue {
    store: StateStore,
    name: String,
    config: BucketConfig,
}

impl KeyValue {
    pub(crate) fn new(store: StateStore, name: &str, config: BucketConfig) -> Self {
        Self {
            store,
            name: name.to_string(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Current value and revision of `key`.
    pub fn get(&self, key: &str) -> StateResult<Option<KvEntry>> {
        let txn = self.store.db().begin_read().map_err(map_err!(Transaction))?;
        let entries = txn.open_table(KV_ENTRIES).map_err(map_err!(Table))?;
        let revisions = txn.open_table(KV_REVISIONS).map_err(map_err!(Table))?;

        let value = match entries.get((self.name.as_str(), key)).map_err(map_err!(Read))? {
            Some(guard) => guard.value().to_vec(),
            None => return Ok(None),
        };
        let revision = revisions
            .get((self.name.as_str(), key))
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);

        Ok(Some(KvEntry {
            bucket: self.name.clone(),
            key: key.to_string(),
            value,
            revision,
            operation: Operation::Put,
        }))
    }

    /// Decode the current value of `key` as JSON.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        match self.get(key)? {
            Some(entry) => serde_json::from_slice(&entry.value)
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    /// Unconditionally set `key`. Returns the new revision.
    pub fn put(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        self.write(key, value, None)
    }

    /// Serialize `value` as JSON and `put` it.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StateResult<u64> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.put(key, &bytes)
    }

    /// Set `key` only if it does not exist yet.
    pub fn create(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        self.write(key, value, Some(0))
    }

    /// Set `key` only if its revision is still `expected_revision`.
    ///
    /// Fails with [`StateError::Conflict`] otherwise, leaving the bucket
    /// untouched.
    pub fn update(&self, key: &str, value: &[u8], expected_revision: u64) -> StateResult<u64> {
        self.write(key, value, Some(expected_revision))
    }

    fn write(&self, key: &str, value: &[u8], expected: Option<u64>) -> StateResult<u64> {
        if value.len() > self.config.max_value_size {
            return Err(StateError::ValueTooLarge {
                key: format!("{}/{}", self.name, key),
                size: value.len(),
                limit: self.config.max_value_size,
            });
        }

        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        let revision;
        {
            let mut revisions = txn.open_table(KV_REVISIONS).map_err(map_err!(Table))?;
            let current = revisions
                .get((self.name.as_str(), key))
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);

            if let Some(expected) = expected {
                if current != expected {
                    return Err(StateError::Conflict {
                        key: format!("{}/{}", self.name, key),
                        expected,
                        actual: current,
                    });
                }
            }

            revision = next_sequence(&txn, KV_REVISION_SEQ)?;
            revisions
                .insert((self.name.as_str(), key), revision)
                .map_err(map_err!(Write))?;

            let mut entries = txn.open_table(KV_ENTRIES).map_err(map_err!(Table))?;
            entries
                .insert((self.name.as_str(), key), value)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(bucket = %self.name, %key, revision, "kv put");
        self.store.publish(KvEntry {
            bucket: self.name.clone(),
            key: key.to_string(),
            value: value.to_vec(),
            revision,
            operation: Operation::Put,
        });
        Ok(revision)
    }

    /// Remove `key`. Returns true if it existed.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let mut revision = 0;
        {
            let mut entries = txn.open_table(KV_ENTRIES).map_err(map_err!(Table))?;
            existed = entries
                .remove((self.name.as_str(), key))
                .map_err(map_err!(Write))?
                .is_some();
            if existed {
                let mut revisions = txn.open_table(KV_REVISIONS).map_err(map_err!(Table))?;
                revisions
                    .remove((self.name.as_str(), key))
                    .map_err(map_err!(Write))?;
                revision = next_sequence(&txn, KV_REVISION_SEQ)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if existed {
            debug!(bucket = %self.name, %key, revision, "kv delete");
            self.store.publish(KvEntry {
                bucket: self.name.clone(),
                key: key.to_string(),
                value: Vec::new(),
                revision,
                operation: Operation::Delete,
            });
        }
        Ok(existed)
    }

    /// All keys currently present, in key order.
    pub fn keys(&self) -> StateResult<Vec<String>> {
        let txn = self.store.db().begin_read().map_err(map_err!(Transaction))?;
        let entries = txn.open_table(KV_ENTRIES).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in entries
            .range((self.name.as_str(), "")..)
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let (bucket, key) = key.value();
            if bucket != self.name {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    /// Watch `key`: the current value (if any) is delivered first, then
    /// every later put or delete.
    pub fn watch(&self, key: &str) -> StateResult<Watcher> {
        self.watch_from(key, 0)
    }

    /// Watch `key` for revisions newer than `after`. The current value is
    /// delivered first only if it is newer.
    pub fn watch_from(&self, key: &str, after: u64) -> StateResult<Watcher> {
        // Subscribe before reading so no write can slip between the two.
        let changes = self.store.subscribe();
        let pending = self.get(key)?.filter(|entry| entry.revision > after);
        Ok(Watcher {
            kv: self.clone(),
            key: key.to_string(),
            changes,
            pending,
            last_revision: after,
        })
    }
}

/// What a watcher produced within one wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Entry(KvEntry),
    /// Nothing arrived before the wait elapsed.
    Timeout,
    /// The store's change feed is gone.
    Closed,
}

/// Change feed for a single bucket key.
pub struct Watcher {
    kv: KeyValue,
    key: String,
    changes: broadcast::Receiver<KvEntry>,
    pending: Option<KvEntry>,
    last_revision: u64,
}

impl Watcher {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait up to `timeout` for the next change to the watched key.
    ///
    /// Revisions never go backwards: a value already delivered is not
    /// delivered again. If the watcher lagged behind the feed, the newest
    /// value is re-read and intermediate revisions are skipped.
    pub async fn next(&mut self, timeout: Duration) -> StateResult<WatchEvent> {
        if let Some(entry) = self.pending.take() {
            self.last_revision = entry.revision;
            return Ok(WatchEvent::Entry(entry));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.changes.recv()).await {
                Err(_) => return Ok(WatchEvent::Timeout),
                Ok(Ok(entry)) => {
                    if entry.bucket != self.kv.name
                        || entry.key != self.key
                        || entry.revision <= self.last_revision
                    {
                        continue;
                    }
                    self.last_revision = entry.revision;
                    return Ok(WatchEvent::Entry(entry));
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(bucket = %self.kv.name, key = %self.key, skipped, "watcher lagged, re-reading");
                    if let Some(current) = self.kv.get(&self.key)? {
                        if current.revision > self.last_revision {
                            self.last_revision = current.revision;
                            return Ok(WatchEvent::Entry(current));
                        }
                    }
                }
                Ok(Err(RecvError::Closed)) => return Ok(WatchEvent::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bucket() -> KeyValue {
        let store = StateStore::open_in_memory().unwrap();
        store
            .ensure_bucket("test", &BucketConfig::new("test bucket"))
            .unwrap();
        store.key_value("test").unwrap()
    }

    #[test]
    fn put_and_get() {
        let kv = test_bucket();
        let rev = kv.put("a", b"one").unwrap();

        let entry = kv.get("a").unwrap().unwrap();
        assert_eq!(entry.value, b"one");
        assert_eq!(entry.revision, rev);
        assert_eq!(entry.operation, Operation::Put);
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let kv = test_bucket();
        assert!(kv.get("missing").unwrap().is_none());
        assert!(kv.get_json::<AccessMarker>("missing").unwrap().is_none());
    }

    #[test]
    fn revisions_increase_across_keys() {
        let kv = test_bucket();
        let r1 = kv.put("a", b"1").unwrap();
        let r2 = kv.put("b", b"2").unwrap();
        let r3 = kv.put("a", b"3").unwrap();
        assert!(r1 < r2 && r2 < r3);
    }

    #[test]
    fn update_succeeds_on_matching_revision() {
        let kv = test_bucket();
        let rev = kv.put("a", b"old").unwrap();
        let next = kv.update("a", b"new", rev).unwrap();
        assert!(next > rev);
        assert_eq!(kv.get("a").unwrap().unwrap().value, b"new");
    }

    #[test]
    fn update_conflicts_on_stale_revision() {
        let kv = test_bucket();
        let stale = kv.put("a", b"v1").unwrap();
        kv.put("a", b"v2").unwrap();

        let err = kv.update("a", b"v3", stale).unwrap_err();
        assert!(matches!(err, StateError::Conflict { expected, .. } if expected == stale));
        assert_eq!(kv.get("a").unwrap().unwrap().value, b"v2");
    }

    #[test]
    fn create_only_once() {
        let kv = test_bucket();
        kv.create("a", b"first").unwrap();
        assert!(matches!(
            kv.create("a", b"second"),
            Err(StateError::Conflict { .. })
        ));
    }

    #[test]
    fn delete_resets_revision() {
        let kv = test_bucket();
        kv.put("a", b"x").unwrap();
        assert!(kv.delete("a").unwrap());
        assert!(!kv.delete("a").unwrap());
        assert!(kv.get("a").unwrap().is_none());
        kv.create("a", b"again").unwrap();
    }

    #[test]
    fn oversized_values_are_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let config = BucketConfig {
            description: "tiny".to_string(),
            max_value_size: 4,
        };
        store.ensure_bucket("tiny", &config).unwrap();
        let kv = store.key_value("tiny").unwrap();

        assert!(kv.put("k", b"1234").is_ok());
        assert!(matches!(
            kv.put("k", b"12345"),
            Err(StateError::ValueTooLarge { size: 5, limit: 4, .. })
        ));
    }

    #[test]
    fn keys_are_scoped_to_bucket() {
        let store = StateStore::open_in_memory().unwrap();
        store.ensure_bucket("a", &BucketConfig::new("a")).unwrap();
        store.ensure_bucket("b", &BucketConfig::new("b")).unwrap();
        let a = store.key_value("a").unwrap();
        let b = store.key_value("b").unwrap();

        a.put("x", b"1").unwrap();
        a.put("y", b"2").unwrap();
        b.put("z", b"3").unwrap();

        assert_eq!(a.keys().unwrap(), vec!["x", "y"]);
        assert_eq!(b.keys().unwrap(), vec!["z"]);
        assert!(a.get("z").unwrap().is_none());
    }

    #[test]
    fn json_helpers_roundtrip() {
        let kv = test_bucket();
        let marker = AccessMarker { accessed_at: 42 };
        kv.put_json("h", &marker).unwrap();
        assert_eq!(kv.get_json::<AccessMarker>("h").unwrap(), Some(marker));
    }

    #[tokio::test]
    async fn watch_delivers_current_value_first() {
        let kv = test_bucket();
        kv.put("node", b"v1").unwrap();

        let mut watcher = kv.watch("node").unwrap();
        match watcher.next(Duration::from_millis(10)).await.unwrap() {
            WatchEvent::Entry(entry) => assert_eq!(entry.value, b"v1"),
            other => panic!("expected entry, got {other:?}"),
        }
        assert_eq!(
            watcher.next(Duration::from_millis(10)).await.unwrap(),
            WatchEvent::Timeout
        );
    }

    #[tokio::test]
    async fn watch_sees_updates_and_deletes_for_its_key_only() {
        let kv = test_bucket();
        let mut watcher = kv.watch("node").unwrap();

        kv.put("other", b"ignored").unwrap();
        kv.put("node", b"v2").unwrap();
        kv.delete("node").unwrap();

        match watcher.next(Duration::from_millis(50)).await.unwrap() {
            WatchEvent::Entry(entry) => {
                assert_eq!(entry.key, "node");
                assert_eq!(entry.value, b"v2");
                assert_eq!(entry.operation, Operation::Put);
            }
            other => panic!("expected put, got {other:?}"),
        }
        match watcher.next(Duration::from_millis(50)).await.unwrap() {
            WatchEvent::Entry(entry) => assert_eq!(entry.operation, Operation::Delete),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_from_skips_revisions_already_seen() {
        let kv = test_bucket();
        let seen = kv.put("node", b"v1").unwrap();

        let mut watcher = kv.watch_from("node", seen).unwrap();
        assert_eq!(
            watcher.next(Duration::from_millis(10)).await.unwrap(),
            WatchEvent::Timeout
        );

        let mut stale = kv.watch_from("node", seen - 1).unwrap();
        match stale.next(Duration::from_millis(10)).await.unwrap() {
            WatchEvent::Entry(entry) => assert_eq!(entry.revision, seen),
            other => panic!("expected current entry, got {other:?}"),
        }

        kv.put("node", b"v2").unwrap();
        match watcher.next(Duration::from_millis(50)).await.unwrap() {
            WatchEvent::Entry(entry) => assert_eq!(entry.value, b"v2"),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_watcher_coalesces_to_newest() {
        let kv = test_bucket();
        let mut watcher = kv.watch("node").unwrap();

        for i in 0..300u32 {
            kv.put("node", i.to_string().as_bytes()).unwrap();
        }

        match watcher.next(Duration::from_millis(50)).await.unwrap() {
            WatchEvent::Entry(entry) => assert_eq!(entry.value, b"299"),
            other => panic!("expected newest entry, got {other:?}"),
        }
    }
}

//! Chunked object storage.
//!
//! Objects are split into `chunk_size` pieces stored under
//! `(store, name, index)`. Metadata carries the total size and a SHA-256
//! digest so identical rewrites can be skipped.

use redb::{ReadableDatabase, ReadableTable};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::tables::*;
use crate::types::*;

/// Handle to one registered object store.
#[derive(Clone)]
pub struct ObjectStore {
    store: StateStore,
    name: String,
    config: ObjectStoreConfig,
}

impl ObjectStore {
    pub(crate) fn new(store: StateStore, name: &str, config: ObjectStoreConfig) -> Self {
        Self {
            store,
            name: name.to_string(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> u32 {
        self.config.chunk_size
    }

    /// Store `data` under `name`, replacing any previous object.
    ///
    /// Writing the same bytes again leaves the stored object (and its
    /// `modified_at`) unchanged.
    pub fn put(&self, name: &str, data: &[u8]) -> StateResult<ObjectInfo> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));

        if let Some(existing) = self.info(name)? {
            if existing.digest == digest && existing.size == data.len() as u64 {
                debug!(store = %self.name, %name, "object unchanged");
                return Ok(existing);
            }
        }

        let chunk_size = self.config.chunk_size.max(1) as usize;
        let chunks = data.chunks(chunk_size).count() as u32;
        let info = ObjectInfo {
            name: name.to_string(),
            size: data.len() as u64,
            chunk_size: chunk_size as u32,
            chunks,
            digest,
            modified_at: unix_now(),
        };
        let encoded = serde_json::to_vec(&info).map_err(map_err!(Serialize))?;

        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        {
            let mut infos = txn.open_table(OBJECT_INFO).map_err(map_err!(Table))?;
            let previous = infos
                .get((self.name.as_str(), name))
                .map_err(map_err!(Read))?
                .map(|guard| serde_json::from_slice::<ObjectInfo>(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?;

            let mut table = txn.open_table(OBJECT_CHUNKS).map_err(map_err!(Table))?;
            if let Some(previous) = previous {
                for idx in 0..previous.chunks {
                    table
                        .remove((self.name.as_str(), name, idx))
                        .map_err(map_err!(Write))?;
                }
            }
            for (idx, chunk) in data.chunks(chunk_size).enumerate() {
                table
                    .insert((self.name.as_str(), name, idx as u32), chunk)
                    .map_err(map_err!(Write))?;
            }

            infos
                .insert((self.name.as_str(), name), encoded.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(store = %self.name, %name, size = info.size, chunks, "object stored");
        Ok(info)
    }

    /// Metadata for `name`, if present.
    pub fn info(&self, name: &str) -> StateResult<Option<ObjectInfo>> {
        let txn = self.store.db().begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECT_INFO).map_err(map_err!(Table))?;
        match table.get((self.name.as_str(), name)).map_err(map_err!(Read))? {
            Some(guard) => {
                let info = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// One chunk of `name`. `None` past the last chunk.
    pub fn chunk(&self, name: &str, index: u32) -> StateResult<Option<Vec<u8>>> {
        let txn = self.store.db().begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECT_CHUNKS).map_err(map_err!(Table))?;
        let chunk = table
            .get((self.name.as_str(), name, index))
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(chunk)
    }

    /// The whole payload of `name`.
    pub fn read_all(&self, name: &str) -> StateResult<Option<Vec<u8>>> {
        let Some(info) = self.info(name)? else {
            return Ok(None);
        };
        let mut data = Vec::with_capacity(info.size as usize);
        for idx in 0..info.chunks {
            match self.chunk(name, idx)? {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => {
                    return Err(StateError::NotFound(format!(
                        "chunk {idx} of object '{}/{name}'",
                        self.name
                    )));
                }
            }
        }
        Ok(Some(data))
    }

    /// Remove `name` and all its chunks. Returns true if it existed.
    pub fn delete(&self, name: &str) -> StateResult<bool> {
        let Some(info) = self.info(name)? else {
            return Ok(false);
        };
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        {
            let mut chunks = txn.open_table(OBJECT_CHUNKS).map_err(map_err!(Table))?;
            for idx in 0..info.chunks {
                chunks
                    .remove((self.name.as_str(), name, idx))
                    .map_err(map_err!(Write))?;
            }
            let mut infos = txn.open_table(OBJECT_INFO).map_err(map_err!(Table))?;
            infos
                .remove((self.name.as_str(), name))
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(store = %self.name, %name, "object deleted");
        Ok(true)
    }
}

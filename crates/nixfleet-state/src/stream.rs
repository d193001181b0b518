//! Append-only event streams.

use redb::ReadableDatabase;
use serde::Serialize;
use tracing::debug;

use crate::error::StateResult;
use crate::store::{StateStore, next_sequence};
use crate::tables::*;
use crate::types::*;

#[derive(Clone)]
pub struct EventStream {
    store: StateStore,
    name: String,
    config: StreamConfig,
}

impl EventStream {
    pub(crate) fn new(store: StateStore, name: &str, config: StreamConfig) -> Self {
        Self {
            store,
            name: name.to_string(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn sequence_key(&self) -> String {
        format!("stream:{}", self.name)
    }

    /// Append a message and return its sequence number (starting at 1).
    pub fn append(&self, payload: &[u8]) -> StateResult<u64> {
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        let seq = next_sequence(&txn, &self.sequence_key())?;
        {
            let mut table = txn.open_table(STREAM_MESSAGES).map_err(map_err!(Table))?;
            table
                .insert((self.name.as_str(), seq), payload)
                .map_err(map_err!(Write))?;

            if let Some(max) = self.config.max_messages {
                if seq > max {
                    table
                        .remove((self.name.as_str(), seq - max))
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(stream = %self.name, seq, "message appended");
        Ok(seq)
    }

    pub fn append_json<T: Serialize>(&self, message: &T) -> StateResult<u64> {
        let bytes = serde_json::to_vec(message).map_err(map_err!(Serialize))?;
        self.append(&bytes)
    }

    /// Up to `limit` messages with `seq >= from`, oldest first.
    pub fn read(&self, from: u64, limit: usize) -> StateResult<Vec<StreamMessage>> {
        let txn = self.store.db().begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STREAM_MESSAGES).map_err(map_err!(Table))?;
        let mut messages = Vec::new();
        for entry in table
            .range((self.name.as_str(), from)..=(self.name.as_str(), u64::MAX))
            .map_err(map_err!(Read))?
        {
            if messages.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(map_err!(Read))?;
            let (_, seq) = key.value();
            messages.push(StreamMessage {
                seq,
                payload: value.value().to_vec(),
            });
        }
        Ok(messages)
    }

    /// Sequence number of the newest message, 0 if nothing was appended.
    pub fn last_seq(&self) -> StateResult<u64> {
        let txn = self.store.db().begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        let seq = table
            .get(self.sequence_key().as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(seq)
    }
}

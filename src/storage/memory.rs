// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered in-memory storage engine.
//!
//! A single lock guards messages, tombstones and counters, so every batch is
//! applied as one critical section.

use super::{
    belongs_to, decode_stored, retention_cutoff_ticks, tombstone_expired, MessageReader, Storage,
    StorageFuture, StorageKey,
};
use crate::matcher::{EntryKind, MatcherEntry};
use crate::model::{PeerId, TransportMessage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct MemoryState {
    messages: BTreeMap<Vec<u8>, Vec<u8>>,
    out_of_order_acks: HashSet<Vec<u8>>,
    counts: HashMap<PeerId, i64>,
}

/// Storage engine keeping everything in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    ack_retention: Duration,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_ack_retention(Duration::from_secs(24 * 60 * 60))
    }

    pub fn with_ack_retention(ack_retention: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            ack_retention,
        }
    }

    /// Number of outstanding out-of-order ack tombstones.
    pub async fn out_of_order_ack_count(&self) -> usize {
        self.state.lock().await.out_of_order_acks.len()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for InMemoryStorage {
    fn start(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let cutoff = retention_cutoff_ticks(self.ack_retention);
            let mut state = self.state.lock().await;
            let before = state.out_of_order_acks.len();
            state
                .out_of_order_acks
                .retain(|key| !tombstone_expired(key, cutoff));
            let pruned = before - state.out_of_order_acks.len();
            if pruned > 0 {
                info!(pruned, "Pruned expired out-of-order acks");
            }
            Ok(())
        })
    }

    fn stop(&self) -> StorageFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn write<'a>(&'a self, entries: &'a [MatcherEntry]) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut deltas: HashMap<&PeerId, i64> = HashMap::new();

            for entry in entries {
                match &entry.kind {
                    EntryKind::Message(bytes) => {
                        let delta = deltas.entry(&entry.peer_id).or_insert(0);
                        let key = entry.key().into_bytes();
                        if state.out_of_order_acks.remove(&key) {
                            debug!(
                                peer_id = %entry.peer_id,
                                message_id = %entry.message_id,
                                "Message already acked, not storing"
                            );
                            continue;
                        }
                        if state.messages.insert(key, bytes.clone()).is_none() {
                            *delta += 1;
                        }
                    }
                    EntryKind::Ack => {
                        let key = entry.key().into_bytes();
                        if state.messages.remove(&key).is_some() {
                            *deltas.entry(&entry.peer_id).or_insert(0) -= 1;
                        } else {
                            state.out_of_order_acks.insert(key);
                        }
                    }
                    EntryKind::Signal(_) => {}
                }
            }

            for (peer_id, delta) in deltas {
                *state.counts.entry(peer_id.clone()).or_insert(0) += delta;
            }
            Ok(())
        })
    }

    fn create_message_reader(
        &self,
        peer_id: &PeerId,
    ) -> StorageFuture<'_, Option<Box<dyn MessageReader>>> {
        let peer_id = peer_id.clone();
        Box::pin(async move {
            if !self.state.lock().await.counts.contains_key(&peer_id) {
                return Ok(None);
            }
            let reader: Box<dyn MessageReader> = Box::new(InMemoryMessageReader {
                state: Arc::clone(&self.state),
                peer_id,
                position: None,
                exhausted: false,
            });
            Ok(Some(reader))
        })
    }

    fn remove_peer(&self, peer_id: &PeerId) -> StorageFuture<'_, ()> {
        let peer_id = peer_id.clone();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let prefix = peer_id.as_bytes();
            let keys: Vec<Vec<u8>> = state
                .messages
                .range(StorageKey::zero(&peer_id).into_bytes()..)
                .map(|(key, _)| key)
                .take_while(|key| key.starts_with(prefix))
                .filter(|key| belongs_to(key, &peer_id))
                .cloned()
                .collect();
            for key in &keys {
                state.messages.remove(key);
            }
            state.counts.remove(&peer_id);
            info!(peer_id = %peer_id, removed = keys.len(), "Removed peer");
            Ok(())
        })
    }

    fn get_non_acked_message_counts(&self) -> StorageFuture<'_, HashMap<PeerId, i64>> {
        Box::pin(async move { Ok(self.state.lock().await.counts.clone()) })
    }
}

/// Keyset cursor over the shared map.
struct InMemoryMessageReader {
    state: Arc<Mutex<MemoryState>>,
    peer_id: PeerId,
    /// Last key handed out (or skipped).
    position: Option<Vec<u8>>,
    exhausted: bool,
}

impl MessageReader for InMemoryMessageReader {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn next_batch(&mut self, max: usize) -> StorageFuture<'_, Vec<TransportMessage>> {
        Box::pin(async move {
            let mut batch = Vec::new();
            if self.exhausted {
                return Ok(batch);
            }
            let max = max.max(1);
            let shared = Arc::clone(&self.state);
            let state = shared.lock().await;

            let lower = match self.position.take() {
                Some(last) => Bound::Excluded(last),
                None => Bound::Included(StorageKey::zero(&self.peer_id).into_bytes()),
            };
            let prefix = self.peer_id.as_bytes();

            for (key, bytes) in state.messages.range((lower, Bound::Unbounded)) {
                if !key.starts_with(prefix) {
                    break;
                }
                self.position = Some(key.clone());
                if !belongs_to(key, &self.peer_id) {
                    continue;
                }
                if let Some(message) = decode_stored(&self.peer_id, bytes) {
                    batch.push(message);
                    if batch.len() >= max {
                        return Ok(batch);
                    }
                }
            }

            self.exhausted = true;
            Ok(batch)
        })
    }
}

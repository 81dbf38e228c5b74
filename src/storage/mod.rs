// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable per-peer message log.
//!
//! Every engine implements [`Storage`]: batch writes that commit messages,
//! acks and per-peer counters atomically, forward readers over a peer's
//! unacked messages, peer removal, and counter lookup.
//!
//! # Write semantics
//!
//! For each entry of a batch, in order:
//!
//! | Entry | Key stored | Key tombstoned | Otherwise |
//! |-------|------------|----------------|-----------|
//! | Message | overwrite bytes | drop message, consume tombstone | insert, count +1 |
//! | Ack | delete, count -1 | no-op | record tombstone |
//!
//! Tombstones are mirrored in an in-memory set so the message path can
//! check them without a read; engines rehydrate the set when they start.
//!
//! # Engines
//!
//! - [`InMemoryStorage`]: `BTreeMap`-ordered, process lifetime only
//! - [`SqliteStorage`]: SQLite in WAL mode, one transaction per batch

mod key;
mod memory;
mod sqlite;

pub use key::{belongs_to, StorageKey, KEY_SUFFIX_LEN};
pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::matcher::MatcherEntry;
use crate::model::{PeerId, TransportMessage, TICKS_PER_MILLISECOND};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

/// Type alias for boxed storage futures (reduces trait signature complexity).
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Contract every storage engine satisfies.
pub trait Storage: Send + Sync + 'static {
    /// Prepare the engine (rehydrate the out-of-order ack set).
    fn start(&self) -> StorageFuture<'_, ()>;

    /// Flush and release resources.
    fn stop(&self) -> StorageFuture<'_, ()>;

    /// Commit a batch of message and ack entries atomically.
    ///
    /// Signal entries are ignored. Counters move by the net delta of the
    /// batch inside the same commit.
    fn write<'a>(&'a self, entries: &'a [MatcherEntry]) -> StorageFuture<'a, ()>;

    /// Reader over the peer's unacked messages, or `None` for a peer with
    /// no record (never written, or removed).
    fn create_message_reader(&self, peer_id: &PeerId)
        -> StorageFuture<'_, Option<Box<dyn MessageReader>>>;

    /// Delete every message and the counter of a peer.
    fn remove_peer(&self, peer_id: &PeerId) -> StorageFuture<'_, ()>;

    /// Current non-acked count of every known peer, from the counters.
    fn get_non_acked_message_counts(&self) -> StorageFuture<'_, HashMap<PeerId, i64>>;
}

/// Forward-only cursor over one peer's unacked messages.
///
/// Messages come back in ascending key order, which is chronological order.
/// A reader never restarts: once `next_batch` returns an empty vector it
/// stays exhausted. Dropping the reader releases whatever it holds.
pub trait MessageReader: Send {
    fn peer_id(&self) -> &PeerId;

    /// Up to `max` next messages; empty once the backlog is exhausted.
    fn next_batch(&mut self, max: usize) -> StorageFuture<'_, Vec<TransportMessage>>;
}

/// Drain a reader for `peer_id` into a vector.
///
/// Returns an empty vector for unknown peers.
pub async fn read_unacked_messages<S: Storage + ?Sized>(
    storage: &S,
    peer_id: &PeerId,
) -> Result<Vec<TransportMessage>> {
    let mut messages = Vec::new();
    let Some(mut reader) = storage.create_message_reader(peer_id).await? else {
        return Ok(messages);
    };
    loop {
        let batch = reader.next_batch(256).await?;
        if batch.is_empty() {
            return Ok(messages);
        }
        messages.extend(batch);
    }
}

/// Decode a stored payload, dropping (and reporting) unreadable ones.
pub(crate) fn decode_stored(peer_id: &PeerId, bytes: &[u8]) -> Option<TransportMessage> {
    match TransportMessage::decode(bytes) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "Dropping unreadable stored message");
            crate::metrics::record_unreadable_message(peer_id.as_str());
            None
        }
    }
}

/// Tombstones for messages stamped before this tick count have expired.
pub(crate) fn retention_cutoff_ticks(retention: Duration) -> u64 {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
    now_ms
        .saturating_sub(retention_ms)
        .saturating_mul(TICKS_PER_MILLISECOND)
}

/// Whether a tombstone key is older than the cutoff.
///
/// Undecodable keys count as expired.
pub(crate) fn tombstone_expired(key: &[u8], cutoff_ticks: u64) -> bool {
    match StorageKey::from_bytes(key.to_vec()).decode() {
        Ok((_, ticks, _)) => ticks < cutoff_ticks,
        Err(_) => true,
    }
}

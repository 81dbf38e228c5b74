// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage key layout.
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┬──────────────────────┐
//! │ peer id (UTF-8)      │ timestamp ticks (BE u64) │ message guid (16 B)  │
//! └──────────────────────┴──────────────────────────┴──────────────────────┘
//! ```
//!
//! Big-endian ticks make byte-wise ordering equal chronological ordering
//! within a peer. The peer's zero key (all-zero ticks and guid) is the lower
//! bound of its range scan; every key of a peer shares its id as a prefix.
//!
//! Peer ids are variable length, so a key with prefix `"a"` may belong to
//! peer `"ab"`. Keys are attributed to a peer only when the prefix matches
//! *and* the total length is `peer.len() + 24`.

use crate::error::{PersistenceError, Result};
use crate::model::{MessageId, PeerId};

/// Length of the ticks + guid suffix.
pub const KEY_SUFFIX_LEN: usize = 8 + 16;

/// Encoded storage key of one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(Vec<u8>);

impl StorageKey {
    pub fn new(peer_id: &PeerId, message_id: &MessageId) -> Self {
        Self::from_parts(peer_id, message_id.timestamp_ticks(), message_id.as_bytes())
    }

    fn from_parts(peer_id: &PeerId, ticks: u64, guid: &[u8; 16]) -> Self {
        let peer = peer_id.as_bytes();
        let mut bytes = Vec::with_capacity(peer.len() + KEY_SUFFIX_LEN);
        bytes.extend_from_slice(peer);
        bytes.extend_from_slice(&ticks.to_be_bytes());
        bytes.extend_from_slice(guid);
        Self(bytes)
    }

    /// Lowest possible key for `peer_id`.
    pub fn zero(peer_id: &PeerId) -> Self {
        Self::from_parts(peer_id, 0, &[0u8; 16])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Whether this key belongs to `peer_id`.
    pub fn belongs_to(&self, peer_id: &PeerId) -> bool {
        belongs_to(&self.0, peer_id)
    }

    /// Split into `(peer id, ticks, message id)`.
    pub fn decode(&self) -> Result<(PeerId, u64, MessageId)> {
        if self.0.len() < KEY_SUFFIX_LEN {
            return Err(PersistenceError::Serialization(format!(
                "storage key too short: {} bytes",
                self.0.len()
            )));
        }
        let split = self.0.len() - KEY_SUFFIX_LEN;
        let peer = std::str::from_utf8(&self.0[..split])
            .map_err(|e| PersistenceError::Serialization(format!("peer id is not UTF-8: {}", e)))?;

        let mut ticks = [0u8; 8];
        ticks.copy_from_slice(&self.0[split..split + 8]);
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&self.0[split + 8..]);

        Ok((
            PeerId::new(peer),
            u64::from_be_bytes(ticks),
            MessageId::from_bytes(guid),
        ))
    }
}

/// Whether raw key bytes belong to `peer_id`.
pub fn belongs_to(key: &[u8], peer_id: &PeerId) -> bool {
    let peer = peer_id.as_bytes();
    key.len() == peer.len() + KEY_SUFFIX_LEN && key.starts_with(peer)
}

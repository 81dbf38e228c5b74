// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identifiers and the transport message envelope.
//!
//! [`MessageId`] is a UUIDv7: its leading 48 bits are a Unix millisecond
//! timestamp, which gives every id a chronological sort component. Storage
//! keys use that component expressed in 100ns ticks.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::{Builder, Uuid};

/// Number of 100ns ticks in one millisecond.
pub const TICKS_PER_MILLISECOND: u64 = 10_000;

/// Opaque identifier of a bus participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Globally unique, time-ordered message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// A fresh id stamped with the current time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// An id stamped with an explicit Unix millisecond timestamp.
    ///
    /// The remaining bits are random, so two ids built from the same
    /// timestamp are distinct but unordered relative to each other.
    pub fn from_unix_millis(millis: u64) -> Self {
        let random = Uuid::new_v4();
        let mut tail = [0u8; 10];
        tail.copy_from_slice(&random.as_bytes()[6..16]);
        Self(Builder::from_unix_timestamp_millis(millis, &tail).into_uuid())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Unix milliseconds carried in the leading 48 bits.
    pub fn unix_millis(&self) -> u64 {
        let b = self.0.as_bytes();
        u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]])
    }

    /// Timestamp component in 100ns ticks since the Unix epoch.
    pub fn timestamp_ticks(&self) -> u64 {
        self.unix_millis().saturating_mul(TICKS_PER_MILLISECOND)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Full name of a message type, e.g. `Orders.OrderPlaced`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageTypeId(String);

impl MessageTypeId {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self(full_name.into())
    }

    pub fn full_name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one replay session, chosen by the reconnecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayId(Uuid);

impl ReplayId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ReplayId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message as it travels on the bus.
///
/// Storage keeps the bincode encoding of this struct as the value of each
/// message key and hands it back untouched during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: MessageId,
    pub message_type_id: MessageTypeId,
    pub originator: PeerId,
    pub content: Vec<u8>,
}

impl TransportMessage {
    pub fn new(
        message_type_id: MessageTypeId,
        originator: PeerId,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type_id,
            originator,
            content: content.into(),
        }
    }

    /// Encode to the stored/wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the stored/wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

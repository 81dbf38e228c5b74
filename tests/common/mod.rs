//! Shared test utilities for the integration suites.
//!
//! This module provides:
//! - Recording transport and publisher doubles
//! - A storage wrapper that can block, fail and count writes
//! - Message helpers with controlled timestamps

#![allow(dead_code)]

pub mod mock_bus;
pub mod mock_storage;

pub use mock_bus::*;
pub use mock_storage::*;

use bus_persistence::matcher::MatcherEntry;
use bus_persistence::model::{MessageId, MessageTypeId, PeerId, TransportMessage};

/// Message whose id carries the given Unix timestamp.
pub fn message_at(millis: u64) -> TransportMessage {
    let mut message = TransportMessage::new(
        MessageTypeId::new("Test.OrderPlaced"),
        PeerId::new("Test.Sender.0"),
        millis.to_be_bytes().to_vec(),
    );
    message.id = MessageId::from_unix_millis(millis);
    message
}

/// `count` messages with strictly increasing timestamps.
pub fn messages(count: usize) -> Vec<TransportMessage> {
    (0..count)
        .map(|i| message_at(1_700_000_000_000 + i as u64))
        .collect()
}

/// Storage entry persisting `message` for `peer`.
pub fn message_entry(peer: &PeerId, message: &TransportMessage) -> MatcherEntry {
    MatcherEntry::message(
        peer.clone(),
        message.id,
        message.message_type_id.full_name(),
        message.encode().expect("encode"),
    )
}

/// Storage entry acking `message` for `peer`.
pub fn ack_entry(peer: &PeerId, message: &TransportMessage) -> MatcherEntry {
    MatcherEntry::ack(peer.clone(), message.id)
}

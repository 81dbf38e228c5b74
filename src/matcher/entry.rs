// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Units of work flowing through the matcher.

use crate::error::{PersistenceError, Result};
use crate::model::{MessageId, PeerId};
use crate::storage::StorageKey;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// What an entry asks storage to do.
///
/// The payload lives inside the variant, so bytes exist only for messages
/// and a signal handle only for barriers.
#[derive(Debug)]
pub enum EntryKind {
    /// Store these bytes under the entry's key.
    Message(Vec<u8>),
    /// Remove the entry's key, or tombstone it if not yet stored.
    Ack,
    /// FIFO barrier: released once everything before it has committed.
    Signal(SignalHandle),
}

/// One queued message, ack or barrier.
#[derive(Debug)]
pub struct MatcherEntry {
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub message_type_name: String,
    pub kind: EntryKind,
    pub enqueued_at: Instant,
}

impl MatcherEntry {
    pub fn message(
        peer_id: PeerId,
        message_id: MessageId,
        message_type_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            peer_id,
            message_id,
            message_type_name: message_type_name.into(),
            kind: EntryKind::Message(bytes),
            enqueued_at: Instant::now(),
        }
    }

    pub fn ack(peer_id: PeerId, message_id: MessageId) -> Self {
        Self {
            peer_id,
            message_id,
            message_type_name: String::new(),
            kind: EntryKind::Ack,
            enqueued_at: Instant::now(),
        }
    }

    pub fn signal(handle: SignalHandle) -> Self {
        Self {
            peer_id: PeerId::default(),
            message_id: MessageId::from_uuid(Uuid::nil()),
            message_type_name: String::new(),
            kind: EntryKind::Signal(handle),
            enqueued_at: Instant::now(),
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.kind, EntryKind::Message(_))
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.kind, EntryKind::Ack)
    }

    pub fn is_signal(&self) -> bool {
        matches!(self.kind, EntryKind::Signal(_))
    }

    pub fn message_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            EntryKind::Message(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn key(&self) -> StorageKey {
        StorageKey::new(&self.peer_id, &self.message_id)
    }
}

/// Sending half of a barrier.
#[derive(Debug)]
pub struct SignalHandle(oneshot::Sender<()>);

impl SignalHandle {
    pub fn new() -> (Self, WaitHandle) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), WaitHandle(rx))
    }

    pub fn release(self) {
        // The waiter may have given up; nothing to do then.
        let _ = self.0.send(());
    }
}

/// Waiting half of a barrier, returned by
/// [`InMemoryMessageMatcher::enqueue_wait_handle`](super::InMemoryMessageMatcher::enqueue_wait_handle).
#[derive(Debug)]
pub struct WaitHandle(oneshot::Receiver<()>);

impl WaitHandle {
    /// Resolves once every entry enqueued before the barrier has committed.
    ///
    /// Fails with [`PersistenceError::Shutdown`] if the matcher was dropped
    /// before reaching the barrier.
    pub async fn wait(self) -> Result<()> {
        self.0.await.map_err(|_| PersistenceError::Shutdown)
    }
}

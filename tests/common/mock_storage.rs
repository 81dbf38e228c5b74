//! Controllable storage wrapper.
//!
//! Wraps [`InMemoryStorage`] and lets a test:
//! - hold writes at a gate and observe that a write has started
//! - script timeout / unknown failures for upcoming writes
//! - poison individual message ids so any batch containing them fails
//! - inspect the size of every committed batch

use bus_persistence::matcher::MatcherEntry;
use bus_persistence::model::{MessageId, PeerId};
use bus_persistence::storage::{InMemoryStorage, MessageReader, Storage, StorageFuture};
use bus_persistence::PersistenceError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Failure returned by the next write attempt.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedFailure {
    Timeout,
    Unknown,
}

pub struct ControlledStorage {
    inner: InMemoryStorage,
    gate_open: watch::Sender<bool>,
    attempts: watch::Sender<usize>,
    failures: Mutex<VecDeque<ScriptedFailure>>,
    poisoned: Mutex<HashSet<MessageId>>,
    committed: Mutex<Vec<usize>>,
}

impl ControlledStorage {
    pub fn new() -> Self {
        let (gate_open, _) = watch::channel(true);
        let (attempts, _) = watch::channel(0);
        Self {
            inner: InMemoryStorage::new(),
            gate_open,
            attempts,
            failures: Mutex::new(VecDeque::new()),
            poisoned: Mutex::new(HashSet::new()),
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &InMemoryStorage {
        &self.inner
    }

    /// Hold every write until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gate_open.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate_open.send_replace(true);
    }

    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn poison(&self, message_id: MessageId) {
        self.poisoned.lock().unwrap().insert(message_id);
    }

    /// Entry counts of committed writes, in commit order.
    pub fn committed_batches(&self) -> Vec<usize> {
        self.committed.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> usize {
        *self.attempts.borrow()
    }

    /// Wait until at least `count` writes have been attempted, or panic after 5s.
    pub async fn wait_for_attempts(&self, count: usize) {
        let mut rx = self.attempts.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n >= count))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} write attempts", count))
            .expect("storage dropped");
    }

    async fn controlled_write(&self, entries: &[MatcherEntry]) -> bus_persistence::Result<()> {
        self.attempts.send_modify(|n| *n += 1);

        let mut gate = self.gate_open.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let scripted = self.failures.lock().unwrap().pop_front();
        match scripted {
            Some(ScriptedFailure::Timeout) => {
                return Err(PersistenceError::timeout("write", "database is locked"))
            }
            Some(ScriptedFailure::Unknown) => {
                return Err(PersistenceError::storage("write", "disk I/O error"))
            }
            None => {}
        }

        let poisoned = {
            let poisoned = self.poisoned.lock().unwrap();
            entries.iter().any(|entry| poisoned.contains(&entry.message_id))
        };
        if poisoned {
            return Err(PersistenceError::storage("write", "constraint failed"));
        }

        self.inner.write(entries).await?;
        self.committed.lock().unwrap().push(entries.len());
        Ok(())
    }
}

impl Storage for ControlledStorage {
    fn start(&self) -> StorageFuture<'_, ()> {
        self.inner.start()
    }

    fn stop(&self) -> StorageFuture<'_, ()> {
        self.inner.stop()
    }

    fn write<'a>(&'a self, entries: &'a [MatcherEntry]) -> StorageFuture<'a, ()> {
        Box::pin(self.controlled_write(entries))
    }

    fn create_message_reader(
        &self,
        peer_id: &PeerId,
    ) -> StorageFuture<'_, Option<Box<dyn MessageReader>>> {
        self.inner.create_message_reader(peer_id)
    }

    fn remove_peer(&self, peer_id: &PeerId) -> StorageFuture<'_, ()> {
        self.inner.remove_peer(peer_id)
    }

    fn get_non_acked_message_counts(&self) -> StorageFuture<'_, HashMap<PeerId, i64>> {
        self.inner.get_non_acked_message_counts()
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingestion front door: pairs messages with acks, batches the rest.
//!
//! Producers enqueue from any task; a single consumer task drains the queue
//! into storage. Most messages are acknowledged within moments of being
//! sent, so holding each entry for `delay` before writing lets the ack catch
//! up and cancel it without touching storage.
//!
//! # Flush Triggers
//!
//! The consumer writes a batch when either:
//! - the oldest queued entry is at least `delay` old
//! - enough entries are queued to fill `batch_size` (early flush)
//!
//! A stopping matcher ignores the delay and drains everything.
//!
//! # Pairing
//!
//! ```text
//! enqueue Message(p, m) ──┐                       ┌── neither reaches storage
//!                         ├── same key pending? ──┤
//! enqueue Ack(p, m) ──────┘                       └── otherwise queued as-is
//! ```
//!
//! Once an entry has been handed to storage it is no longer pending; a late
//! partner goes to storage and is resolved there.
//!
//! # Failure Policy
//!
//! | Storage error | Reaction |
//! |---------------|----------|
//! | `StorageTimeout` | report, back off, retry the same batch |
//! | anything else | report, write entries one at a time, drop the ones that still fail |

mod entry;

pub use entry::{EntryKind, MatcherEntry, SignalHandle, WaitHandle};

use crate::bus::{EventPublisher, PersistenceEvent};
use crate::error::{PersistenceError, Result};
use crate::metrics;
use crate::model::{MessageId, PeerId};
use crate::resilience::RetryConfig;
use crate::storage::{Storage, StorageKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const COMPONENT: &str = "InMemoryMessageMatcher";

/// Runtime settings of a matcher.
#[derive(Debug, Clone)]
pub struct MatcherSettings {
    pub batch_size: usize,
    pub delay: Duration,
    pub retry: RetryConfig,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay: Duration::from_secs(2),
            retry: RetryConfig::storage(),
        }
    }
}

impl MatcherSettings {
    /// No delay, fast retries.
    pub fn testing(batch_size: usize) -> Self {
        Self {
            batch_size,
            delay: Duration::ZERO,
            retry: RetryConfig::testing(),
        }
    }
}

/// Counters describing what the matcher has done so far.
#[derive(Debug, Default)]
pub struct MatcherStats {
    in_memory_matches: AtomicU64,
    persisted_entries: AtomicU64,
    batches_written: AtomicU64,
    failed_writes: AtomicU64,
    dropped_entries: AtomicU64,
}

impl MatcherStats {
    /// Message/ack pairs cancelled before reaching storage.
    pub fn in_memory_matches(&self) -> u64 {
        self.in_memory_matches.load(Ordering::Relaxed)
    }

    /// Entries committed to storage.
    pub fn persisted_entries(&self) -> u64 {
        self.persisted_entries.load(Ordering::Relaxed)
    }

    /// Successful storage writes.
    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    /// Storage writes that returned an error.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Entries given up on after isolation.
    pub fn dropped_entries(&self) -> u64 {
        self.dropped_entries.load(Ordering::Relaxed)
    }
}

struct QueuedEntry {
    seq: u64,
    entry: MatcherEntry,
}

#[derive(Default)]
struct MatcherQueue {
    entries: VecDeque<QueuedEntry>,
    /// Queued, unmatched messages by key.
    pending_messages: HashMap<StorageKey, u64>,
    /// Queued, unmatched acks by key.
    pending_acks: HashMap<StorageKey, u64>,
    /// Sequence numbers cancelled by pairing, still physically queued.
    matched: HashSet<u64>,
    /// Message and ack entries queued and not matched.
    live: usize,
    next_seq: u64,
    adding_completed: bool,
}

impl MatcherQueue {
    fn push(&mut self, entry: MatcherEntry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if !entry.is_signal() {
            self.live += 1;
        }
        self.entries.push_back(QueuedEntry { seq, entry });
        seq
    }

    fn cancel(&mut self, seq: u64) {
        self.matched.insert(seq);
        self.live -= 1;
    }

    fn skip_matched(&mut self) {
        while let Some(front) = self.entries.front() {
            if !self.matched.remove(&front.seq) {
                return;
            }
            self.entries.pop_front();
        }
    }

    /// Pop the front entry (already known not to be matched).
    fn take_front(&mut self) -> Option<MatcherEntry> {
        let queued = self.entries.pop_front()?;
        if queued.entry.is_signal() {
            return Some(queued.entry);
        }
        self.live -= 1;
        let key = queued.entry.key();
        let pending = if queued.entry.is_message() {
            &mut self.pending_messages
        } else {
            &mut self.pending_acks
        };
        if pending.get(&key) == Some(&queued.seq) {
            pending.remove(&key);
        }
        Some(queued.entry)
    }
}

enum Work {
    Batch(Vec<MatcherEntry>),
    Signal(SignalHandle),
    Completed,
}

struct MatcherInner<S: Storage> {
    storage: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
    settings: MatcherSettings,
    queue: Mutex<MatcherQueue>,
    notify: Notify,
    stats: Arc<MatcherStats>,
}

impl<S: Storage> MatcherInner<S> {
    fn lock_queue(&self) -> MutexGuard<'_, MatcherQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>) {
        info!(
            batch_size = self.settings.batch_size,
            delay_ms = self.settings.delay.as_millis() as u64,
            "Matcher consumer started"
        );
        loop {
            match self.next_work().await {
                Work::Batch(batch) => self.write_batch(batch).await,
                Work::Signal(handle) => handle.release(),
                Work::Completed => break,
            }
        }
        info!(
            persisted = self.stats.persisted_entries(),
            in_memory_matches = self.stats.in_memory_matches(),
            dropped = self.stats.dropped_entries(),
            "Matcher consumer stopped"
        );
    }

    /// Wait until a batch or a barrier is ready.
    async fn next_work(&self) -> Work {
        let mut batch = Vec::new();
        loop {
            let wake_at = {
                let mut queue = self.lock_queue();
                let wake_at = loop {
                    queue.skip_matched();
                    let Some(front) = queue.entries.front() else {
                        break None;
                    };

                    if front.entry.is_signal() {
                        if !batch.is_empty() {
                            return Work::Batch(batch);
                        }
                        if let Some(MatcherEntry {
                            kind: EntryKind::Signal(handle),
                            ..
                        }) = queue.take_front()
                        {
                            return Work::Signal(handle);
                        }
                        continue;
                    }

                    let ready_at = front.entry.enqueued_at + self.settings.delay;
                    let size_pressure = batch.len() + queue.live >= self.settings.batch_size;
                    if !queue.adding_completed && !size_pressure && ready_at > Instant::now() {
                        break Some(ready_at);
                    }

                    if let Some(entry) = queue.take_front() {
                        batch.push(entry);
                    }
                    if batch.len() >= self.settings.batch_size {
                        metrics::set_matcher_queue_depth(queue.live);
                        return Work::Batch(batch);
                    }
                };

                if !batch.is_empty() {
                    metrics::set_matcher_queue_depth(queue.live);
                    return Work::Batch(batch);
                }
                if wake_at.is_none() && queue.adding_completed {
                    return Work::Completed;
                }
                wake_at
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    async fn write_batch(&self, batch: Vec<MatcherEntry>) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = std::time::Instant::now();
            match self.storage.write(&batch).await {
                Ok(()) => {
                    self.record_success(batch.len(), started.elapsed());
                    debug!(attempt, "Batch committed");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.settings.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Storage timeout, batch will be retried"
                    );
                    self.report_failure("write_batch", &e, batch.len(), "timeout");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(error = %e, "Batch write failed, writing entries one by one");
                    self.report_failure("write_batch", &e, batch.len(), "unknown");
                    self.write_one_by_one(batch).await;
                    return;
                }
            }
        }
    }

    async fn write_one_by_one(&self, batch: Vec<MatcherEntry>) {
        for entry in batch {
            let single = std::slice::from_ref(&entry);
            let mut attempt = 0;
            loop {
                attempt += 1;
                let started = std::time::Instant::now();
                match self.storage.write(single).await {
                    Ok(()) => {
                        self.record_success(1, started.elapsed());
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        self.report_failure("write_entry", &e, 1, "timeout");
                        tokio::time::sleep(self.settings.retry.delay_for_attempt(attempt)).await;
                    }
                    Err(e) => {
                        error!(
                            peer_id = %entry.peer_id,
                            message_id = %entry.message_id,
                            message_type = %entry.message_type_name,
                            error = %e,
                            "Dropping entry that cannot be stored"
                        );
                        self.report_failure("write_entry", &e, 1, "unknown");
                        self.stats.dropped_entries.fetch_add(1, Ordering::Relaxed);
                        metrics::record_dropped_entry();
                        break;
                    }
                }
            }
        }
    }

    fn record_success(&self, entries: usize, elapsed: Duration) {
        self.stats
            .persisted_entries
            .fetch_add(entries as u64, Ordering::Relaxed);
        self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
        metrics::record_batch_write(entries, elapsed);
    }

    fn report_failure(&self, operation: &str, e: &PersistenceError, entry_count: usize, kind: &str) {
        self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
        metrics::record_storage_failure(kind);
        self.publisher.publish(PersistenceEvent::ProcessingFailed {
            component: COMPONENT.to_string(),
            operation: operation.to_string(),
            error: e.to_string(),
            entry_count,
        });
    }
}

/// Pairs messages with acks in memory and writes the rest in batches.
pub struct InMemoryMessageMatcher<S: Storage> {
    inner: Arc<MatcherInner<S>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Storage> InMemoryMessageMatcher<S> {
    pub fn new(storage: Arc<S>, publisher: Arc<dyn EventPublisher>, settings: MatcherSettings) -> Self {
        Self {
            inner: Arc::new(MatcherInner {
                storage,
                publisher,
                settings,
                queue: Mutex::new(MatcherQueue::default()),
                notify: Notify::new(),
                stats: Arc::new(MatcherStats::default()),
            }),
            consumer: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<MatcherStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Message and ack entries currently queued (not yet handed to storage).
    pub fn queue_len(&self) -> usize {
        self.inner.lock_queue().live
    }

    /// Spawn the consumer task.
    pub fn start(&self) -> Result<()> {
        if self.inner.lock_queue().adding_completed {
            return Err(PersistenceError::Shutdown);
        }
        let mut consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        if consumer.is_some() {
            return Err(PersistenceError::InvalidState {
                expected: "not started".to_string(),
                actual: "started".to_string(),
            });
        }
        *consumer = Some(tokio::spawn(Arc::clone(&self.inner).run()));
        Ok(())
    }

    /// Stop accepting entries, drain the queue and wait for the consumer.
    ///
    /// No internal timeout: a store that keeps timing out keeps this
    /// pending. Callers wanting a bound wrap it in `tokio::time::timeout`.
    pub async fn stop(&self) {
        self.inner.lock_queue().adding_completed = true;
        self.inner.notify.notify_one();

        let handle = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "Matcher consumer panicked");
                }
            }
            None => {
                let pending = self.queue_len();
                if pending > 0 {
                    warn!(pending, "Matcher stopped before start, entries not written");
                }
            }
        }
    }

    /// Queue a message for `peer_id`.
    ///
    /// Cancelled in memory if its ack is already queued; ignored if the same
    /// message is already queued.
    pub fn enqueue_message(
        &self,
        peer_id: PeerId,
        message_id: MessageId,
        message_type_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let entry = MatcherEntry::message(peer_id, message_id, message_type_name, bytes);
        let key = entry.key();
        {
            let mut queue = self.inner.lock_queue();
            if queue.adding_completed {
                return Err(PersistenceError::Shutdown);
            }
            if let Some(seq) = queue.pending_acks.remove(&key) {
                queue.cancel(seq);
                drop(queue);
                self.record_match(&entry);
                return Ok(());
            }
            if queue.pending_messages.contains_key(&key) {
                debug!(
                    peer_id = %entry.peer_id,
                    message_id = %entry.message_id,
                    "Message already queued, ignoring duplicate"
                );
                return Ok(());
            }
            let seq = queue.push(entry);
            queue.pending_messages.insert(key, seq);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Queue an ack of `message_id` by `peer_id`.
    ///
    /// Cancels the queued message if there is one.
    pub fn enqueue_ack(&self, peer_id: PeerId, message_id: MessageId) -> Result<()> {
        let entry = MatcherEntry::ack(peer_id, message_id);
        let key = entry.key();
        {
            let mut queue = self.inner.lock_queue();
            if queue.adding_completed {
                return Err(PersistenceError::Shutdown);
            }
            if let Some(seq) = queue.pending_messages.remove(&key) {
                queue.cancel(seq);
                drop(queue);
                self.record_match(&entry);
                return Ok(());
            }
            if queue.pending_acks.contains_key(&key) {
                return Ok(());
            }
            let seq = queue.push(entry);
            queue.pending_acks.insert(key, seq);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Queue a barrier released once every earlier entry has committed.
    pub fn enqueue_wait_handle(&self) -> Result<WaitHandle> {
        let (signal, wait) = SignalHandle::new();
        {
            let mut queue = self.inner.lock_queue();
            if queue.adding_completed {
                return Err(PersistenceError::Shutdown);
            }
            queue.push(MatcherEntry::signal(signal));
        }
        self.inner.notify.notify_one();
        Ok(wait)
    }

    /// Wait until everything enqueued so far has committed.
    pub async fn wait_for_pending_writes(&self) -> Result<()> {
        self.enqueue_wait_handle()?.wait().await
    }

    /// Drop every queued entry and return how many messages/acks were dropped.
    ///
    /// Entries already handed to storage are not affected. Queued barriers
    /// are released.
    pub fn purge(&self) -> usize {
        let drained: Vec<QueuedEntry> = {
            let mut queue = self.inner.lock_queue();
            let matched = std::mem::take(&mut queue.matched);
            queue.pending_messages.clear();
            queue.pending_acks.clear();
            queue.live = 0;
            queue
                .entries
                .drain(..)
                .filter(|queued| !matched.contains(&queued.seq))
                .collect()
        };

        let mut dropped = 0;
        for queued in drained {
            match queued.entry.kind {
                EntryKind::Signal(handle) => handle.release(),
                _ => dropped += 1,
            }
        }
        metrics::set_matcher_queue_depth(0);
        info!(dropped, "Matcher queue purged");
        dropped
    }

    fn record_match(&self, entry: &MatcherEntry) {
        self.inner
            .stats
            .in_memory_matches
            .fetch_add(1, Ordering::Relaxed);
        metrics::record_in_memory_match();
        debug!(
            peer_id = %entry.peer_id,
            message_id = %entry.message_id,
            "Message and ack matched in memory"
        );
    }
}

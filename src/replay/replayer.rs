// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! A single replay session.
//!
//! The session runs on its own task. Everything it waits on (acks, live
//! messages, the safety deadline, cancellation) is local to the session, so
//! a slow peer never holds up the matcher or another peer's replay.

use super::{ReplaySettings, ReplayState};
use crate::bus::{EventPublisher, PersistenceEvent, ReplayMessage, ReplayTransport};
use crate::error::{PersistenceError, Result};
use crate::matcher::WaitHandle;
use crate::metrics;
use crate::model::{MessageId, PeerId, ReplayId, TransportMessage};
use crate::storage::{MessageReader, Storage};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const COMPONENT: &str = "MessageReplayer";

/// Returned by session steps once the session has been cancelled.
struct Cancelled;

type Step = std::result::Result<(), Cancelled>;

struct LiveBuffer {
    queue: VecDeque<TransportMessage>,
    accepting: bool,
}

struct ReplayerInner<S: Storage> {
    peer_id: PeerId,
    replay_id: ReplayId,
    storage: Arc<S>,
    transport: Arc<dyn ReplayTransport>,
    publisher: Arc<dyn EventPublisher>,
    settings: ReplaySettings,
    state: watch::Sender<ReplayState>,
    live: Mutex<LiveBuffer>,
    live_notify: Notify,
    unacked: Mutex<HashSet<MessageId>>,
    ack_notify: Notify,
    replayed: AtomicUsize,
}

/// Replays one peer's backlog, then its live traffic, then closes the session.
pub struct MessageReplayer<S: Storage> {
    inner: Arc<ReplayerInner<S>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Storage> MessageReplayer<S> {
    pub fn new(
        peer_id: PeerId,
        replay_id: ReplayId,
        storage: Arc<S>,
        transport: Arc<dyn ReplayTransport>,
        publisher: Arc<dyn EventPublisher>,
        settings: ReplaySettings,
    ) -> Self {
        let (state, _) = watch::channel(ReplayState::Created);
        Self {
            inner: Arc::new(ReplayerInner {
                peer_id,
                replay_id,
                storage,
                transport,
                publisher,
                settings,
                state,
                live: Mutex::new(LiveBuffer {
                    queue: VecDeque::new(),
                    accepting: true,
                }),
                live_notify: Notify::new(),
                unacked: Mutex::new(HashSet::new()),
                ack_notify: Notify::new(),
                replayed: AtomicUsize::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn replay_id(&self) -> ReplayId {
        self.inner.replay_id
    }

    pub fn state(&self) -> ReplayState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change of this session.
    pub fn state_receiver(&self) -> watch::Receiver<ReplayState> {
        self.inner.state.subscribe()
    }

    /// Replayed messages sent and not yet acknowledged.
    pub fn outstanding_count(&self) -> usize {
        self.inner.lock_unacked().len()
    }

    /// Messages sent as `MessageReplayed` so far, backlog and live.
    pub fn replayed_count(&self) -> usize {
        self.inner.replayed.load(Ordering::Relaxed)
    }

    /// Start the session task.
    pub fn start(&self) -> Result<()> {
        self.launch(None)
    }

    /// Start the session task once `barrier` is released.
    ///
    /// The barrier comes from the matcher, so messages persisted before the
    /// session began are committed before the backlog is read.
    pub fn start_after(&self, barrier: WaitHandle) -> Result<()> {
        self.launch(Some(barrier))
    }

    fn launch(&self, barrier: Option<WaitHandle>) -> Result<()> {
        let mut actual = ReplayState::Created;
        let started = self.inner.state.send_if_modified(|state| {
            actual = *state;
            if *state == ReplayState::Created {
                *state = ReplayState::Replaying;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(PersistenceError::InvalidState {
                expected: ReplayState::Created.to_string(),
                actual: actual.to_string(),
            });
        }

        let handle = tokio::spawn(Arc::clone(&self.inner).run(barrier));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Cancel the session. Returns `true` if it was still active.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.state.send_if_modified(|state| {
            if state.is_active() {
                *state = ReplayState::Cancelled;
                true
            } else {
                false
            }
        });
        if cancelled {
            info!(
                peer_id = %self.inner.peer_id,
                replay_id = %self.inner.replay_id,
                "Replay session cancelled"
            );
        }
        cancelled
    }

    /// Forward a live message addressed to the replaying peer.
    ///
    /// Returns `false` once the session no longer takes live traffic; the
    /// caller then delivers the message normally.
    pub fn add_live_message(&self, message: TransportMessage) -> bool {
        {
            let mut live = self.inner.lock_live();
            if !live.accepting || !self.state().is_active() {
                return false;
            }
            live.queue.push_back(message);
        }
        self.inner.live_notify.notify_one();
        true
    }

    /// Record the peer's ack of a replayed message.
    pub fn on_message_acked(&self, message_id: &MessageId) {
        if self.inner.lock_unacked().remove(message_id) {
            self.inner.ack_notify.notify_one();
        }
    }

    /// Wait until the session reaches a terminal state and return it.
    pub async fn wait_until_finished(&self) -> ReplayState {
        let mut rx = self.state_receiver();
        let finished = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        finished.unwrap_or_else(|_| self.state())
    }

    /// Wait for the session task itself to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(
                    peer_id = %self.inner.peer_id,
                    error = %e,
                    "Replay task panicked"
                );
            }
        }
    }
}

impl<S: Storage> ReplayerInner<S> {
    fn lock_live(&self) -> MutexGuard<'_, LiveBuffer> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_unacked(&self) -> MutexGuard<'_, HashSet<MessageId>> {
        self.unacked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        *self.state.borrow() == ReplayState::Cancelled
    }

    async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ReplayState::Cancelled).await;
    }

    fn transition(&self, from: ReplayState, to: ReplayState) -> Step {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(peer_id = %self.peer_id, state = %to, "Replay state changed");
            Ok(())
        } else {
            Err(Cancelled)
        }
    }

    #[instrument(skip(self, barrier), fields(peer_id = %self.peer_id, replay_id = %self.replay_id))]
    async fn run(self: Arc<Self>, barrier: Option<WaitHandle>) {
        let started = Instant::now();
        info!("Replay session started");
        self.publisher.publish(PersistenceEvent::ReplaySessionStarted {
            peer_id: self.peer_id.clone(),
            replay_id: self.replay_id,
        });

        let outcome = self.run_session(barrier).await;
        self.lock_unacked().clear();
        self.lock_live().accepting = false;

        match outcome {
            Ok(()) => {
                info!(
                    replayed = self.replayed.load(Ordering::Relaxed),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Replay session completed"
                );
                metrics::record_replay_session("completed", started.elapsed());
                self.publisher.publish(PersistenceEvent::ReplaySessionEnded {
                    peer_id: self.peer_id.clone(),
                    replay_id: self.replay_id,
                });
            }
            Err(Cancelled) => {
                info!(
                    replayed = self.replayed.load(Ordering::Relaxed),
                    "Replay session stopped before completion"
                );
                metrics::record_replay_session("cancelled", started.elapsed());
            }
        }
    }

    async fn run_session(&self, barrier: Option<WaitHandle>) -> Step {
        if let Some(barrier) = barrier {
            self.await_barrier(barrier).await?;
        }

        let reader = match self.storage.create_message_reader(&self.peer_id).await {
            Ok(reader) => reader,
            Err(e) => {
                self.abort("create_message_reader", &e);
                return Err(Cancelled);
            }
        };

        // Live messages may also have been committed and read back as backlog.
        let mut from_storage = HashSet::new();
        let has_backlog = reader.is_some();
        match reader {
            Some(reader) => self.replay_backlog(reader, &mut from_storage).await?,
            None => debug!("No stored record for peer, nothing to replay"),
        }

        self.forward_live(&from_storage).await?;
        self.send(ReplayMessage::ReplayPhaseEnded {
            replay_id: self.replay_id,
        })
        .await?;
        self.transition(ReplayState::Replaying, ReplayState::SafetyPhase)?;

        if has_backlog {
            self.safety_phase(&from_storage).await?;
        }

        // Close intake before the final drain so nothing slips in after it.
        let remaining: Vec<TransportMessage> = {
            let mut live = self.lock_live();
            live.accepting = false;
            live.queue.drain(..).collect()
        };
        for message in remaining {
            if !self.already_replayed(&from_storage, &message) {
                self.send_replayed(message).await?;
            }
        }

        self.send(ReplayMessage::SafetyPhaseEnded {
            replay_id: self.replay_id,
        })
        .await?;
        self.transition(ReplayState::SafetyPhase, ReplayState::Completed)
    }

    async fn await_barrier(&self, barrier: WaitHandle) -> Step {
        tokio::select! {
            released = barrier.wait() => match released {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.abort("await_pending_writes", &e);
                    Err(Cancelled)
                }
            },
            _ = self.cancelled() => Err(Cancelled),
        }
    }

    async fn replay_backlog(
        &self,
        mut reader: Box<dyn MessageReader>,
        from_storage: &mut HashSet<MessageId>,
    ) -> Step {
        let batch_size = self.settings.batch_size.max(1);
        let mut first = true;
        loop {
            if !first {
                self.wait_for_acks().await?;
            }
            if self.is_cancelled() {
                return Err(Cancelled);
            }

            let batch = match reader.next_batch(batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    self.abort("read_backlog", &e);
                    return Err(Cancelled);
                }
            };
            if batch.is_empty() {
                return Ok(());
            }

            let count = batch.len();
            for message in batch {
                self.lock_unacked().insert(message.id);
                from_storage.insert(message.id);
                self.send_replayed(message).await?;
            }
            metrics::record_replayed_messages(self.peer_id.as_str(), count);
            debug!(count, "Backlog batch sent");
            first = false;
        }
    }

    /// Block until enough replayed messages have been acked.
    async fn wait_for_acks(&self) -> Step {
        let threshold = self.settings.unacked_message_count_that_releases_next_batch;
        loop {
            let outstanding = self.lock_unacked().len();
            if outstanding <= threshold {
                return Ok(());
            }
            debug!(outstanding, threshold, "Waiting for acks before next batch");
            tokio::select! {
                _ = self.ack_notify.notified() => {}
                _ = self.cancelled() => return Err(Cancelled),
            }
        }
    }

    async fn safety_phase(&self, from_storage: &HashSet<MessageId>) -> Step {
        let deadline = tokio::time::Instant::now() + self.settings.safety_phase_duration;
        loop {
            self.forward_live(from_storage).await?;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = self.live_notify.notified() => {}
                _ = self.cancelled() => return Err(Cancelled),
            }
        }
    }

    async fn forward_live(&self, from_storage: &HashSet<MessageId>) -> Step {
        loop {
            let next = self.lock_live().queue.pop_front();
            match next {
                Some(message) if self.already_replayed(from_storage, &message) => {}
                Some(message) => self.send_replayed(message).await?,
                None => return Ok(()),
            }
        }
    }

    fn already_replayed(&self, from_storage: &HashSet<MessageId>, message: &TransportMessage) -> bool {
        let seen = from_storage.contains(&message.id);
        if seen {
            debug!(message_id = %message.id, "Live message already replayed from storage");
        }
        seen
    }

    async fn send_replayed(&self, message: TransportMessage) -> Step {
        self.send(ReplayMessage::MessageReplayed {
            replay_id: self.replay_id,
            message,
        })
        .await?;
        self.replayed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Hand one message to the transport.
    ///
    /// A send already in flight when the session is cancelled still reaches
    /// the peer; the session stops right after it.
    async fn send(&self, message: ReplayMessage) -> Step {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        let sent = self.transport.send(&self.peer_id, message).await;
        if let Err(e) = sent {
            warn!(error = %e, "Failed to send replay message");
            self.publisher.publish(PersistenceEvent::ProcessingFailed {
                component: COMPONENT.to_string(),
                operation: "send".to_string(),
                error: e.to_string(),
                entry_count: 1,
            });
        }
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Give up on the session after a storage failure.
    fn abort(&self, operation: &str, e: &PersistenceError) {
        error!(operation, error = %e, "Replay aborted");
        self.publisher.publish(PersistenceEvent::ProcessingFailed {
            component: COMPONENT.to_string(),
            operation: operation.to_string(),
            error: e.to_string(),
            entry_count: 0,
        });
        self.state.send_if_modified(|state| {
            if state.is_active() {
                *state = ReplayState::Cancelled;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{NoOpPublisher, NoOpTransport};
    use crate::model::MessageTypeId;
    use crate::storage::InMemoryStorage;
    use std::time::Duration;

    fn replayer() -> MessageReplayer<InMemoryStorage> {
        MessageReplayer::new(
            PeerId::new("p"),
            ReplayId::new(),
            Arc::new(InMemoryStorage::new()),
            Arc::new(NoOpTransport),
            Arc::new(NoOpPublisher),
            ReplaySettings {
                batch_size: 10,
                unacked_message_count_that_releases_next_batch: 10,
                safety_phase_duration: Duration::from_millis(10),
            },
        )
    }

    fn live_message() -> TransportMessage {
        TransportMessage::new(MessageTypeId::new("T"), PeerId::new("sender"), vec![1])
    }

    #[test]
    fn test_cancel_before_start() {
        let replayer = replayer();
        assert!(replayer.cancel());
        assert!(!replayer.cancel());
        assert_eq!(replayer.state(), ReplayState::Cancelled);
        assert!(matches!(
            replayer.start(),
            Err(PersistenceError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_live_messages_buffered_before_start() {
        let replayer = replayer();
        assert!(replayer.add_live_message(live_message()));
        replayer.cancel();
        assert!(!replayer.add_live_message(live_message()));
    }

    #[test]
    fn test_ack_of_unknown_message_is_ignored() {
        let replayer = replayer();
        replayer.on_message_acked(&MessageId::new());
        assert_eq!(replayer.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_peer_completes() {
        let replayer = replayer();
        replayer.start().unwrap();
        assert_eq!(replayer.wait_until_finished().await, ReplayState::Completed);
        replayer.join().await;
        assert!(!replayer.add_live_message(live_message()));
    }

    /// Cancels the session from inside its first send.
    #[derive(Default)]
    struct CancellingTransport {
        session: std::sync::OnceLock<Arc<ReplayerInner<InMemoryStorage>>>,
        sends: AtomicUsize,
    }

    impl ReplayTransport for CancellingTransport {
        fn send<'a>(&'a self, _target: &'a PeerId, _message: ReplayMessage) -> crate::bus::TransportFuture<'a> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if let Some(session) = self.session.get() {
                session.state.send_replace(ReplayState::Cancelled);
            }
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_cancel_during_send_ends_session_after_it() {
        use crate::matcher::MatcherEntry;

        let storage = Arc::new(InMemoryStorage::new());
        let peer = PeerId::new("p");
        let entries: Vec<_> = (0..3u64)
            .map(|i| {
                let mut message = live_message();
                message.id = MessageId::from_unix_millis(1_700_000_000_000 + i);
                MatcherEntry::message(peer.clone(), message.id, "T", message.encode().unwrap())
            })
            .collect();
        storage.write(&entries).await.unwrap();

        let transport = Arc::new(CancellingTransport::default());
        let replayer = MessageReplayer::new(
            peer,
            ReplayId::new(),
            storage,
            transport.clone(),
            Arc::new(NoOpPublisher),
            ReplaySettings {
                batch_size: 10,
                unacked_message_count_that_releases_next_batch: 10,
                safety_phase_duration: Duration::from_millis(10),
            },
        );
        let _ = transport.session.set(Arc::clone(&replayer.inner));

        replayer.start().unwrap();
        assert_eq!(replayer.wait_until_finished().await, ReplayState::Cancelled);
        replayer.join().await;

        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
        assert_eq!(replayer.replayed_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let replayer = replayer();
        replayer.start().unwrap();
        assert!(replayer.start().is_err());
        replayer.wait_until_finished().await;
    }
}

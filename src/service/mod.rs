// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence service.
//!
//! The facade the bus talks to. It ties together:
//! - The storage engine (any [`Storage`] implementation)
//! - Ingestion via [`InMemoryMessageMatcher`]
//! - Replay sessions via [`MessageReplayerRepository`]
//! - Periodic publication of non-acked counts
//!
//! # Architecture
//!
//! ```text
//!  persist / handled ──→ matcher ──(batches)──→ storage
//!          │                                       │
//!          │ live copy                             │ reader
//!          ↓                                       ↓
//!  active replayer ──(MessageReplayed …)──→ replaying peer
//! ```
//!
//! Every handler is callable through a shared reference, so the service is
//! usually held in an `Arc` and called from the bus's dispatch tasks.

mod non_acked;
mod types;

pub use non_acked::NonAckedCountCache;
pub use types::ServiceState;

use crate::bus::{EventPublisher, PersistenceEvent, ReplayTransport};
use crate::config::PersistenceConfig;
use crate::error::{PersistenceError, Result};
use crate::matcher::InMemoryMessageMatcher;
use crate::metrics;
use crate::model::{MessageId, PeerId, ReplayId, TransportMessage};
use crate::replay::{MessageReplayer, MessageReplayerRepository};
use crate::storage::{SqliteStorage, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for the matcher to drain during shutdown.
const MATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for each background task during shutdown.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Durability and replay for one bus node.
pub struct PersistenceService<S: Storage> {
    config: PersistenceConfig,

    storage: Arc<S>,

    publisher: Arc<dyn EventPublisher>,

    matcher: InMemoryMessageMatcher<S>,

    replayers: MessageReplayerRepository<S>,

    /// Service state (broadcast to watchers)
    state_tx: watch::Sender<ServiceState>,

    state_rx: watch::Receiver<ServiceState>,

    shutdown_tx: watch::Sender<bool>,

    shutdown_rx: watch::Receiver<bool>,

    /// Background task handles
    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl PersistenceService<SqliteStorage> {
    /// Open the SQLite database named by `config.storage.sqlite_path` and
    /// build a service on top of it.
    pub async fn open_sqlite(
        config: PersistenceConfig,
        transport: Arc<dyn ReplayTransport>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = SqliteStorage::open(
            &config.storage.sqlite_path,
            config.storage.out_of_order_ack_retention(),
        )
        .await?;
        info!(path = %config.storage.sqlite_path, "SQLite storage opened");
        Ok(Self::new(config, Arc::new(storage), transport, publisher))
    }
}

impl<S: Storage> PersistenceService<S> {
    /// Build a service over an existing storage engine.
    ///
    /// The service starts in `Created` state. Messages may already be
    /// enqueued; they are written once [`start()`](Self::start) runs.
    pub fn new(
        config: PersistenceConfig,
        storage: Arc<S>,
        transport: Arc<dyn ReplayTransport>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let matcher = InMemoryMessageMatcher::new(
            Arc::clone(&storage),
            Arc::clone(&publisher),
            config.matcher.settings(),
        );
        let replayers = MessageReplayerRepository::new(
            Arc::clone(&storage),
            transport,
            Arc::clone(&publisher),
            config.replay.settings(),
        );

        Self {
            config,
            storage,
            publisher,
            matcher,
            replayers,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            task_handles: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn matcher(&self) -> &InMemoryMessageMatcher<S> {
        &self.matcher
    }

    pub fn replayers(&self) -> &MessageReplayerRepository<S> {
        &self.replayers
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServiceState::Running)
    }

    fn set_state(&self, state: ServiceState) {
        let _ = self.state_tx.send(state);
        metrics::set_service_state(&state.to_string());
    }

    /// Start the service.
    ///
    /// 1. Validates configuration
    /// 2. Starts storage (rehydrates out-of-order acks)
    /// 3. Starts the matcher consumer
    /// 4. Spawns the non-acked count publisher
    pub async fn start(&self) -> Result<()> {
        if self.state() != ServiceState::Created {
            return Err(PersistenceError::InvalidState {
                expected: ServiceState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid persistence configuration");
            self.set_state(ServiceState::Failed);
            return Err(e);
        }

        info!(
            batch_size = self.config.matcher.persister_batch_size,
            delay = %self.config.matcher.persister_delay,
            "Starting persistence service"
        );
        self.set_state(ServiceState::Starting);

        if let Err(e) = self.storage.start().await {
            error!(error = %e, "Storage failed to start");
            self.set_state(ServiceState::Failed);
            return Err(e);
        }

        if let Err(e) = self.matcher.start() {
            error!(error = %e, "Matcher failed to start");
            self.set_state(ServiceState::Failed);
            return Err(e);
        }

        self.spawn_non_acked_count_task().await;

        self.set_state(ServiceState::Running);
        info!("Persistence service running");
        Ok(())
    }

    /// Spawn the periodic non-acked count publisher.
    async fn spawn_non_acked_count_task(&self) {
        let storage = Arc::clone(&self.storage);
        let publisher = Arc::clone(&self.publisher);
        let interval = self.config.reporting.non_acked_count_publish_interval();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let _ = shutdown_rx.borrow_and_update();
            let mut cache = NonAckedCountCache::new();
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        publish_non_acked_counts(storage.as_ref(), publisher.as_ref(), &mut cache).await;
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Non-acked count task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!(interval_ms = interval.as_millis() as u64, "Spawned non-acked count task");
        self.task_handles.write().await.push(handle);
    }

    /// Persist `message` for every target peer.
    ///
    /// The message is encoded once. A target in the middle of a replay also
    /// gets the message through its replay session.
    pub fn handle_persist_message(&self, message: &TransportMessage, targets: &[PeerId]) -> Result<()> {
        let bytes = message.encode()?;
        let type_name = message.message_type_id.full_name();

        for target in targets {
            self.matcher
                .enqueue_message(target.clone(), message.id, type_name, bytes.clone())?;

            if let Some(replayer) = self.replayers.get_active_message_replayer(target) {
                if replayer.add_live_message(message.clone()) {
                    debug!(peer_id = %target, message_id = %message.id, "Live message added to replay");
                }
            }
        }
        Ok(())
    }

    /// Record that `peer_id` handled `message_id`.
    pub fn handle_message_handled(&self, peer_id: &PeerId, message_id: MessageId) -> Result<()> {
        self.matcher.enqueue_ack(peer_id.clone(), message_id)?;
        if let Some(replayer) = self.replayers.get_active_message_replayer(peer_id) {
            replayer.on_message_acked(&message_id);
        }
        Ok(())
    }

    /// Start a replay session for a reconnecting peer.
    ///
    /// Any session already running for the peer is cancelled first.
    pub fn handle_start_message_replay(
        &self,
        peer_id: &PeerId,
        replay_id: ReplayId,
    ) -> Result<Arc<MessageReplayer<S>>> {
        if !self.is_running() {
            return Err(PersistenceError::InvalidState {
                expected: ServiceState::Running.to_string(),
                actual: self.state().to_string(),
            });
        }

        let replayer = self
            .replayers
            .create_message_replayer(peer_id.clone(), replay_id)?;
        self.replayers
            .set_active_message_replayer(peer_id.clone(), Arc::clone(&replayer))?;

        // Entries queued before this point are read as backlog; later ones
        // reach the session as live messages.
        let barrier = match self.matcher.enqueue_wait_handle() {
            Ok(barrier) => barrier,
            Err(e) => {
                replayer.cancel();
                return Err(e);
            }
        };
        replayer.start_after(barrier)?;

        info!(peer_id = %peer_id, replay_id = %replay_id, "Replay requested");
        Ok(replayer)
    }

    /// Cancel the peer's replay session. Returns whether one was active.
    pub fn handle_peer_disconnected(&self, peer_id: &PeerId) -> bool {
        match self.replayers.get_active_message_replayer(peer_id) {
            Some(replayer) => replayer.cancel(),
            None => false,
        }
    }

    /// Drop everything stored for a peer.
    ///
    /// Waits for writes already enqueued so they cannot resurrect the peer
    /// after the removal.
    pub async fn handle_purge_message_queue(&self, peer_id: &PeerId) -> Result<()> {
        if self.is_running() {
            self.matcher.wait_for_pending_writes().await?;
        }
        self.storage.remove_peer(peer_id).await?;
        info!(peer_id = %peer_id, "Message queue purged");
        Ok(())
    }

    pub async fn non_acked_message_counts(&self) -> Result<HashMap<PeerId, i64>> {
        self.storage.get_non_acked_message_counts().await
    }

    /// Shutdown the service gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Deactivate replayers (cancels running sessions)
    /// 2. Drain the matcher (with timeout)
    /// 3. Stop background tasks
    /// 4. Stop storage
    pub async fn shutdown(&self) {
        if matches!(self.state(), ServiceState::ShuttingDown | ServiceState::Stopped) {
            return;
        }
        info!("Shutting down persistence service");
        self.set_state(ServiceState::ShuttingDown);

        self.replayers.deactivate_message_replayers();

        let pending = self.matcher.queue_len();
        if pending > 0 {
            info!(pending, "Draining matcher queue");
        }
        if tokio::time::timeout(MATCHER_DRAIN_TIMEOUT, self.matcher.stop())
            .await
            .is_err()
        {
            warn!(
                pending = self.matcher.queue_len(),
                "Matcher did not drain in time (entries may be lost)"
            );
        }

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Err(e) = self.storage.stop().await {
            warn!(error = %e, "Storage did not stop cleanly");
        }

        self.set_state(ServiceState::Stopped);
        info!("Persistence service stopped");
    }
}

/// Publish the counts that moved since the last call.
async fn publish_non_acked_counts<S: Storage + ?Sized>(
    storage: &S,
    publisher: &dyn EventPublisher,
    cache: &mut NonAckedCountCache,
) {
    let counts = match storage.get_non_acked_message_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            warn!(error = %e, "Failed to read non-acked counts");
            return;
        }
    };

    let updated = cache.get_updated_values(&counts);
    if updated.is_empty() {
        return;
    }
    for entry in &updated {
        metrics::set_non_acked_count(entry.peer_id.as_str(), entry.count);
    }
    debug!(peers = updated.len(), "Publishing non-acked counts");
    publisher.publish(PersistenceEvent::NonAckMessagesCountChanged { counts: updated });
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry of the active replay session per peer.
//!
//! A replayer that reaches a terminal state is evicted automatically. Once
//! deactivated, the repository refuses new sessions and cancels the current
//! ones.

use super::{MessageReplayer, ReplaySettings};
use crate::bus::{EventPublisher, ReplayTransport};
use crate::error::{PersistenceError, Result};
use crate::metrics;
use crate::model::{PeerId, ReplayId};
use crate::storage::Storage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Keeps at most one active [`MessageReplayer`] per peer.
pub struct MessageReplayerRepository<S: Storage> {
    storage: Arc<S>,
    transport: Arc<dyn ReplayTransport>,
    publisher: Arc<dyn EventPublisher>,
    settings: ReplaySettings,
    active: Arc<DashMap<PeerId, Arc<MessageReplayer<S>>>>,
    deactivated: AtomicBool,
}

impl<S: Storage> MessageReplayerRepository<S> {
    pub fn new(
        storage: Arc<S>,
        transport: Arc<dyn ReplayTransport>,
        publisher: Arc<dyn EventPublisher>,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            storage,
            transport,
            publisher,
            settings,
            active: Arc::new(DashMap::new()),
            deactivated: AtomicBool::new(false),
        }
    }

    /// Build a replayer bound to this repository's storage and transport.
    pub fn create_message_replayer(
        &self,
        peer_id: PeerId,
        replay_id: ReplayId,
    ) -> Result<Arc<MessageReplayer<S>>> {
        if self.is_deactivated() {
            return Err(PersistenceError::RepositoryDeactivated);
        }
        Ok(Arc::new(MessageReplayer::new(
            peer_id,
            replay_id,
            Arc::clone(&self.storage),
            Arc::clone(&self.transport),
            Arc::clone(&self.publisher),
            self.settings.clone(),
        )))
    }

    /// Make `replayer` the peer's active session.
    ///
    /// A previous session for the same peer is cancelled and returned.
    pub fn set_active_message_replayer(
        &self,
        peer_id: PeerId,
        replayer: Arc<MessageReplayer<S>>,
    ) -> Result<Option<Arc<MessageReplayer<S>>>> {
        if self.is_deactivated() {
            return Err(PersistenceError::RepositoryDeactivated);
        }

        let previous = self.active.insert(peer_id.clone(), Arc::clone(&replayer));
        let previous = previous.filter(|prev| !Arc::ptr_eq(prev, &replayer));
        if let Some(prev) = &previous {
            prev.cancel();
            info!(
                peer_id = %peer_id,
                previous_replay_id = %prev.replay_id(),
                replay_id = %replayer.replay_id(),
                "Replay session superseded"
            );
        }

        self.spawn_eviction(peer_id.clone(), &replayer);

        // Lost a race with deactivation: undo.
        if self.is_deactivated() {
            replayer.cancel();
            self.active.remove_if(&peer_id, |_, r| Arc::ptr_eq(r, &replayer));
            return Err(PersistenceError::RepositoryDeactivated);
        }

        metrics::set_active_replayers(self.active.len());
        Ok(previous)
    }

    pub fn get_active_message_replayer(&self, peer_id: &PeerId) -> Option<Arc<MessageReplayer<S>>> {
        self.active.get(peer_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Refuse new sessions from now on and cancel the active ones.
    pub fn deactivate_message_replayers(&self) {
        if self.deactivated.swap(true, Ordering::SeqCst) {
            return;
        }
        let replayers: Vec<_> = self
            .active
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for replayer in &replayers {
            replayer.cancel();
        }
        info!(cancelled = replayers.len(), "Message replayers deactivated");
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }

    pub fn has_active_message_replayers(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Remove the entry once the replayer finishes, unless it was replaced.
    fn spawn_eviction(&self, peer_id: PeerId, replayer: &Arc<MessageReplayer<S>>) {
        let active = Arc::clone(&self.active);
        let weak = Arc::downgrade(replayer);
        let mut state_rx = replayer.state_receiver();

        tokio::spawn(async move {
            let _ = state_rx.wait_for(|state| state.is_terminal()).await;
            let removed = active
                .remove_if(&peer_id, |_, r| std::ptr::eq(Arc::as_ptr(r), weak.as_ptr()))
                .is_some();
            if removed {
                debug!(peer_id = %peer_id, "Finished replayer evicted");
                metrics::set_active_replayers(active.len());
            }
        });
    }
}

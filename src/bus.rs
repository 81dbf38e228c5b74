// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration points with the surrounding message bus.
//!
//! The persistence layer never talks to sockets. It hands replay traffic to
//! a [`ReplayTransport`] and domain events to an [`EventPublisher`], both
//! provided by the host.
//!
//! # Example
//!
//! ```rust,no_run
//! use bus_persistence::bus::{ReplayMessage, ReplayTransport, TransportFuture};
//! use bus_persistence::model::PeerId;
//!
//! struct LoggingTransport;
//!
//! impl ReplayTransport for LoggingTransport {
//!     fn send<'a>(&'a self, target: &'a PeerId, message: ReplayMessage) -> TransportFuture<'a> {
//!         Box::pin(async move {
//!             println!("{} <- {:?}", target, message.replay_id());
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::error::Result;
use crate::model::{PeerId, ReplayId, TransportMessage};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Type alias for boxed transport futures.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Logical messages sent to a peer during its replay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayMessage {
    /// One backlog or live message, wrapped for the replaying peer.
    MessageReplayed {
        replay_id: ReplayId,
        message: TransportMessage,
    },
    /// The stored backlog has been fully sent.
    ReplayPhaseEnded { replay_id: ReplayId },
    /// The safety window closed; the peer may switch to live traffic.
    SafetyPhaseEnded { replay_id: ReplayId },
}

impl ReplayMessage {
    pub fn replay_id(&self) -> ReplayId {
        match self {
            Self::MessageReplayed { replay_id, .. }
            | Self::ReplayPhaseEnded { replay_id }
            | Self::SafetyPhaseEnded { replay_id } => *replay_id,
        }
    }
}

/// One peer's entry in a [`PersistenceEvent::NonAckMessagesCountChanged`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonAckMessagesCount {
    pub peer_id: PeerId,
    pub count: i64,
}

/// Events published to the rest of the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceEvent {
    ReplaySessionStarted {
        peer_id: PeerId,
        replay_id: ReplayId,
    },
    ReplaySessionEnded {
        peer_id: PeerId,
        replay_id: ReplayId,
    },
    /// Only peers whose count moved since the previous publication.
    NonAckMessagesCountChanged { counts: Vec<NonAckMessagesCount> },
    /// Diagnostic raised when storage work fails.
    ProcessingFailed {
        component: String,
        operation: String,
        error: String,
        entry_count: usize,
    },
}

/// Sends replay traffic to a peer.
pub trait ReplayTransport: Send + Sync + 'static {
    fn send<'a>(&'a self, target: &'a PeerId, message: ReplayMessage) -> TransportFuture<'a>;
}

/// Publishes domain events.
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, event: PersistenceEvent);
}

/// Transport that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

impl ReplayTransport for NoOpTransport {
    fn send<'a>(&'a self, _target: &'a PeerId, _message: ReplayMessage) -> TransportFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Publisher that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPublisher;

impl EventPublisher for NoOpPublisher {
    fn publish(&self, _event: PersistenceEvent) {}
}

/// Fan-out publisher over a tokio broadcast channel.
///
/// Subscribing attaches a listener; dropping the receiver detaches it.
/// Slow subscribers lag and lose the oldest events rather than blocking
/// publishers.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<PersistenceEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: PersistenceEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_message_replay_id() {
        let replay_id = ReplayId::new();
        assert_eq!(ReplayMessage::ReplayPhaseEnded { replay_id }.replay_id(), replay_id);
        assert_eq!(ReplayMessage::SafetyPhaseEnded { replay_id }.replay_id(), replay_id);
    }

    #[tokio::test]
    async fn test_broadcast_attach_detach() {
        let publisher = BroadcastEventPublisher::new(16);
        assert_eq!(publisher.subscriber_count(), 0);

        let mut rx = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        let event = PersistenceEvent::ReplaySessionStarted {
            peer_id: PeerId::new("p"),
            replay_id: ReplayId::new(),
        };
        publisher.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);

        drop(rx);
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(event);
    }

    #[tokio::test]
    async fn test_noop_transport_accepts() {
        let transport = NoOpTransport;
        let result = transport
            .send(
                &PeerId::new("p"),
                ReplayMessage::ReplayPhaseEnded {
                    replay_id: ReplayId::new(),
                },
            )
            .await;
        assert!(result.is_ok());
    }
}

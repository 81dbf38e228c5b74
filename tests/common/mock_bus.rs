//! Recording doubles for the bus-facing traits.
//!
//! Every send and publish is recorded for assertions; waiters can block
//! until a number of sends has happened.

use bus_persistence::bus::{
    EventPublisher, PersistenceEvent, ReplayMessage, ReplayTransport, TransportFuture,
};
use bus_persistence::model::{MessageId, PeerId};
use bus_persistence::PersistenceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// A recorded send.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub target: PeerId,
    pub message: ReplayMessage,
}

/// Transport that records every replay message.
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    sent_count: watch::Sender<usize>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (sent_count, _) = watch::channel(0);
        Self {
            sent: Mutex::new(Vec::new()),
            sent_count,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every later send fail (after recording it).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        *self.sent_count.borrow()
    }

    /// Ids of the `MessageReplayed` envelopes, in send order.
    pub fn replayed_ids(&self) -> Vec<MessageId> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent.message {
                ReplayMessage::MessageReplayed { message, .. } => Some(message.id),
                _ => None,
            })
            .collect()
    }

    /// Compact trace: `M` per replayed message, `R` replay phase ended,
    /// `S` safety phase ended.
    pub fn trace(&self) -> String {
        self.sent()
            .iter()
            .map(|sent| match sent.message {
                ReplayMessage::MessageReplayed { .. } => 'M',
                ReplayMessage::ReplayPhaseEnded { .. } => 'R',
                ReplayMessage::SafetyPhaseEnded { .. } => 'S',
            })
            .collect()
    }

    /// Wait until at least `count` messages were sent, or panic after 5s.
    pub async fn wait_for_sent(&self, count: usize) {
        let mut rx = self.sent_count.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n >= count))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} sends", count))
            .expect("transport dropped");
    }
}

impl ReplayTransport for RecordingTransport {
    fn send<'a>(&'a self, target: &'a PeerId, message: ReplayMessage) -> TransportFuture<'a> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(SentMessage {
                target: target.clone(),
                message,
            });
            self.sent_count.send_modify(|n| *n += 1);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PersistenceError::Transport("peer unreachable".to_string()));
            }
            Ok(())
        })
    }
}

/// Publisher that records every event.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<PersistenceEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PersistenceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn processing_failures(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, PersistenceEvent::ProcessingFailed { .. }))
            .count()
    }

    pub fn sessions_started(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, PersistenceEvent::ReplaySessionStarted { .. }))
            .count()
    }

    pub fn sessions_ended(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, PersistenceEvent::ReplaySessionEnded { .. }))
            .count()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: PersistenceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

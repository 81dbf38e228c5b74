// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay sessions end to end against the in-memory engine: ordering,
//! flow control, cancellation, live buffering and the repository.
//!
//! Run with: cargo test --test replay_tests

mod common;

use bus_persistence::bus::EventPublisher;
use bus_persistence::matcher::SignalHandle;
use bus_persistence::model::{PeerId, ReplayId, TransportMessage};
use bus_persistence::replay::{MessageReplayer, MessageReplayerRepository, ReplaySettings, ReplayState};
use bus_persistence::storage::{InMemoryStorage, Storage};
use common::{message_at, message_entry, messages, RecordingPublisher, RecordingTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

struct Harness {
    storage: Arc<InMemoryStorage>,
    transport: Arc<RecordingTransport>,
    publisher: Arc<RecordingPublisher>,
    peer: PeerId,
}

impl Harness {
    fn new() -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            transport: Arc::new(RecordingTransport::new()),
            publisher: Arc::new(RecordingPublisher::new()),
            peer: PeerId::new("Abc.Replaying.0"),
        }
    }

    /// Store `count` messages for the peer and return them in id order.
    async fn backlog(&self, count: usize) -> Vec<TransportMessage> {
        let msgs = messages(count);
        let entries: Vec<_> = msgs.iter().map(|m| message_entry(&self.peer, m)).collect();
        self.storage.write(&entries).await.unwrap();
        msgs
    }

    fn replayer(&self, settings: ReplaySettings) -> MessageReplayer<InMemoryStorage> {
        let publisher: Arc<dyn EventPublisher> = self.publisher.clone();
        MessageReplayer::new(
            self.peer.clone(),
            ReplayId::new(),
            Arc::clone(&self.storage),
            self.transport.clone(),
            publisher,
            settings,
        )
    }

    fn repository(&self, settings: ReplaySettings) -> MessageReplayerRepository<InMemoryStorage> {
        MessageReplayerRepository::new(
            Arc::clone(&self.storage),
            self.transport.clone(),
            self.publisher.clone(),
            settings,
        )
    }
}

fn settings(batch_size: usize, release_threshold: usize, safety_ms: u64) -> ReplaySettings {
    ReplaySettings {
        batch_size,
        unacked_message_count_that_releases_next_batch: release_threshold,
        safety_phase_duration: Duration::from_millis(safety_ms),
    }
}

async fn finish(replayer: &MessageReplayer<InMemoryStorage>) -> ReplayState {
    tokio::time::timeout(Duration::from_secs(5), replayer.wait_until_finished())
        .await
        .expect("replay did not finish")
}

// =============================================================================
// Completeness and ordering
// =============================================================================

/// 11 stored messages, batch size 2.
#[tokio::test]
async fn replays_whole_backlog_in_order_then_phase_markers() {
    let harness = Harness::new();
    let backlog = harness.backlog(11).await;
    let replayer = harness.replayer(settings(2, 100, 20));

    replayer.start().unwrap();
    assert_eq!(finish(&replayer).await, ReplayState::Completed);

    let expected: Vec<_> = backlog.iter().map(|m| m.id).collect();
    assert_eq!(harness.transport.replayed_ids(), expected);
    assert_eq!(harness.transport.trace(), format!("{}RS", "M".repeat(11)));
    assert!(harness
        .transport
        .sent()
        .iter()
        .all(|sent| sent.target == harness.peer && sent.message.replay_id() == replayer.replay_id()));

    assert_eq!(harness.publisher.sessions_started(), 1);
    assert_eq!(harness.publisher.sessions_ended(), 1);
    assert_eq!(replayer.replayed_count(), 11);
}

#[tokio::test]
async fn acked_messages_are_not_replayed() {
    let harness = Harness::new();
    let backlog = harness.backlog(4).await;
    harness
        .storage
        .write(&[common::ack_entry(&harness.peer, &backlog[1])])
        .await
        .unwrap();

    let replayer = harness.replayer(settings(10, 10, 10));
    replayer.start().unwrap();
    finish(&replayer).await;

    assert_eq!(
        harness.transport.replayed_ids(),
        vec![backlog[0].id, backlog[2].id, backlog[3].id]
    );
}

#[tokio::test]
async fn unknown_peer_completes_without_safety_wait() {
    let harness = Harness::new();
    let replayer = harness.replayer(settings(10, 10, 60_000));

    replayer.start().unwrap();
    let state = tokio::time::timeout(Duration::from_secs(1), replayer.wait_until_finished())
        .await
        .expect("unknown peer must not wait out the safety phase");

    assert_eq!(state, ReplayState::Completed);
    assert_eq!(harness.transport.trace(), "RS");
    assert_eq!(harness.publisher.sessions_started(), 1);
    assert_eq!(harness.publisher.sessions_ended(), 1);
}

// =============================================================================
// Flow control
// =============================================================================

/// Release threshold 1, 10 backlog messages, batch size 2.
#[tokio::test]
async fn next_batch_waits_for_acks() {
    let harness = Harness::new();
    harness.backlog(10).await;
    let replayer = harness.replayer(settings(2, 1, 10));
    replayer.start().unwrap();

    let mut acked = 0;
    let mut expected = 2;
    loop {
        harness.transport.wait_for_sent(expected).await;
        assert!(replayer.outstanding_count() <= 3);

        let ids = harness.transport.replayed_ids();
        if ids.len() == 10 {
            break;
        }

        // Held back until enough acks arrive.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.transport.replayed_ids().len(), ids.len());

        while replayer.outstanding_count() > 1 {
            replayer.on_message_acked(&ids[acked]);
            acked += 1;
        }
        expected += 2;
    }

    let ids = harness.transport.replayed_ids();
    while replayer.outstanding_count() > 1 {
        replayer.on_message_acked(&ids[acked]);
        acked += 1;
    }
    assert_eq!(finish(&replayer).await, ReplayState::Completed);
    assert_eq!(harness.transport.trace(), format!("{}RS", "M".repeat(10)));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn cancel_stops_all_further_traffic() {
    let harness = Harness::new();
    harness.backlog(10).await;
    let replayer = harness.replayer(settings(2, 0, 10));
    replayer.start().unwrap();

    harness.transport.wait_for_sent(2).await;
    assert!(replayer.cancel());
    let sent = harness.transport.sent_count();

    // Acks would normally release the next batch.
    for id in harness.transport.replayed_ids() {
        replayer.on_message_acked(&id);
    }
    sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.transport.sent_count(), sent);
    assert_eq!(finish(&replayer).await, ReplayState::Cancelled);
    assert!(!replayer.cancel());
    assert_eq!(harness.publisher.sessions_ended(), 0);
}

#[tokio::test]
async fn cancel_during_safety_phase_suppresses_end_marker() {
    let harness = Harness::new();
    harness.backlog(2).await;
    let replayer = harness.replayer(settings(10, 10, 60_000));
    replayer.start().unwrap();

    harness.transport.wait_for_sent(3).await;
    assert_eq!(harness.transport.trace(), "MMR");

    assert!(replayer.cancel());
    replayer.join().await;
    assert_eq!(harness.transport.trace(), "MMR");
    assert_eq!(replayer.state(), ReplayState::Cancelled);
}

// =============================================================================
// Live buffering
// =============================================================================

#[tokio::test]
async fn live_messages_follow_backlog_in_arrival_order() {
    let harness = Harness::new();
    let backlog = harness.backlog(3).await;
    let replayer = harness.replayer(settings(2, 10, 300));

    let early = message_at(1_900_000_000_000);
    let late = message_at(1_900_000_000_001);

    assert!(replayer.add_live_message(early.clone()));
    replayer.start().unwrap();

    harness.transport.wait_for_sent(5).await;
    assert_eq!(harness.transport.trace(), "MMMMR");
    assert!(replayer.add_live_message(late.clone()));

    assert_eq!(finish(&replayer).await, ReplayState::Completed);
    assert_eq!(harness.transport.trace(), "MMMMRMS");
    assert_eq!(
        harness.transport.replayed_ids(),
        vec![backlog[0].id, backlog[1].id, backlog[2].id, early.id, late.id]
    );

    assert!(!replayer.add_live_message(message_at(1_900_000_000_002)));
}

/// The backlog reader picks up a live message committed mid-replay; its
/// live copy is then skipped.
#[tokio::test]
async fn live_message_already_read_from_storage_is_not_resent() {
    let harness = Harness::new();
    let backlog = harness.backlog(3).await;
    let replayer = harness.replayer(settings(1, 0, 10));
    replayer.start().unwrap();
    harness.transport.wait_for_sent(1).await;

    let live = message_at(1_900_000_000_000);
    harness
        .storage
        .write(&[message_entry(&harness.peer, &live)])
        .await
        .unwrap();
    assert!(replayer.add_live_message(live.clone()));

    let mut acked = 0;
    while !replayer.state().is_terminal() {
        let ids = harness.transport.replayed_ids();
        for id in &ids[acked..] {
            replayer.on_message_acked(id);
        }
        acked = ids.len();
        sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(replayer.state(), ReplayState::Completed);
    assert_eq!(harness.transport.trace(), "MMMMRS");
    assert_eq!(
        harness.transport.replayed_ids(),
        vec![backlog[0].id, backlog[1].id, backlog[2].id, live.id]
    );
}

#[tokio::test]
async fn session_waits_for_pending_writes_barrier() {
    let harness = Harness::new();
    let replayer = harness.replayer(settings(10, 10, 10));
    let (signal, barrier) = SignalHandle::new();

    replayer.start_after(barrier).unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.transport.sent_count(), 0);

    // Committed while the barrier was held.
    let late = harness.backlog(2).await;
    signal.release();

    assert_eq!(finish(&replayer).await, ReplayState::Completed);
    assert_eq!(harness.transport.replayed_ids(), vec![late[0].id, late[1].id]);
    assert_eq!(harness.transport.trace(), "MMRS");
}

#[tokio::test]
async fn cancel_while_waiting_for_barrier() {
    let harness = Harness::new();
    let replayer = harness.replayer(settings(10, 10, 10));
    let (_signal, barrier) = SignalHandle::new();

    replayer.start_after(barrier).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(replayer.cancel());

    assert_eq!(finish(&replayer).await, ReplayState::Cancelled);
    replayer.join().await;
    assert_eq!(harness.transport.sent_count(), 0);
}

#[tokio::test]
async fn transport_failures_do_not_abort_the_session() {
    let harness = Harness::new();
    harness.backlog(3).await;
    harness.transport.set_failing(true);
    let replayer = harness.replayer(settings(10, 10, 10));

    replayer.start().unwrap();
    assert_eq!(finish(&replayer).await, ReplayState::Completed);
    assert_eq!(harness.transport.trace(), "MMMRS");
    assert_eq!(harness.publisher.processing_failures(), 5);
}

// =============================================================================
// Repository
// =============================================================================

#[tokio::test]
async fn finished_replayer_is_evicted() {
    let harness = Harness::new();
    let repo = harness.repository(settings(10, 10, 10));
    let replayer = repo
        .create_message_replayer(harness.peer.clone(), ReplayId::new())
        .unwrap();
    repo.set_active_message_replayer(harness.peer.clone(), Arc::clone(&replayer))
        .unwrap();
    replayer.start().unwrap();
    finish(&replayer).await;

    for _ in 0..100 {
        if repo.get_active_message_replayer(&harness.peer).is_none() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(repo.get_active_message_replayer(&harness.peer).is_none());
    assert!(!repo.has_active_message_replayers());
}

#[tokio::test]
async fn superseded_session_does_not_evict_its_successor() {
    let harness = Harness::new();
    harness.backlog(4).await;
    let repo = harness.repository(settings(2, 0, 60_000));

    let first = repo
        .create_message_replayer(harness.peer.clone(), ReplayId::new())
        .unwrap();
    repo.set_active_message_replayer(harness.peer.clone(), Arc::clone(&first))
        .unwrap();
    first.start().unwrap();
    harness.transport.wait_for_sent(2).await;

    let second = repo
        .create_message_replayer(harness.peer.clone(), ReplayId::new())
        .unwrap();
    let previous = repo
        .set_active_message_replayer(harness.peer.clone(), Arc::clone(&second))
        .unwrap()
        .expect("first session superseded");
    assert!(Arc::ptr_eq(&previous, &first));
    assert_eq!(finish(&first).await, ReplayState::Cancelled);

    sleep(Duration::from_millis(20)).await;
    let active = repo.get_active_message_replayer(&harness.peer).unwrap();
    assert!(Arc::ptr_eq(&active, &second));
    second.cancel();
}

#[tokio::test]
async fn deactivation_cancels_running_sessions() {
    let harness = Harness::new();
    harness.backlog(6).await;
    let repo = harness.repository(settings(2, 0, 60_000));
    let replayer = repo
        .create_message_replayer(harness.peer.clone(), ReplayId::new())
        .unwrap();
    repo.set_active_message_replayer(harness.peer.clone(), Arc::clone(&replayer))
        .unwrap();
    replayer.start().unwrap();
    harness.transport.wait_for_sent(2).await;

    repo.deactivate_message_replayers();

    assert_eq!(finish(&replayer).await, ReplayState::Cancelled);
    assert!(repo.is_deactivated());
    assert!(repo
        .create_message_replayer(harness.peer.clone(), ReplayId::new())
        .is_err());
}

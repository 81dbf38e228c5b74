//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Matcher queue depth, batch commits and in-memory matches
//! - Storage failures, busy retries and isolated entries
//! - Replay sessions and replayed messages
//! - Non-acked message counts per peer
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `persistence_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Recording goes through the `metrics` facade; the embedding application
//! installs the recorder.
//!
//! # Usage
//!
//! ```rust,no_run
//! use bus_persistence::metrics;
//! use std::time::Duration;
//!
//! metrics::record_batch_write(100, Duration::from_millis(12));
//! metrics::set_non_acked_count("Abc.Service.0", 42);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a committed matcher batch.
pub fn record_batch_write(entries: usize, duration: Duration) {
    counter!("persistence_batches_written_total").increment(1);
    counter!("persistence_entries_written_total").increment(entries as u64);
    histogram!("persistence_batch_size").record(entries as f64);
    histogram!("persistence_batch_write_duration_seconds").record(duration.as_secs_f64());
}

/// Record a message/ack pair resolved before reaching storage.
pub fn record_in_memory_match() {
    counter!("persistence_in_memory_matches_total").increment(1);
}

/// Record a failed storage write. `kind` is `timeout` or `unknown`.
pub fn record_storage_failure(kind: &str) {
    counter!("persistence_storage_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Record a busy/locked retry of a maintenance statement.
pub fn record_storage_retry(operation: &str) {
    counter!("persistence_storage_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record an entry that could not be stored even on its own.
pub fn record_dropped_entry() {
    counter!("persistence_dropped_entries_total").increment(1);
}

/// Record a stored payload that could not be decoded.
pub fn record_unreadable_message(peer_id: &str) {
    counter!("persistence_unreadable_messages_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Set the number of entries waiting in the matcher queue.
pub fn set_matcher_queue_depth(depth: usize) {
    gauge!("persistence_matcher_queue_depth").set(depth as f64);
}

/// Record messages sent to a replaying peer.
pub fn record_replayed_messages(peer_id: &str, count: usize) {
    counter!("persistence_replayed_messages_total", "peer_id" => peer_id.to_string())
        .increment(count as u64);
}

/// Record how a replay session ended (`completed` or `cancelled`).
pub fn record_replay_session(outcome: &str, duration: Duration) {
    counter!("persistence_replay_sessions_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("persistence_replay_session_duration_seconds").record(duration.as_secs_f64());
}

/// Set the number of active replay sessions.
pub fn set_active_replayers(count: usize) {
    gauge!("persistence_active_replayers").set(count as f64);
}

/// Set a peer's non-acked message count.
pub fn set_non_acked_count(peer_id: &str, count: i64) {
    gauge!("persistence_non_acked_messages", "peer_id" => peer_id.to_string()).set(count as f64);
}

/// Record the service lifecycle state.
pub fn set_service_state(state: &str) {
    gauge!("persistence_service_state", "state" => state.to_string()).set(1.0);
}

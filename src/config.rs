//! Configuration for the persistence layer.
//!
//! Configuration is passed to
//! [`PersistenceService::new()`](crate::PersistenceService::new) and can be
//! constructed programmatically or deserialized from YAML/JSON. Loading it
//! from disk or a config server is the host's job.
//!
//! # Configuration Structure
//!
//! ```text
//! PersistenceConfig
//! ├── matcher: MatcherConfig     # batching and pairing window
//! ├── replay: ReplayConfig       # replay batch size, flow control, safety phase
//! ├── storage: StorageConfig     # SQLite file, tombstone retention
//! └── reporting: ReportingConfig # non-acked count publication
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! matcher:
//!   persister_batch_size: 100
//!   persister_delay: "2s"
//! replay:
//!   replay_batch_size: 200
//!   replay_unacked_message_count_that_releases_next_batch: 200
//!   safety_phase_duration: "30s"
//! storage:
//!   sqlite_path: "/var/lib/bus/persistence.db"
//!   out_of_order_ack_retention: "24h"
//! reporting:
//!   non_acked_count_publish_interval: "5s"
//! ```
//!
//! Durations are humantime strings (`"500ms"`, `"30s"`, `"2min"`). An
//! unparseable duration falls back to the default; [`PersistenceConfig::validate`]
//! reports it instead.

use crate::error::{PersistenceError, Result};
use crate::matcher::MatcherSettings;
use crate::replay::ReplaySettings;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `PersistenceService::new()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

impl PersistenceConfig {
    /// Small batches, no pairing delay, short safety phase.
    pub fn for_testing() -> Self {
        Self {
            matcher: MatcherConfig {
                persister_batch_size: 10,
                persister_delay: "0ms".to_string(),
            },
            replay: ReplayConfig {
                replay_batch_size: 10,
                replay_unacked_message_count_that_releases_next_batch: 10,
                safety_phase_duration: "50ms".to_string(),
            },
            storage: StorageConfig {
                sqlite_path: ":memory:".to_string(),
                out_of_order_ack_retention: "1h".to_string(),
            },
            reporting: ReportingConfig {
                non_acked_count_publish_interval: "50ms".to_string(),
            },
        }
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.matcher.persister_batch_size == 0 {
            return Err(PersistenceError::Config(
                "matcher.persister_batch_size must be at least 1".to_string(),
            ));
        }
        if self.replay.replay_batch_size == 0 {
            return Err(PersistenceError::Config(
                "replay.replay_batch_size must be at least 1".to_string(),
            ));
        }
        if self.storage.sqlite_path.is_empty() {
            return Err(PersistenceError::Config(
                "storage.sqlite_path must not be empty".to_string(),
            ));
        }
        let durations = [
            ("matcher.persister_delay", &self.matcher.persister_delay),
            ("replay.safety_phase_duration", &self.replay.safety_phase_duration),
            (
                "storage.out_of_order_ack_retention",
                &self.storage.out_of_order_ack_retention,
            ),
            (
                "reporting.non_acked_count_publish_interval",
                &self.reporting.non_acked_count_publish_interval,
            ),
        ];
        for (name, value) in durations {
            humantime::parse_duration(value).map_err(|e| {
                PersistenceError::Config(format!("{} = {:?}: {}", name, value, e))
            })?;
        }
        if self.reporting.non_acked_count_publish_interval().is_zero() {
            return Err(PersistenceError::Config(
                "reporting.non_acked_count_publish_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MatcherConfig: batching in front of storage
// ═══════════════════════════════════════════════════════════════════════════════

/// Batching and pairing window of the in-memory matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Maximum entries per storage write. A full batch flushes early.
    #[serde(default = "default_persister_batch_size")]
    pub persister_batch_size: usize,

    /// Minimum age before an entry is written, giving its ack a chance to
    /// arrive and cancel it in memory.
    #[serde(default = "default_persister_delay")]
    pub persister_delay: String,
}

fn default_persister_batch_size() -> usize {
    100
}

fn default_persister_delay() -> String {
    "2s".to_string()
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            persister_batch_size: default_persister_batch_size(),
            persister_delay: default_persister_delay(),
        }
    }
}

impl MatcherConfig {
    /// Parse persister_delay to Duration.
    pub fn persister_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.persister_delay).unwrap_or(Duration::from_secs(2))
    }

    pub fn settings(&self) -> MatcherSettings {
        MatcherSettings {
            batch_size: self.persister_batch_size.max(1),
            delay: self.persister_delay_duration(),
            retry: RetryConfig::storage(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplayConfig: replay sessions
// ═══════════════════════════════════════════════════════════════════════════════

/// Replay batching, flow control and safety phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Messages read and sent per replay batch.
    #[serde(default = "default_replay_batch_size")]
    pub replay_batch_size: usize,

    /// A new batch is sent only once the peer's outstanding (sent but not
    /// acked) replayed messages drop to this count.
    #[serde(default = "default_replay_release_threshold")]
    pub replay_unacked_message_count_that_releases_next_batch: usize,

    /// Grace window after the backlog, absorbing in-flight messages.
    #[serde(default = "default_safety_phase_duration")]
    pub safety_phase_duration: String,
}

fn default_replay_batch_size() -> usize {
    200
}

fn default_replay_release_threshold() -> usize {
    200
}

fn default_safety_phase_duration() -> String {
    "30s".to_string()
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            replay_batch_size: default_replay_batch_size(),
            replay_unacked_message_count_that_releases_next_batch:
                default_replay_release_threshold(),
            safety_phase_duration: default_safety_phase_duration(),
        }
    }
}

impl ReplayConfig {
    /// Parse safety_phase_duration to Duration.
    pub fn safety_phase_duration(&self) -> Duration {
        humantime::parse_duration(&self.safety_phase_duration).unwrap_or(Duration::from_secs(30))
    }

    pub fn settings(&self) -> ReplaySettings {
        ReplaySettings {
            batch_size: self.replay_batch_size.max(1),
            unacked_message_count_that_releases_next_batch: self
                .replay_unacked_message_count_that_releases_next_batch,
            safety_phase_duration: self.safety_phase_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig: SQLite engine
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// How long an ack tombstone waits for its message before it is pruned
    /// at startup. Measured from the message id's timestamp.
    #[serde(default = "default_out_of_order_ack_retention")]
    pub out_of_order_ack_retention: String,
}

fn default_sqlite_path() -> String {
    "persistence.db".to_string()
}

fn default_out_of_order_ack_retention() -> String {
    "24h".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            out_of_order_ack_retention: default_out_of_order_ack_retention(),
        }
    }
}

impl StorageConfig {
    /// Parse out_of_order_ack_retention to Duration.
    pub fn out_of_order_ack_retention(&self) -> Duration {
        humantime::parse_duration(&self.out_of_order_ack_retention)
            .unwrap_or(Duration::from_secs(24 * 60 * 60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReportingConfig: monitoring events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// How often changed non-acked counts are published.
    #[serde(default = "default_non_acked_count_publish_interval")]
    pub non_acked_count_publish_interval: String,
}

fn default_non_acked_count_publish_interval() -> String {
    "5s".to_string()
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            non_acked_count_publish_interval: default_non_acked_count_publish_interval(),
        }
    }
}

impl ReportingConfig {
    /// Parse non_acked_count_publish_interval to Duration.
    pub fn non_acked_count_publish_interval(&self) -> Duration {
        humantime::parse_duration(&self.non_acked_count_publish_interval)
            .unwrap_or(Duration::from_secs(5))
    }
}

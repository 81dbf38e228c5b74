// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay sessions for reconnecting peers.
//!
//! A [`MessageReplayer`] streams one peer's stored backlog, then forwards
//! live traffic that arrived in the meantime, then waits out a safety window
//! before handing the peer back to normal delivery. The
//! [`MessageReplayerRepository`] keeps at most one active session per peer.
//!
//! # State Transitions
//!
//! ```text
//!              start()             backlog sent           safety window over
//! Created ────────────→ Replaying ─────────────→ SafetyPhase ─────────────→ Completed
//!    │                      │                         │
//!    └──────────────────────┴─────────────────────────┘
//!                           │ cancel()
//!                           ↓
//!                       Cancelled
//! ```
//!
//! # What the Peer Sees
//!
//! ```text
//! MessageReplayed × backlog (chronological)
//! MessageReplayed × live messages received so far (arrival order)
//! ReplayPhaseEnded
//! MessageReplayed × live messages received during the safety window
//! SafetyPhaseEnded
//! ```

mod replayer;
mod repository;

pub use replayer::MessageReplayer;
pub use repository::MessageReplayerRepository;

use std::time::Duration;

/// Runtime settings shared by every replay session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySettings {
    /// Messages read from storage and sent per batch.
    pub batch_size: usize,

    /// The next batch is held back while more replayed messages than this
    /// are still unacknowledged.
    pub unacked_message_count_that_releases_next_batch: usize,

    /// Grace window after the backlog during which live messages keep
    /// being forwarded.
    pub safety_phase_duration: Duration,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            unacked_message_count_that_releases_next_batch: 200,
            safety_phase_duration: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of a replay session.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    /// Built but not started. Live messages are already buffered.
    Created,

    /// Sending the stored backlog.
    Replaying,

    /// Backlog sent; forwarding live messages until the window closes.
    SafetyPhase,

    /// Session finished normally.
    Completed,

    /// Session stopped before completion. Nothing more is sent.
    Cancelled,
}

impl ReplayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplayState::Completed | ReplayState::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for ReplayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayState::Created => write!(f, "Created"),
            ReplayState::Replaying => write!(f, "Replaying"),
            ReplayState::SafetyPhase => write!(f, "SafetyPhase"),
            ReplayState::Completed => write!(f, "Completed"),
            ReplayState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

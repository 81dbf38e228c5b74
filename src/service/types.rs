//! Service state types.
//!
//! Defines the state machine for the persistence service lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   ├──── storage failed to start ───→ Failed
//!    │                              ↓
//!    │                          Running
//!    │                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────────→ ShuttingDown ──→ Stopped
//! ```
//!
//! - **Created**: built, nothing running. Storage untouched.
//! - **Starting**: storage starting, out-of-order acks being rehydrated.
//! - **Running**: matcher consuming, replays accepted, counts published.
//! - **ShuttingDown**: replayers cancelled, matcher draining.
//! - **Stopped**: everything flushed and closed.
//! - **Failed**: storage could not be started.

/// State of the persistence service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "Created"),
            ServiceState::Starting => write!(f, "Starting"),
            ServiceState::Running => write!(f, "Running"),
            ServiceState::ShuttingDown => write!(f, "ShuttingDown"),
            ServiceState::Stopped => write!(f, "Stopped"),
            ServiceState::Failed => write!(f, "Failed"),
        }
    }
}

//! # Bus Persistence
//!
//! Durability and replay layer of a publish/subscribe message bus.
//!
//! Messages addressed to a peer are kept until the peer acknowledges them.
//! When a peer reconnects it receives its exact backlog, in order, before
//! rejoining live traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          PersistenceService                               │
//! │                                                                           │
//! │  ┌────────────────────────┐   batches   ┌──────────────────────────────┐  │
//! │  │ InMemoryMessageMatcher │────────────►│ Storage                      │  │
//! │  │ (pair msg/ack, delay)  │             │ (SQLite / in-memory)         │  │
//! │  └────────────────────────┘             └──────────────────────────────┘  │
//! │         ▲                                            │ MessageReader      │
//! │         │ persist / handled                          ▼                    │
//! │  ┌────────────────────────┐   live copy  ┌─────────────────────────┐      │
//! │  │ bus dispatch           │─────────────►│ MessageReplayer         │──► peer
//! │  └────────────────────────┘              │ (one active per peer)   │      │
//! │                                          └─────────────────────────┘      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **At-least-once**: a message is stored until its ack is stored
//! 2. **Per-peer order**: replay follows message id order, then live arrival order
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bus_persistence::bus::{BroadcastEventPublisher, NoOpTransport};
//! use bus_persistence::{PersistenceConfig, PersistenceService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PersistenceConfig::default();
//!     let publisher = Arc::new(BroadcastEventPublisher::default());
//!
//!     let service = PersistenceService::open_sqlite(config, Arc::new(NoOpTransport), publisher)
//!         .await
//!         .expect("Failed to open storage");
//!     service.start().await.expect("Failed to start");
//!
//!     // Handlers are called by the bus until shutdown
//!     service.shutdown().await;
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod replay;
pub mod resilience;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use bus::{EventPublisher, PersistenceEvent, ReplayMessage, ReplayTransport};
pub use config::{MatcherConfig, PersistenceConfig, ReplayConfig, ReportingConfig, StorageConfig};
pub use error::{PersistenceError, Result};
pub use matcher::{InMemoryMessageMatcher, MatcherEntry, MatcherSettings};
pub use model::{MessageId, MessageTypeId, PeerId, ReplayId, TransportMessage};
pub use replay::{MessageReplayer, MessageReplayerRepository, ReplaySettings, ReplayState};
pub use service::{PersistenceService, ServiceState};
pub use storage::{InMemoryStorage, MessageReader, SqliteStorage, Storage, StorageKey};

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the persistence layer.
//!
//! Errors are categorized by how the caller is expected to react to them.
//! The matcher uses [`PersistenceError::is_retryable()`] to choose between
//! retrying a whole batch and isolating a poisoned entry.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `StorageTimeout` | Yes | Store busy/locked or connection acquisition timed out |
//! | `StorageUnknown` | No | Any other storage failure (assume one bad entry) |
//! | `Serialization` | No | Unreadable payload, dropped and logged |
//! | `RepositoryDeactivated` | No | Replayer requested after drain started |
//! | `Transport` | No | Replay traffic could not be handed to the bus |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Component is shutting down |
//!
//! Two outcomes are deliberately *not* errors: asking for a reader for a peer
//! with no record returns `None`, and superseding a replay session cancels the
//! previous replayer and hands it back to the caller.

use thiserror::Error;

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Errors that can occur in the persistence layer.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Transient storage failure.
    ///
    /// The store was busy, locked, or a connection could not be acquired in
    /// time. The same batch is retried later; nothing is lost.
    #[error("Storage timeout ({operation}): {message}")]
    StorageTimeout { operation: String, message: String },

    /// Non-transient storage failure.
    ///
    /// The matcher assumes a single poisoned entry and falls back to
    /// committing the batch one entry at a time.
    #[error("Storage error ({operation}): {message}")]
    StorageUnknown {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// A stored or received payload could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The replayer repository was deactivated (drain or shutdown in progress).
    #[error("Message replayer repository is deactivated")]
    RepositoryDeactivated,

    /// The host transport refused a replay message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl PersistenceError {
    /// Create a timeout error without a source.
    pub fn timeout(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageTimeout {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a storage error without a source.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageUnknown {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Classify a sqlx error raised while running `operation`.
    pub fn sqlite(operation: impl Into<String>, source: sqlx::Error) -> Self {
        let operation = operation.into();
        if is_sqlite_timeout(&source) {
            Self::StorageTimeout {
                operation,
                message: source.to_string(),
            }
        } else {
            Self::StorageUnknown {
                operation,
                message: source.to_string(),
                source: Some(source),
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StorageTimeout { .. } => true,
            Self::StorageUnknown { .. } => false,
            Self::Serialization(_) => false,
            Self::RepositoryDeactivated => false,
            Self::Transport(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED or a pool acquisition timeout.
pub(crate) fn is_sqlite_timeout(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(e: sqlx::Error) -> Self {
        Self::sqlite("unknown", e)
    }
}

impl From<bincode::Error> for PersistenceError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

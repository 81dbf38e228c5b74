// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage engine.
//!
//! Messages, tombstones and counters live in three tables. A batch is one
//! transaction, so a crash never leaves messages and counters disagreeing.
//!
//! # Schema
//!
//! | Table | Columns |
//! |-------|---------|
//! | `messages` | `key BLOB PK`, `peer_id TEXT`, `message_bytes BLOB` |
//! | `out_of_order_acks` | `key BLOB PK`, `peer_id TEXT` |
//! | `peer_counts` | `peer_id TEXT PK`, `non_acked_count INTEGER` |
//!
//! BLOB comparison in SQLite is `memcmp`, so `ORDER BY key` is the same
//! byte-wise order as the key layout. The `peer_id` column scopes scans to
//! exactly one peer.
//!
//! # SQLite Busy Handling
//!
//! Inside a batch, SQLITE_BUSY/SQLITE_LOCKED surfaces as
//! [`PersistenceError::StorageTimeout`] and the matcher retries the whole
//! batch. Maintenance statements (startup, peer removal, checkpoint) retry
//! in place with exponential backoff.

use super::{
    decode_stored, retention_cutoff_ticks, tombstone_expired, MessageReader, Storage,
    StorageFuture, StorageKey,
};
use crate::error::{PersistenceError, Result};
use crate::matcher::{EntryKind, MatcherEntry};
use crate::model::{PeerId, TransportMessage};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that selects a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        key BLOB PRIMARY KEY,
        peer_id TEXT NOT NULL,
        message_bytes BLOB NOT NULL
    ) WITHOUT ROWID",
    "CREATE INDEX IF NOT EXISTS idx_messages_peer_key ON messages (peer_id, key)",
    "CREATE TABLE IF NOT EXISTS out_of_order_acks (
        key BLOB PRIMARY KEY,
        peer_id TEXT NOT NULL
    ) WITHOUT ROWID",
    "CREATE TABLE IF NOT EXISTS peer_counts (
        peer_id TEXT PRIMARY KEY,
        non_acked_count INTEGER NOT NULL
    )",
];

const INSERT_MESSAGE: &str =
    "INSERT INTO messages (key, peer_id, message_bytes) VALUES (?, ?, ?) ON CONFLICT(key) DO NOTHING";
const UPDATE_MESSAGE: &str = "UPDATE messages SET message_bytes = ? WHERE key = ?";
const DELETE_MESSAGE: &str = "DELETE FROM messages WHERE key = ?";
const INSERT_TOMBSTONE: &str =
    "INSERT INTO out_of_order_acks (key, peer_id) VALUES (?, ?) ON CONFLICT(key) DO NOTHING";
const DELETE_TOMBSTONE: &str = "DELETE FROM out_of_order_acks WHERE key = ?";
const ADD_TO_COUNT: &str = "INSERT INTO peer_counts (peer_id, non_acked_count) VALUES (?, ?)
    ON CONFLICT(peer_id) DO UPDATE SET non_acked_count = non_acked_count + excluded.non_acked_count";
const SELECT_FIRST_PAGE: &str = "SELECT key, message_bytes FROM messages
    WHERE peer_id = ? AND key >= ? ORDER BY key LIMIT ?";
const SELECT_NEXT_PAGE: &str = "SELECT key, message_bytes FROM messages
    WHERE peer_id = ? AND key > ? ORDER BY key LIMIT ?";

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e)
                if crate::error::is_sqlite_timeout(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS =>
            {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_storage_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> PersistenceError {
    move |e| PersistenceError::sqlite(operation, e)
}

/// Storage engine backed by a SQLite database file.
pub struct SqliteStorage {
    pool: SqlitePool,
    /// Mirror of `out_of_order_acks`; the lock is held for a whole batch.
    out_of_order_acks: Mutex<HashSet<Vec<u8>>>,
    ack_retention: Duration,
    path: String,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub async fn open(path: impl AsRef<Path>, ack_retention: Duration) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening SQLite message store");

        // An in-memory database lives and dies with its connection, so it
        // gets exactly one that is never recycled.
        let in_memory = path_str == IN_MEMORY_PATH;
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| PersistenceError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            // One writer plus concurrent replay readers.
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(db_error("open"))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(db_error("create_schema"))?;
        }

        Ok(Self {
            pool,
            out_of_order_acks: Mutex::new(HashSet::new()),
            ack_retention,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of out-of-order ack tombstones currently tracked.
    pub async fn out_of_order_ack_count(&self) -> usize {
        self.out_of_order_acks.lock().await.len()
    }

    async fn write_batch(&self, entries: &[MatcherEntry]) -> Result<()> {
        let mut acks = self.out_of_order_acks.lock().await;
        // Tombstone presence after this batch, for keys the batch touched.
        let mut staged: HashMap<Vec<u8>, bool> = HashMap::new();
        let mut deltas: HashMap<&PeerId, i64> = HashMap::new();

        let mut tx = self.pool.begin().await.map_err(db_error("begin"))?;

        for entry in entries {
            match &entry.kind {
                EntryKind::Message(bytes) => {
                    deltas.entry(&entry.peer_id).or_insert(0);
                    let key = entry.key().into_bytes();
                    let tombstoned = staged
                        .get(&key)
                        .copied()
                        .unwrap_or_else(|| acks.contains(&key));
                    if tombstoned {
                        sqlx::query(DELETE_TOMBSTONE)
                            .bind(&key)
                            .execute(&mut *tx)
                            .await
                            .map_err(db_error("delete_tombstone"))?;
                        debug!(
                            peer_id = %entry.peer_id,
                            message_id = %entry.message_id,
                            "Message already acked, not storing"
                        );
                        staged.insert(key, false);
                        continue;
                    }

                    let inserted = sqlx::query(INSERT_MESSAGE)
                        .bind(&key)
                        .bind(entry.peer_id.as_str())
                        .bind(bytes.as_slice())
                        .execute(&mut *tx)
                        .await
                        .map_err(db_error("insert_message"))?
                        .rows_affected();
                    if inserted == 1 {
                        *deltas.entry(&entry.peer_id).or_insert(0) += 1;
                    } else {
                        sqlx::query(UPDATE_MESSAGE)
                            .bind(bytes.as_slice())
                            .bind(&key)
                            .execute(&mut *tx)
                            .await
                            .map_err(db_error("update_message"))?;
                    }
                }
                EntryKind::Ack => {
                    let key = entry.key().into_bytes();
                    let deleted = sqlx::query(DELETE_MESSAGE)
                        .bind(&key)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_error("delete_message"))?
                        .rows_affected();
                    if deleted > 0 {
                        *deltas.entry(&entry.peer_id).or_insert(0) -= 1;
                    } else {
                        sqlx::query(INSERT_TOMBSTONE)
                            .bind(&key)
                            .bind(entry.peer_id.as_str())
                            .execute(&mut *tx)
                            .await
                            .map_err(db_error("insert_tombstone"))?;
                        staged.insert(key, true);
                    }
                }
                EntryKind::Signal(_) => {}
            }
        }

        for (peer_id, delta) in &deltas {
            sqlx::query(ADD_TO_COUNT)
                .bind(peer_id.as_str())
                .bind(*delta)
                .execute(&mut *tx)
                .await
                .map_err(db_error("update_count"))?;
        }

        tx.commit().await.map_err(db_error("commit"))?;

        for (key, present) in staged {
            if present {
                acks.insert(key);
            } else {
                acks.remove(&key);
            }
        }
        Ok(())
    }

    async fn rehydrate_out_of_order_acks(&self) -> Result<()> {
        let pool = &self.pool;
        let keys: Vec<(Vec<u8>,)> = execute_with_retry("load_tombstones", || async {
            sqlx::query_as("SELECT key FROM out_of_order_acks")
                .fetch_all(pool)
                .await
        })
        .await
        .map_err(db_error("load_tombstones"))?;

        let cutoff = retention_cutoff_ticks(self.ack_retention);
        let (expired, live): (Vec<_>, Vec<_>) = keys
            .into_iter()
            .map(|(key,)| key)
            .partition(|key| tombstone_expired(key, cutoff));

        if !expired.is_empty() {
            let mut tx = self.pool.begin().await.map_err(db_error("begin"))?;
            for key in &expired {
                sqlx::query(DELETE_TOMBSTONE)
                    .bind(key)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("prune_tombstones"))?;
            }
            tx.commit().await.map_err(db_error("commit"))?;
            info!(pruned = expired.len(), "Pruned expired out-of-order acks");
        }

        let mut acks = self.out_of_order_acks.lock().await;
        acks.clear();
        acks.extend(live);
        if !acks.is_empty() {
            info!(count = acks.len(), "Restored out-of-order acks from previous run");
        }
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn start(&self) -> StorageFuture<'_, ()> {
        Box::pin(self.rehydrate_out_of_order_acks())
    }

    fn stop(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            if let Err(e) = execute_with_retry("checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(pool)
                    .await
            })
            .await
            {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
            self.pool.close().await;
            info!(path = %self.path, "SQLite message store closed");
            Ok(())
        })
    }

    fn write<'a>(&'a self, entries: &'a [MatcherEntry]) -> StorageFuture<'a, ()> {
        Box::pin(self.write_batch(entries))
    }

    fn create_message_reader(
        &self,
        peer_id: &PeerId,
    ) -> StorageFuture<'_, Option<Box<dyn MessageReader>>> {
        let peer_id = peer_id.clone();
        Box::pin(async move {
            let known: Option<(i64,)> =
                sqlx::query_as("SELECT non_acked_count FROM peer_counts WHERE peer_id = ?")
                    .bind(peer_id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_error("create_reader"))?;
            if known.is_none() {
                return Ok(None);
            }
            let reader: Box<dyn MessageReader> = Box::new(SqliteMessageReader {
                pool: self.pool.clone(),
                peer_id,
                position: None,
                exhausted: false,
            });
            Ok(Some(reader))
        })
    }

    fn remove_peer(&self, peer_id: &PeerId) -> StorageFuture<'_, ()> {
        let peer_id = peer_id.clone();
        Box::pin(async move {
            let pool = &self.pool;
            let removed = execute_with_retry("remove_peer", || async {
                let mut tx = pool.begin().await?;
                let removed = sqlx::query("DELETE FROM messages WHERE peer_id = ?")
                    .bind(peer_id.as_str())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                sqlx::query("DELETE FROM peer_counts WHERE peer_id = ?")
                    .bind(peer_id.as_str())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok::<u64, sqlx::Error>(removed)
            })
            .await
            .map_err(db_error("remove_peer"))?;

            info!(peer_id = %peer_id, removed, "Removed peer");
            Ok(())
        })
    }

    fn get_non_acked_message_counts(&self) -> StorageFuture<'_, HashMap<PeerId, i64>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT peer_id, non_acked_count FROM peer_counts")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(db_error("get_counts"))?;
            Ok(rows
                .into_iter()
                .map(|(peer_id, count)| (PeerId::new(peer_id), count))
                .collect())
        })
    }
}

/// Keyset-paginated reader: each page is a fresh bounded query, so no
/// statement or transaction stays open between batches.
struct SqliteMessageReader {
    pool: SqlitePool,
    peer_id: PeerId,
    position: Option<Vec<u8>>,
    exhausted: bool,
}

impl MessageReader for SqliteMessageReader {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn next_batch(&mut self, max: usize) -> StorageFuture<'_, Vec<TransportMessage>> {
        Box::pin(async move {
            let mut batch = Vec::new();
            let limit = i64::try_from(max.max(1)).unwrap_or(i64::MAX);

            // Pages made only of unreadable rows must not end the scan.
            while !self.exhausted && batch.is_empty() {
                let (sql, lower) = match &self.position {
                    Some(last) => (SELECT_NEXT_PAGE, last.clone()),
                    None => (SELECT_FIRST_PAGE, StorageKey::zero(&self.peer_id).into_bytes()),
                };
                let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(sql)
                    .bind(self.peer_id.as_str())
                    .bind(lower)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(db_error("read_messages"))?;

                if (rows.len() as i64) < limit {
                    self.exhausted = true;
                }
                for (key, bytes) in rows {
                    if let Some(message) = decode_stored(&self.peer_id, &bytes) {
                        batch.push(message);
                    }
                    self.position = Some(key);
                }
            }
            Ok(batch)
        })
    }
}

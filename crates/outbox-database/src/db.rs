//! Database connection and query operations.

use crate::{migrations, queries, DatabaseResult, DeadLetterMessage, OutboxMessage};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// Database wrapper with query methods.
///
/// The connection is guarded by a mutex so one `Database` can be shared
/// (`Arc`) between the business write path, which only inserts, and the
/// delivery processor, which is the sole mutator. Every state transition is
/// its own short transaction; nothing is held across a batch.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode and performance optimizations
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        // Run migrations
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        // Note: WAL mode doesn't apply to in-memory databases
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure against the underlying connection.
    ///
    /// This is the seam for hosting write paths that need to insert an
    /// outbox message inside the same transaction as their domain change
    /// (see [`queries::insert_outbox_message`]).
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> DatabaseResult<T>,
    ) -> DatabaseResult<T> {
        let conn = self.conn.lock().expect("lock poisoned");
        f(&conn)
    }

    // ==========================================
    // Outbox messages
    // ==========================================

    /// Insert a new outbox message.
    pub fn insert_outbox_message(&self, message: &OutboxMessage) -> DatabaseResult<()> {
        self.with_connection(|conn| queries::insert_outbox_message(conn, message))
    }

    /// Get an outbox message by ID.
    pub fn get_outbox_message(&self, id: &str) -> DatabaseResult<Option<OutboxMessage>> {
        self.with_connection(|conn| queries::get_outbox_message(conn, id))
    }

    /// Load the batch of messages eligible for delivery at `now`.
    pub fn eligible_outbox_messages(
        &self,
        now: DateTime<Utc>,
        max_retry_attempts: i32,
        limit: usize,
    ) -> DatabaseResult<Vec<OutboxMessage>> {
        self.with_connection(|conn| {
            queries::eligible_outbox_messages(conn, now, max_retry_attempts, limit)
        })
    }

    /// Check whether a different message with the same idempotency key has
    /// already been processed.
    pub fn has_processed_duplicate(
        &self,
        idempotency_key: &str,
        exclude_message_id: &str,
    ) -> DatabaseResult<bool> {
        self.with_connection(|conn| {
            queries::has_processed_duplicate(conn, idempotency_key, exclude_message_id)
        })
    }

    /// Persist the delivery state of an outbox message.
    pub fn update_outbox_message(&self, message: &OutboxMessage) -> DatabaseResult<bool> {
        self.with_connection(|conn| queries::update_outbox_message(conn, message))
    }

    /// Count unprocessed outbox messages.
    pub fn count_pending(&self) -> DatabaseResult<i64> {
        self.with_connection(queries::count_pending)
    }

    // ==========================================
    // Dead letter messages
    // ==========================================

    /// Archive an exhausted message: insert the dead letter and delete the
    /// source row atomically.
    pub fn archive_outbox_message(&self, dead_letter: &DeadLetterMessage) -> DatabaseResult<()> {
        self.with_connection(|conn| queries::archive_outbox_message(conn, dead_letter))
    }

    /// Get a dead letter by ID.
    pub fn get_dead_letter(&self, id: &str) -> DatabaseResult<Option<DeadLetterMessage>> {
        self.with_connection(|conn| queries::get_dead_letter(conn, id))
    }

    /// Get the dead letter archived for a given source message, if any.
    pub fn get_dead_letter_for_message(
        &self,
        original_message_id: &str,
    ) -> DatabaseResult<Option<DeadLetterMessage>> {
        self.with_connection(|conn| {
            queries::get_dead_letter_for_message(conn, original_message_id)
        })
    }

    /// List all dead letters, most recently archived first.
    pub fn list_dead_letters(&self) -> DatabaseResult<Vec<DeadLetterMessage>> {
        self.with_connection(queries::list_dead_letters)
    }

    /// Delete a dead letter by ID (administrative operation).
    pub fn delete_dead_letter(&self, id: &str) -> DatabaseResult<bool> {
        self.with_connection(|conn| queries::delete_dead_letter(conn, id))
    }
}

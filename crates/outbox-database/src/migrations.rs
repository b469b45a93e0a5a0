//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    // Create migrations tracking table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_messages(conn)?;
    }
    if current_version < 2 {
        migrate_v2_dead_letter_messages(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Live outbox queue.
fn migrate_v1_outbox_messages(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox messages");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_messages (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT,
            created_at TEXT NOT NULL,
            processed_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            next_retry_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_processed_at
            ON outbox_messages(processed_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_created_at
            ON outbox_messages(created_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_idempotency_key
            ON outbox_messages(idempotency_key)
            WHERE idempotency_key IS NOT NULL;

        -- Composite index serving the eligibility predicate
        CREATE INDEX IF NOT EXISTS idx_outbox_eligibility
            ON outbox_messages(processed_at, next_retry_at, retry_count);
        ",
    )?;

    record_migration(conn, 1, "outbox_messages")?;
    Ok(())
}

/// V2: Dead-letter archive. Append-only; rows are removed only by explicit
/// administrative action.
fn migrate_v2_dead_letter_messages(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: dead letter messages");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dead_letter_messages (
            id TEXT PRIMARY KEY,
            original_message_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT,
            original_created_at TEXT NOT NULL,
            moved_to_archive_at TEXT NOT NULL,
            total_retry_attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letter_original_message_id
            ON dead_letter_messages(original_message_id);
        CREATE INDEX IF NOT EXISTS idx_dead_letter_moved_to_archive_at
            ON dead_letter_messages(moved_to_archive_at);
        ",
    )?;

    record_migration(conn, 2, "dead_letter_messages")?;
    Ok(())
}

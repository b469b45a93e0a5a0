//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter so a hosting
//! write path can insert an outbox message inside the same transaction as
//! the domain change it announces.

use crate::{DatabaseError, DatabaseResult, DeadLetterMessage, OutboxMessage};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

// ==========================================
// Outbox messages
// ==========================================

/// Insert a new outbox message.
pub fn insert_outbox_message(conn: &Connection, message: &OutboxMessage) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO outbox_messages (id, event_type, payload, idempotency_key, created_at, processed_at, retry_count, error, next_retry_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.id,
            message.event_type,
            message.payload,
            message.idempotency_key,
            format_datetime(message.created_at),
            message.processed_at.map(format_datetime),
            message.retry_count,
            message.error,
            message.next_retry_at.map(format_datetime),
        ],
    )?;
    debug!(message_id = %message.id, event_type = %message.event_type, "Outbox message inserted");
    Ok(())
}

/// Get an outbox message by ID.
pub fn get_outbox_message(conn: &Connection, id: &str) -> DatabaseResult<Option<OutboxMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, event_type, payload, idempotency_key, created_at, processed_at, retry_count, error, next_retry_at
         FROM outbox_messages WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id], outbox_message_from_row);

    match result {
        Ok(message) => Ok(Some(message)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Load the bounded batch of messages eligible for delivery at `now`:
/// unprocessed, due (no scheduled retry or the schedule has elapsed), and
/// still inside the retry budget. Ordered ascending by creation time.
///
/// Rows already sitting at the budget (crash mid-escalation) are excluded
/// here; reconciling them is an out-of-band concern.
pub fn eligible_outbox_messages(
    conn: &Connection,
    now: DateTime<Utc>,
    max_retry_attempts: i32,
    limit: usize,
) -> DatabaseResult<Vec<OutboxMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, event_type, payload, idempotency_key, created_at, processed_at, retry_count, error, next_retry_at
         FROM outbox_messages
         WHERE processed_at IS NULL
           AND (next_retry_at IS NULL OR next_retry_at <= ?1)
           AND retry_count < ?2
         ORDER BY created_at ASC
         LIMIT ?3",
    )?;

    let messages = stmt
        .query_map(
            params![format_datetime(now), max_retry_attempts, limit as i64],
            outbox_message_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

/// Check whether a *different* outbox message with the same idempotency key
/// has already been processed.
pub fn has_processed_duplicate(
    conn: &Connection,
    idempotency_key: &str,
    exclude_message_id: &str,
) -> DatabaseResult<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT EXISTS(
            SELECT 1 FROM outbox_messages
            WHERE idempotency_key = ?1
              AND id != ?2
              AND processed_at IS NOT NULL
         )",
    )?;

    let exists: bool = stmt.query_row(params![idempotency_key, exclude_message_id], |row| {
        row.get(0)
    })?;
    Ok(exists)
}

/// Persist the delivery state of an outbox message.
///
/// Only the processor-owned columns change; identity, event type, payload,
/// idempotency key, and creation time are immutable after insert.
pub fn update_outbox_message(conn: &Connection, message: &OutboxMessage) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_messages
         SET processed_at = ?1, retry_count = ?2, error = ?3, next_retry_at = ?4
         WHERE id = ?5",
        params![
            message.processed_at.map(format_datetime),
            message.retry_count,
            message.error,
            message.next_retry_at.map(format_datetime),
            message.id,
        ],
    )?;
    Ok(count > 0)
}

/// Count unprocessed outbox messages.
pub fn count_pending(conn: &Connection) -> DatabaseResult<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox_messages WHERE processed_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ==========================================
// Dead letter messages
// ==========================================

/// Archive an exhausted outbox message: insert the dead letter and delete
/// the source row as one transaction. A partially applied pair is never
/// observable; if the source row is already gone the transaction rolls back
/// and `NotFound` is returned.
pub fn archive_outbox_message(
    conn: &Connection,
    dead_letter: &DeadLetterMessage,
) -> DatabaseResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO dead_letter_messages (id, original_message_id, event_type, payload, idempotency_key, original_created_at, moved_to_archive_at, total_retry_attempts, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            dead_letter.id,
            dead_letter.original_message_id,
            dead_letter.event_type,
            dead_letter.payload,
            dead_letter.idempotency_key,
            format_datetime(dead_letter.original_created_at),
            format_datetime(dead_letter.moved_to_archive_at),
            dead_letter.total_retry_attempts,
            dead_letter.last_error,
        ],
    )?;

    let deleted = tx.execute(
        "DELETE FROM outbox_messages WHERE id = ?1",
        params![dead_letter.original_message_id],
    )?;
    if deleted == 0 {
        // Dropping the transaction rolls the insert back
        return Err(DatabaseError::NotFound(format!(
            "Outbox message not found for archival: {}",
            dead_letter.original_message_id
        )));
    }

    tx.commit()?;
    debug!(
        dead_letter_id = %dead_letter.id,
        original_message_id = %dead_letter.original_message_id,
        total_retry_attempts = dead_letter.total_retry_attempts,
        "Outbox message archived"
    );
    Ok(())
}

/// Get a dead letter by ID.
pub fn get_dead_letter(conn: &Connection, id: &str) -> DatabaseResult<Option<DeadLetterMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, original_message_id, event_type, payload, idempotency_key, original_created_at, moved_to_archive_at, total_retry_attempts, last_error
         FROM dead_letter_messages WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id], dead_letter_from_row);

    match result {
        Ok(dead_letter) => Ok(Some(dead_letter)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Get the dead letter archived for a given source message, if any.
pub fn get_dead_letter_for_message(
    conn: &Connection,
    original_message_id: &str,
) -> DatabaseResult<Option<DeadLetterMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, original_message_id, event_type, payload, idempotency_key, original_created_at, moved_to_archive_at, total_retry_attempts, last_error
         FROM dead_letter_messages WHERE original_message_id = ?1",
    )?;

    let result = stmt.query_row(params![original_message_id], dead_letter_from_row);

    match result {
        Ok(dead_letter) => Ok(Some(dead_letter)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List all dead letters, most recently archived first.
pub fn list_dead_letters(conn: &Connection) -> DatabaseResult<Vec<DeadLetterMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, original_message_id, event_type, payload, idempotency_key, original_created_at, moved_to_archive_at, total_retry_attempts, last_error
         FROM dead_letter_messages ORDER BY moved_to_archive_at DESC",
    )?;

    let dead_letters = stmt
        .query_map([], dead_letter_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(dead_letters)
}

/// Delete a dead letter by ID. Administrative operation; the processor
/// never calls this.
pub fn delete_dead_letter(conn: &Connection, id: &str) -> DatabaseResult<bool> {
    let count = conn.execute("DELETE FROM dead_letter_messages WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

// ==========================================
// Row mapping and timestamps
// ==========================================

fn outbox_message_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: row.get(2)?,
        idempotency_key: row.get(3)?,
        created_at: parse_datetime(row.get::<_, String>(4)?),
        processed_at: row.get::<_, Option<String>>(5)?.map(parse_datetime),
        retry_count: row.get(6)?,
        error: row.get(7)?,
        next_retry_at: row.get::<_, Option<String>>(8)?.map(parse_datetime),
    })
}

fn dead_letter_from_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterMessage> {
    Ok(DeadLetterMessage {
        id: row.get(0)?,
        original_message_id: row.get(1)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        idempotency_key: row.get(4)?,
        original_created_at: parse_datetime(row.get::<_, String>(5)?),
        moved_to_archive_at: parse_datetime(row.get::<_, String>(6)?),
        total_retry_attempts: row.get(7)?,
        last_error: row.get(8)?,
    })
}

/// Fixed-width RFC 3339 (microseconds, Z suffix) so TEXT comparison in SQL
/// agrees with chronological order.
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

//! Model types for the outbox queue and the dead-letter archive.
//!
//! `OutboxMessage` fields are only ever changed through the documented
//! lifecycle operations: the write path calls [`OutboxMessage::new`] when it
//! commits a domain change, and the delivery processor is the sole caller of
//! [`OutboxMessage::mark_processed`] and [`OutboxMessage::record_failure`]
//! after that.

use crate::{DatabaseError, DatabaseResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Error text recorded on a dead letter when the source row carried none.
const UNKNOWN_ERROR: &str = "Unknown error";

/// Outbox message - one pending domain event in the live delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub event_type: String,
    pub payload: String,
    /// Always `Some` after `new()`: a fallback key is synthesized when the
    /// caller does not provide one.
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `None` = pending delivery.
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error: Option<String>,
    /// `None` = eligible immediately.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Create a new pending outbox message.
    ///
    /// Rejects an empty event type or payload. When `idempotency_key` is
    /// omitted, a weak per-instance key is synthesized from the simplified
    /// event type name, a uuid, and the creation timestamp so that unkeyed
    /// events do not collide with each other.
    pub fn new(
        event_type: &str,
        payload: &str,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Self> {
        if event_type.trim().is_empty() {
            return Err(DatabaseError::InvalidData(
                "Event type must not be empty".to_string(),
            ));
        }
        if payload.trim().is_empty() {
            return Err(DatabaseError::InvalidData(
                "Payload must not be empty".to_string(),
            ));
        }

        let idempotency_key = idempotency_key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| synthesize_idempotency_key(event_type, now));

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            idempotency_key: Some(idempotency_key),
            created_at: now,
            processed_at: None,
            retry_count: 0,
            error: None,
            next_retry_at: None,
        })
    }

    /// Mark the message as delivered.
    pub fn mark_processed(&mut self, now: DateTime<Utc>) {
        self.processed_at = Some(now);
        self.error = None;
        self.next_retry_at = None;
    }

    /// Record a delivery failure and schedule the next attempt.
    ///
    /// The retry delay doubles with each failure: `2^retry_count` minutes
    /// (1st failure -> +2 min, 2nd -> +4 min, 3rd -> +8 min). Downstream
    /// consumers are expected to recover within single-digit minutes.
    pub fn record_failure(&mut self, message: &str, now: DateTime<Utc>) -> DatabaseResult<()> {
        if message.trim().is_empty() {
            return Err(DatabaseError::InvalidData(
                "Failure message must not be empty".to_string(),
            ));
        }

        self.retry_count += 1;
        self.error = Some(message.to_string());
        self.processed_at = None;
        self.next_retry_at = Some(now + backoff_delay(self.retry_count));
        Ok(())
    }

    /// Whether the message has been delivered (or deduplicated).
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Dead letter message - immutable archive entry for a message that
/// exhausted its retry budget. Removed only by explicit administrative
/// action, never by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: String,
    /// Back-reference for lookup only; the source row is deleted when the
    /// archive entry is created.
    pub original_message_id: String,
    pub event_type: String,
    pub payload: String,
    pub idempotency_key: Option<String>,
    pub original_created_at: DateTime<Utc>,
    pub moved_to_archive_at: DateTime<Utc>,
    pub total_retry_attempts: i32,
    pub last_error: String,
}

impl DeadLetterMessage {
    /// Snapshot an exhausted outbox message into an archive entry.
    ///
    /// Event type, payload, and idempotency key are copied, not shared, so
    /// the archive survives deletion of the source row. The source is never
    /// mutated.
    pub fn from_outbox_message(source: &OutboxMessage, now: DateTime<Utc>) -> Self {
        let last_error = source
            .error
            .as_deref()
            .filter(|error| !error.trim().is_empty())
            .unwrap_or(UNKNOWN_ERROR)
            .to_string();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            original_message_id: source.id.clone(),
            event_type: source.event_type.clone(),
            payload: source.payload.clone(),
            idempotency_key: source.idempotency_key.clone(),
            original_created_at: source.created_at,
            moved_to_archive_at: now,
            total_retry_attempts: source.retry_count,
            last_error,
        }
    }
}

/// Exponential backoff delay for a given retry count: `2^retry_count`
/// minutes, saturating instead of overflowing for absurd counts.
fn backoff_delay(retry_count: i32) -> Duration {
    let shift = retry_count.clamp(0, 32) as u32;
    let minutes = 1i64.checked_shl(shift).unwrap_or(i64::MAX);
    Duration::minutes(minutes)
}

/// Fallback idempotency key for unkeyed events.
fn synthesize_idempotency_key(event_type: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        simplified_type_name(event_type),
        uuid::Uuid::new_v4(),
        now.timestamp_millis()
    )
}

/// Last segment of a namespaced event type name ("orders.UserCreated" and
/// "orders::UserCreated" both simplify to "UserCreated").
fn simplified_type_name(event_type: &str) -> &str {
    event_type
        .rsplit(['.', ':'])
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(event_type)
}

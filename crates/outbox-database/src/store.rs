//! Storage abstraction for the delivery processor.
//!
//! The processor works against this trait rather than [`Database`] directly
//! so tests can substitute failing or recording stores.

use crate::{Database, DatabaseResult, DeadLetterMessage, OutboxMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Storage operations the delivery processor needs.
pub trait OutboxStore: Send + Sync {
    /// Load the batch of messages eligible for delivery at `now`.
    fn eligible_outbox_messages(
        &self,
        now: DateTime<Utc>,
        max_retry_attempts: i32,
        limit: usize,
    ) -> DatabaseResult<Vec<OutboxMessage>>;

    /// Check whether a different message with the same idempotency key has
    /// already been processed.
    fn has_processed_duplicate(
        &self,
        idempotency_key: &str,
        exclude_message_id: &str,
    ) -> DatabaseResult<bool>;

    /// Persist the delivery state of an outbox message.
    fn update_outbox_message(&self, message: &OutboxMessage) -> DatabaseResult<bool>;

    /// Archive an exhausted message: insert the dead letter and delete the
    /// source row atomically.
    fn archive_outbox_message(&self, dead_letter: &DeadLetterMessage) -> DatabaseResult<()>;
}

/// Shared handle to an outbox store.
pub type StoreHandle = Arc<dyn OutboxStore>;

impl OutboxStore for Database {
    fn eligible_outbox_messages(
        &self,
        now: DateTime<Utc>,
        max_retry_attempts: i32,
        limit: usize,
    ) -> DatabaseResult<Vec<OutboxMessage>> {
        Database::eligible_outbox_messages(self, now, max_retry_attempts, limit)
    }

    fn has_processed_duplicate(
        &self,
        idempotency_key: &str,
        exclude_message_id: &str,
    ) -> DatabaseResult<bool> {
        Database::has_processed_duplicate(self, idempotency_key, exclude_message_id)
    }

    fn update_outbox_message(&self, message: &OutboxMessage) -> DatabaseResult<bool> {
        Database::update_outbox_message(self, message)
    }

    fn archive_outbox_message(&self, dead_letter: &DeadLetterMessage) -> DatabaseResult<()> {
        Database::archive_outbox_message(self, dead_letter)
    }
}

//! A single delivery pass over the outbox queue.
//!
//! The pass is a plain synchronous function over the store and dispatcher
//! traits with an injected clock, so every delivery rule is testable without
//! a runtime. [`crate::OutboxProcessor`] drives it on an interval.

use chrono::{DateTime, Utc};
use outbox_database::{DatabaseResult, DeadLetterMessage, OutboxMessage, OutboxStore};
use outbox_dispatch::{DomainEvent, EventDispatcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delivery processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Interval between polling passes
    pub poll_interval: Duration,
    /// Maximum messages loaded per pass
    pub batch_size: usize,
    /// Delivery failures tolerated before a message is archived
    pub max_retry_attempts: i32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 50,
            max_retry_attempts: 3,
        }
    }
}

/// Outcome counters for one delivery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Messages loaded as eligible
    pub selected: usize,
    /// Messages delivered and marked processed
    pub processed: usize,
    /// Messages skipped as already-delivered duplicates
    pub deduplicated: usize,
    /// Messages whose delivery failed this pass
    pub failed: usize,
    /// Failed messages escalated to the dead-letter archive
    pub archived: usize,
    /// Whether the pass stopped early on a shutdown request
    pub cancelled: bool,
}

/// Run one delivery pass at the given instant.
///
/// Eligible messages are handled oldest first. A duplicate of an
/// already-processed message is marked processed without dispatch; a
/// dispatch failure is recorded on that message alone and the pass moves
/// on; the failure that exhausts the retry budget archives the message. A
/// store error aborts the pass, and the cancel flag is honored between
/// messages so shutdown never interrupts a message mid-flight.
pub fn process_pending(
    store: &dyn OutboxStore,
    dispatcher: &dyn EventDispatcher,
    config: &ProcessorConfig,
    now: DateTime<Utc>,
    cancel: &AtomicBool,
) -> DatabaseResult<PassSummary> {
    let messages =
        store.eligible_outbox_messages(now, config.max_retry_attempts, config.batch_size)?;

    let mut summary = PassSummary {
        selected: messages.len(),
        ..Default::default()
    };

    for mut message in messages {
        if cancel.load(Ordering::SeqCst) {
            summary.cancelled = true;
            break;
        }

        if let Some(key) = message.idempotency_key.clone() {
            if store.has_processed_duplicate(&key, &message.id)? {
                message.mark_processed(now);
                store.update_outbox_message(&message)?;
                summary.deduplicated += 1;
                debug!(
                    message_id = %message.id,
                    idempotency_key = %key,
                    "Skipped duplicate of an already-processed message"
                );
                continue;
            }
        }

        match dispatch_message(dispatcher, &message) {
            Ok(()) => {
                message.mark_processed(now);
                store.update_outbox_message(&message)?;
                summary.processed += 1;
                debug!(
                    message_id = %message.id,
                    event_type = %message.event_type,
                    "Message delivered"
                );
            }
            Err(error) => {
                message.record_failure(&error, now)?;
                summary.failed += 1;

                if message.retry_count >= config.max_retry_attempts {
                    let dead_letter = DeadLetterMessage::from_outbox_message(&message, now);
                    store.archive_outbox_message(&dead_letter)?;
                    summary.archived += 1;
                    warn!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        retry_count = message.retry_count,
                        error = %error,
                        "Message exhausted its retry budget and was archived"
                    );
                } else {
                    store.update_outbox_message(&message)?;
                    warn!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        retry_count = message.retry_count,
                        error = %error,
                        "Message delivery failed, retry scheduled"
                    );
                }
            }
        }
    }

    if summary.selected > 0 {
        info!(
            selected = summary.selected,
            processed = summary.processed,
            deduplicated = summary.deduplicated,
            failed = summary.failed,
            archived = summary.archived,
            cancelled = summary.cancelled,
            "Delivery pass complete"
        );
    }
    Ok(summary)
}

/// Reconstruct the event and hand it to the dispatcher. A payload that no
/// longer parses is a delivery failure like any other, so it flows into the
/// same retry-then-archive path.
fn dispatch_message(dispatcher: &dyn EventDispatcher, message: &OutboxMessage) -> Result<(), String> {
    let event = DomainEvent::reconstruct(&message.event_type, &message.payload)
        .map_err(|e| e.to_string())?;
    dispatcher.dispatch(&event).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use outbox_database::{Database, DatabaseError};
    use outbox_dispatch::{DispatchError, DispatchResult};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    /// Dispatcher double that records event types and fails the configured
    /// ones, optionally tripping the cancel flag after each dispatch.
    #[derive(Default)]
    struct RecordingDispatcher {
        seen: Mutex<Vec<String>>,
        fail_types: HashSet<String>,
        cancel_after_dispatch: Option<Arc<AtomicBool>>,
    }

    impl RecordingDispatcher {
        fn failing(event_types: &[&str]) -> Self {
            Self {
                fail_types: event_types.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EventDispatcher for RecordingDispatcher {
        fn dispatch(&self, event: &DomainEvent) -> DispatchResult<()> {
            self.seen.lock().unwrap().push(event.event_type.clone());
            if let Some(cancel) = &self.cancel_after_dispatch {
                cancel.store(true, Ordering::SeqCst);
            }
            if self.fail_types.contains(&event.event_type) {
                return Err(DispatchError::Handler("Network error".to_string()));
            }
            Ok(())
        }
    }

    /// Store double whose every operation fails.
    struct FailingStore;

    impl OutboxStore for FailingStore {
        fn eligible_outbox_messages(
            &self,
            _now: DateTime<Utc>,
            _max_retry_attempts: i32,
            _limit: usize,
        ) -> DatabaseResult<Vec<OutboxMessage>> {
            Err(DatabaseError::Connection("database is locked".to_string()))
        }

        fn has_processed_duplicate(
            &self,
            _idempotency_key: &str,
            _exclude_message_id: &str,
        ) -> DatabaseResult<bool> {
            Err(DatabaseError::Connection("database is locked".to_string()))
        }

        fn update_outbox_message(&self, _message: &OutboxMessage) -> DatabaseResult<bool> {
            Err(DatabaseError::Connection("database is locked".to_string()))
        }

        fn archive_outbox_message(&self, _dead_letter: &DeadLetterMessage) -> DatabaseResult<()> {
            Err(DatabaseError::Connection("database is locked".to_string()))
        }
    }

    fn insert_message(db: &Database, event_type: &str, created_at: DateTime<Utc>) -> OutboxMessage {
        let message = OutboxMessage::new(event_type, r#"{"id":1}"#, None, created_at).unwrap();
        db.insert_outbox_message(&message).unwrap();
        message
    }

    fn run_pass(
        db: &Database,
        dispatcher: &dyn EventDispatcher,
        now: DateTime<Utc>,
    ) -> PassSummary {
        let cancel = AtomicBool::new(false);
        process_pending(db, dispatcher, &ProcessorConfig::default(), now, &cancel).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ProcessorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retry_attempts, 3);
    }

    #[test]
    fn test_successful_pass_marks_messages_processed() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let message = insert_message(&db, "UserCreated", t0);
        let dispatcher = RecordingDispatcher::default();

        let summary = run_pass(&db, &dispatcher, t0);

        assert_eq!(summary.selected, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 0);
        assert!(!summary.cancelled);
        assert_eq!(dispatcher.seen(), vec!["UserCreated"]);

        let loaded = db.get_outbox_message(&message.id).unwrap().unwrap();
        assert!(loaded.is_processed());
        assert!(loaded.error.is_none());

        // A processed message is never selected again
        let summary = run_pass(&db, &dispatcher, t0 + ChronoDuration::minutes(1));
        assert_eq!(summary.selected, 0);
    }

    #[test]
    fn test_messages_delivered_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        insert_message(&db, "Second", t0 + ChronoDuration::seconds(1));
        insert_message(&db, "Third", t0 + ChronoDuration::seconds(2));
        insert_message(&db, "First", t0);
        let dispatcher = RecordingDispatcher::default();

        run_pass(&db, &dispatcher, t0 + ChronoDuration::seconds(10));
        assert_eq!(dispatcher.seen(), vec!["First", "Second", "Third"]);
    }

    #[test]
    fn test_failure_schedules_doubling_retries() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let message = insert_message(&db, "UserCreated", t0);
        let dispatcher = RecordingDispatcher::failing(&["UserCreated"]);

        // First failure: retry at +2 min
        let summary = run_pass(&db, &dispatcher, t0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.archived, 0);
        let loaded = db.get_outbox_message(&message.id).unwrap().unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(
            loaded.next_retry_at.unwrap().timestamp_micros(),
            (t0 + ChronoDuration::minutes(2)).timestamp_micros()
        );

        // Not due yet
        let summary = run_pass(&db, &dispatcher, t0 + ChronoDuration::minutes(1));
        assert_eq!(summary.selected, 0);

        // Second failure at +2 min: retry at +2+4 min
        let t1 = t0 + ChronoDuration::minutes(2);
        let summary = run_pass(&db, &dispatcher, t1);
        assert_eq!(summary.failed, 1);
        let loaded = db.get_outbox_message(&message.id).unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(
            loaded.next_retry_at.unwrap().timestamp_micros(),
            (t1 + ChronoDuration::minutes(4)).timestamp_micros()
        );
    }

    #[test]
    fn test_third_failure_archives_message() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let message = insert_message(&db, "UserCreated", t0);
        let dispatcher = RecordingDispatcher::failing(&["UserCreated"]);

        let mut now = t0;
        for expected_failed in 1..=2 {
            let summary = run_pass(&db, &dispatcher, now);
            assert_eq!(summary.failed, 1);
            assert_eq!(summary.archived, 0, "attempt {expected_failed}");
            now = db
                .get_outbox_message(&message.id)
                .unwrap()
                .unwrap()
                .next_retry_at
                .unwrap();
        }

        let summary = run_pass(&db, &dispatcher, now);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.archived, 1);

        // Gone from the live queue, present in the archive
        assert!(db.get_outbox_message(&message.id).unwrap().is_none());
        let dead_letter = db
            .get_dead_letter_for_message(&message.id)
            .unwrap()
            .unwrap();
        assert_eq!(dead_letter.event_type, "UserCreated");
        assert_eq!(dead_letter.total_retry_attempts, 3);
        assert_eq!(dead_letter.last_error, "Handler error: Network error");

        // Nothing left to do
        let summary = run_pass(&db, &dispatcher, now + ChronoDuration::hours(1));
        assert_eq!(summary.selected, 0);
    }

    #[test]
    fn test_duplicate_of_processed_message_skips_dispatch() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let first = OutboxMessage::new(
            "UserCreated",
            r#"{"id":1}"#,
            Some("user-1".to_string()),
            t0,
        )
        .unwrap();
        let second = OutboxMessage::new(
            "UserCreated",
            r#"{"id":1}"#,
            Some("user-1".to_string()),
            t0 + ChronoDuration::seconds(1),
        )
        .unwrap();
        db.insert_outbox_message(&first).unwrap();
        db.insert_outbox_message(&second).unwrap();
        let dispatcher = RecordingDispatcher::default();

        let summary = run_pass(&db, &dispatcher, t0 + ChronoDuration::seconds(10));

        // The older message is delivered; the younger one is recognized as
        // a duplicate in the same pass and never dispatched.
        assert_eq!(summary.selected, 2);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.deduplicated, 1);
        assert_eq!(dispatcher.seen().len(), 1);

        let loaded = db.get_outbox_message(&second.id).unwrap().unwrap();
        assert!(loaded.is_processed());
    }

    #[test]
    fn test_distinct_keys_are_not_duplicates() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        // Unkeyed messages get synthesized per-message keys
        insert_message(&db, "UserCreated", t0);
        insert_message(&db, "UserCreated", t0 + ChronoDuration::seconds(1));
        let dispatcher = RecordingDispatcher::default();

        let summary = run_pass(&db, &dispatcher, t0 + ChronoDuration::seconds(10));
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.deduplicated, 0);
    }

    #[test]
    fn test_poison_message_does_not_block_others() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        insert_message(&db, "Poison", t0);
        insert_message(&db, "Healthy", t0 + ChronoDuration::seconds(1));
        let dispatcher = RecordingDispatcher::failing(&["Poison"]);

        let summary = run_pass(&db, &dispatcher, t0 + ChronoDuration::seconds(10));
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(dispatcher.seen(), vec!["Poison", "Healthy"]);
    }

    #[test]
    fn test_malformed_payload_is_a_delivery_failure() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let message = OutboxMessage::new("UserCreated", "{not json", None, t0).unwrap();
        db.insert_outbox_message(&message).unwrap();
        let dispatcher = RecordingDispatcher::default();

        let summary = run_pass(&db, &dispatcher, t0);
        assert_eq!(summary.failed, 1);
        // The dispatcher never saw it
        assert!(dispatcher.seen().is_empty());

        let loaded = db.get_outbox_message(&message.id).unwrap().unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.error.unwrap().contains("Malformed payload"));
    }

    #[test]
    fn test_batch_size_bounds_a_pass() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        for i in 0..5 {
            insert_message(&db, "UserCreated", t0 + ChronoDuration::seconds(i));
        }
        let dispatcher = RecordingDispatcher::default();
        let config = ProcessorConfig {
            batch_size: 3,
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);

        let now = t0 + ChronoDuration::minutes(1);
        let summary = process_pending(&db, &dispatcher, &config, now, &cancel).unwrap();
        assert_eq!(summary.selected, 3);
        assert_eq!(summary.processed, 3);

        // The remainder is picked up by the next pass
        let summary = process_pending(&db, &dispatcher, &config, now, &cancel).unwrap();
        assert_eq!(summary.selected, 2);
        assert_eq!(summary.processed, 2);
    }

    #[test]
    fn test_store_failure_aborts_pass() {
        let dispatcher = RecordingDispatcher::default();
        let cancel = AtomicBool::new(false);

        let result = process_pending(
            &FailingStore,
            &dispatcher,
            &ProcessorConfig::default(),
            Utc::now(),
            &cancel,
        );
        assert!(matches!(result, Err(DatabaseError::Connection(_))));
        assert!(dispatcher.seen().is_empty());
    }

    #[test]
    fn test_cancellation_stops_between_messages() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let first = insert_message(&db, "First", t0);
        let second = insert_message(&db, "Second", t0 + ChronoDuration::seconds(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let dispatcher = RecordingDispatcher {
            cancel_after_dispatch: Some(cancel.clone()),
            ..Default::default()
        };

        let summary = process_pending(
            &db,
            &dispatcher,
            &ProcessorConfig::default(),
            t0 + ChronoDuration::seconds(10),
            &cancel,
        )
        .unwrap();

        // The first message completed in full, the second was never started
        assert!(summary.cancelled);
        assert_eq!(summary.selected, 2);
        assert_eq!(summary.processed, 1);
        assert_eq!(dispatcher.seen(), vec!["First"]);
        assert!(db.get_outbox_message(&first.id).unwrap().unwrap().is_processed());
        assert!(!db.get_outbox_message(&second.id).unwrap().unwrap().is_processed());
    }
}

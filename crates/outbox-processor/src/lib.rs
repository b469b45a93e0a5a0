//! Reliable delivery of outbox messages.
//!
//! The write path inserts outbox rows in the same transaction as its domain
//! change; this crate gets them to their consumers at least once. A single
//! [`OutboxProcessor`] polls the queue, dispatches each eligible message,
//! retries failures with a doubling backoff, and archives messages that
//! exhaust their retry budget to the dead-letter table.

pub mod pass;
pub mod processor;

pub use pass::{process_pending, PassSummary, ProcessorConfig};
pub use processor::OutboxProcessor;

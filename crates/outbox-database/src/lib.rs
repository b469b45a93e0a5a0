//! SQLite persistence for the transactional outbox.
//!
//! Provides the outbox message and dead-letter data model, schema
//! migrations, and query functions. [`Database`] wraps a connection for
//! shared use; the standalone functions in [`queries`] accept any
//! `&Connection` so a hosting write path can enqueue a message inside the
//! same transaction as the domain change it announces.

pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod store;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use models::{DeadLetterMessage, OutboxMessage};
pub use store::{OutboxStore, StoreHandle};

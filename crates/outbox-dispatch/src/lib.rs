//! Domain event reconstruction and dispatch.
//!
//! Turns stored outbox rows back into typed [`DomainEvent`]s and fans them
//! out through an [`EventDispatcher`]. The delivery processor depends only
//! on the trait, so hosts can plug in the in-process
//! [`EventDispatcherRegistry`] or their own transport.

pub mod dispatcher;
pub mod error;
pub mod event;

pub use dispatcher::{DispatcherHandle, EventDispatcher, EventDispatcherRegistry, HandlerFn};
pub use error::{DispatchError, DispatchResult};
pub use event::DomainEvent;

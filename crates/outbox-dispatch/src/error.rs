//! Dispatch error types.

use thiserror::Error;

/// Dispatch error type.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The stored payload is not valid JSON
    #[error("Malformed payload for event '{event_type}': {source}")]
    MalformedPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The stored event type is empty
    #[error("Empty event type")]
    EmptyEventType,

    /// A handler rejected the event
    #[error("Handler error: {0}")]
    Handler(String),
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;

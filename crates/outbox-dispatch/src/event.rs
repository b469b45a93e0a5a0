//! Domain event reconstructed from a stored outbox message.

use crate::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};

/// A domain event ready for dispatch.
///
/// The payload is carried as parsed JSON; reconstruction fails up front if
/// the stored text is malformed so handlers never see invalid input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    /// Event type name, e.g. "UserCreated"
    pub event_type: String,
    /// Parsed event payload
    pub payload: serde_json::Value,
}

impl DomainEvent {
    /// Reconstruct an event from its stored type name and payload text.
    pub fn reconstruct(event_type: &str, payload: &str) -> DispatchResult<Self> {
        if event_type.trim().is_empty() {
            return Err(DispatchError::EmptyEventType);
        }
        let payload =
            serde_json::from_str(payload).map_err(|source| DispatchError::MalformedPayload {
                event_type: event_type.to_string(),
                source,
            })?;
        Ok(Self {
            event_type: event_type.to_string(),
            payload,
        })
    }
}

//! Typed message envelopes for the event bus.
//!
//! Payloads are routed by the `kind` tag rather than by dynamic
//! attribute access: every message on the bus is a [`MessageEnvelope`]
//! and consumers dispatch on `kind` through a static table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Delivery metadata attached to every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    /// Unique id of this message.
    pub message_id: Uuid,

    /// Logical producer (module or adapter name).
    pub source: String,

    /// Id of the message this one replies to, if any.
    pub correlation_id: Option<Uuid>,

    /// Publish time.
    pub timestamp: DateTime<Utc>,

    /// Delivery priority; lower is more urgent. Informational only,
    /// the broker does not reorder.
    pub priority: u8,
}

impl EnvelopeMetadata {
    /// Create metadata for a freshly published message.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            source: source.into(),
            correlation_id: None,
            timestamp: Utc::now(),
            priority: 5,
        }
    }
}

/// A tagged message carried by the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message type tag, e.g. `"echo.request"`.
    pub kind: String,

    /// Message body.
    pub payload: Value,

    /// Delivery metadata.
    pub metadata: EnvelopeMetadata,
}

impl MessageEnvelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            metadata: EnvelopeMetadata::new(source),
        }
    }

    /// Create a reply correlated to this envelope.
    #[must_use]
    pub fn reply(&self, kind: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        let mut metadata = EnvelopeMetadata::new(source);
        metadata.correlation_id = Some(self.metadata.message_id);
        Self {
            kind: kind.into(),
            payload,
            metadata,
        }
    }
}

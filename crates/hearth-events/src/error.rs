//! Event bus error types.

use thiserror::Error;

/// Errors that can occur on the event bus.
#[derive(Debug, Error)]
pub enum EventsError {
    /// A scoped module client published outside its allow-list.
    #[error("module '{module}' is not permitted to publish on topic '{topic}'")]
    TopicNotPermitted {
        /// Offending module name.
        module: String,
        /// Topic that was rejected.
        topic: String,
    },

    /// A correlated reply did not arrive in time.
    #[error("timed out waiting for a reply on '{0}'")]
    ReplyTimeout(String),

    /// The reply stream closed before a correlated reply arrived.
    #[error("reply stream closed before a correlated reply arrived")]
    ReplyStreamClosed,

    /// The loopback listener failed to bind.
    #[error("failed to bind bus listener on {addr}: {source}")]
    Bind {
        /// Address that failed to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Frame serialization failed.
    #[error("frame serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event bus operations.
pub type EventsResult<T> = Result<T, EventsError>;

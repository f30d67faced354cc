//! Client-facing error taxonomy.
//!
//! Every failure a plugin or adapter can surface to a client is an
//! [`ApiError`]: an HTTP-style status code, a machine-readable
//! [`ErrorKind`], and a human-readable detail string. Plugins set an
//! `ApiError` on the request context instead of unwinding; the pipeline
//! stops at the first error and the adapter serializes it in its own
//! framing (JSON body, error frame, or reply object).

use serde::{Deserialize, Serialize};

/// Machine-readable error categories.
///
/// The wire representation is the snake_case name (e.g.
/// `"rate_limited"`), which clients are expected to match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Transport
    /// Request framing or payload could not be decoded.
    DecodeFailure,
    /// Payload exceeds the configured maximum size.
    PayloadTooLarge,
    /// The underlying connection closed mid-request.
    ConnectionClosed,

    // Session
    /// No session channel exists for this client.
    EncryptionRequired,
    /// The session channel has expired.
    SessionExpired,
    /// Payload decryption failed.
    EncryptionError,
    /// Handshake body did not match the expected shape.
    InvalidHandshakeFormat,
    /// Handshake processing failed on the server side.
    HandshakeProcessingFailed,

    // Authentication / authorization
    /// No credential was presented.
    MissingCredential,
    /// The presented credential is invalid.
    InvalidCredential,
    /// The presented token has expired.
    ExpiredToken,
    /// The principal is not permitted to send this message type.
    NotPermitted,

    // Rate limiting
    /// The client exceeded its request quota.
    RateLimited,

    // Validation
    /// The message envelope is malformed.
    MalformedMessage,
    /// The message type is not registered.
    UnknownMessageType,
    /// The payload violates the message schema.
    SchemaViolation,

    // Routing
    /// The downstream handler did not reply in time.
    DownstreamTimeout,
    /// The event bus is not reachable.
    BusUnavailable,
    /// No handler is registered for the message type.
    NoHandler,
    /// No route matches the requested path.
    NotFound,

    // Scheduling
    /// The referenced task does not exist.
    TaskNotFound,
    /// The task is already executing.
    TaskAlreadyRunning,
    /// The execution lock is held elsewhere.
    LockConflict,
    /// The cron expression is invalid.
    InvalidCron,
    /// The task class cannot be resolved.
    TaskClassNotFound,

    // Internal
    /// A plugin raised an unexpected error.
    ProcessingError,
    /// Any other uncaught failure.
    Internal,
}

impl ErrorKind {
    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecodeFailure => "decode_failure",
            Self::PayloadTooLarge => "payload_too_large",
            Self::ConnectionClosed => "connection_closed",
            Self::EncryptionRequired => "encryption_required",
            Self::SessionExpired => "session_expired",
            Self::EncryptionError => "encryption_error",
            Self::InvalidHandshakeFormat => "invalid_handshake_format",
            Self::HandshakeProcessingFailed => "handshake_processing_failed",
            Self::MissingCredential => "missing_credential",
            Self::InvalidCredential => "invalid_credential",
            Self::ExpiredToken => "expired_token",
            Self::NotPermitted => "not_permitted",
            Self::RateLimited => "rate_limited",
            Self::MalformedMessage => "malformed_message",
            Self::UnknownMessageType => "unknown_message_type",
            Self::SchemaViolation => "schema_violation",
            Self::DownstreamTimeout => "downstream_timeout",
            Self::BusUnavailable => "bus_unavailable",
            Self::NoHandler => "no_handler",
            Self::NotFound => "not_found",
            Self::TaskNotFound => "task_not_found",
            Self::TaskAlreadyRunning => "task_already_running",
            Self::LockConflict => "lock_conflict",
            Self::InvalidCron => "invalid_cron",
            Self::TaskClassNotFound => "task_class_not_found",
            Self::ProcessingError => "processing_error",
            Self::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-facing error with an HTTP-style status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP-style status code (also used by non-HTTP adapters).
    pub status: u16,
    /// Machine-readable category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub detail: String,
}

impl ApiError {
    /// Create a new error.
    #[must_use]
    pub fn new(status: u16, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            detail: detail.into(),
        }
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(400, kind, detail)
    }

    /// 401 Unauthorized.
    #[must_use]
    pub fn unauthorized(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(401, kind, detail)
    }

    /// 403 Forbidden.
    #[must_use]
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(403, ErrorKind::NotPermitted, detail)
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(404, kind, detail)
    }

    /// 429 Too Many Requests.
    #[must_use]
    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(429, ErrorKind::RateLimited, detail)
    }

    /// 500 Internal Server Error with the generic kind.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(500, ErrorKind::Internal, detail)
    }

    /// 503 Service Unavailable.
    #[must_use]
    pub fn unavailable(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(503, kind, detail)
    }

    /// JSON body for HTTP-style adapters: `{"error": kind, "detail": ...}`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind.as_str(),
            "detail": self.detail,
        })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status, self.kind, self.detail)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ErrorKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(ErrorKind::Internal.as_str(), "internal_error");
        assert_eq!(
            ErrorKind::InvalidHandshakeFormat.as_str(),
            "invalid_handshake_format"
        );
    }

    #[test]
    fn test_helpers_set_status() {
        assert_eq!(ApiError::forbidden("no").status, 403);
        assert_eq!(ApiError::rate_limited("slow down").status, 429);
        assert_eq!(ApiError::internal("boom").status, 500);
    }

    #[test]
    fn test_json_body() {
        let err = ApiError::bad_request(ErrorKind::MalformedMessage, "missing kind");
        let body = err.to_json();
        assert_eq!(body["error"], "malformed_message");
        assert_eq!(body["detail"], "missing kind");
    }
}

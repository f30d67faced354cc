//! Per-request context shared across the plugin pipeline.

use serde_json::Value;

use crate::client::{ClientInfo, Principal};
use crate::error::ApiError;

/// The client protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Request/reply HTTP surface.
    Rest,
    /// Long-lived bidirectional session.
    WebSocket,
    /// Local inter-process transport.
    Ipc,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Ipc => write!(f, "ipc"),
        }
    }
}

/// Mutable context owned by exactly one request while it traverses the
/// plugin pipeline.
///
/// Created by a protocol adapter, handed to each enabled plugin in
/// execution order, and destroyed once the response is written. Each
/// plugin sees the mutations of every plugin before it.
///
/// At pipeline exit exactly one of `response` or `error` is set; the
/// pipeline enforces this by filling a default error when a terminal
/// stage forgot to produce anything.
#[derive(Debug)]
pub struct RequestContext {
    /// Originating protocol.
    pub protocol: Protocol,

    /// Decoded request payload as set by the adapter.
    pub request: Value,

    /// Client identity information.
    pub client: ClientInfo,

    /// Authenticated principal, set by the security plugin.
    pub principal: Option<Principal>,

    /// Addressable message type, set once the payload is parsed.
    pub message_type: Option<String>,

    /// Response payload, filled by the terminal stage or a bus reply.
    pub response: Option<Value>,

    /// Error set by any plugin; short-circuits the pipeline.
    pub error: Option<ApiError>,

    /// Set by terminal stages (handshake and similar) to stop traversal
    /// with the current response.
    pub skip_remaining: bool,
}

impl RequestContext {
    /// Create a fresh context for one inbound request.
    #[must_use]
    pub fn new(protocol: Protocol, request: Value, client: ClientInfo) -> Self {
        Self {
            protocol,
            request,
            client,
            principal: None,
            message_type: None,
            response: None,
            error: None,
            skip_remaining: false,
        }
    }

    /// Record a failure and stop further processing.
    pub fn fail(&mut self, error: ApiError) {
        self.error = Some(error);
    }

    /// Record the response payload.
    pub fn respond(&mut self, response: Value) {
        self.response = Some(response);
    }

    /// Record the response payload and stop further processing.
    pub fn respond_and_skip(&mut self, response: Value) {
        self.response = Some(response);
        self.skip_remaining = true;
    }

    /// Whether the pipeline should stop visiting plugins.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.error.is_some() || self.skip_remaining
    }

    /// Whether the request carries an authenticated principal.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, ErrorKind};
    use serde_json::json;

    fn test_context() -> RequestContext {
        RequestContext::new(
            Protocol::Rest,
            json!({"kind": "echo.request"}),
            ClientInfo::new("127.0.0.1:1234", "test", "rest"),
        )
    }

    #[test]
    fn test_fresh_context_not_terminated() {
        let ctx = test_context();
        assert!(!ctx.is_terminated());
        assert!(!ctx.is_authenticated());
        assert!(ctx.response.is_none());
        assert!(ctx.error.is_none());
    }

    #[test]
    fn test_fail_terminates() {
        let mut ctx = test_context();
        ctx.fail(ApiError::bad_request(ErrorKind::MalformedMessage, "bad"));
        assert!(ctx.is_terminated());
        assert_eq!(ctx.error.as_ref().unwrap().status, 400);
    }

    #[test]
    fn test_respond_and_skip_terminates() {
        let mut ctx = test_context();
        ctx.respond_and_skip(json!({"ok": true}));
        assert!(ctx.is_terminated());
        assert!(ctx.error.is_none());
        assert_eq!(ctx.response.as_ref().unwrap()["ok"], true);
    }
}

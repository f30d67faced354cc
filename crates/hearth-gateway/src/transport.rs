//! Session-encrypted transport middleware.
//!
//! Applied as the **outermost** layer of the REST router, so every
//! byte crosses it before any route or other layer runs: no handler
//! downstream ever sees ciphertext, and no response leaves in
//! plaintext once a session exists. The layer answers the handshake
//! endpoint itself, buffers and rewrites bodies on both sides, and
//! keeps the `content-length` header equal to the final body length.
//!
//! Framework-level middleware must not be added outside this layer:
//! it would intercept bytes before decryption and bypass the session
//! channel. That includes CORS; if a deployment ever needs it, it has
//! to be implemented inside this layer, not at the framework level.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use http::{header, request, HeaderValue, Request, Response, StatusCode};
use hearth_config::TransportConfig;
use hearth_core::ClientInfo;
use hearth_crypto::{CryptoError, HandshakeRequest, ENCRYPTION_SCHEME};
use serde_json::{json, Value};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use crate::session::SessionManager;

/// Cap for buffering response bodies (responses are not bounded by
/// the request payload limit).
const RESPONSE_BUFFER_LIMIT: usize = 64 * 1024 * 1024;

/// Header attesting the verified session to inner handlers.
///
/// Stripped from every inbound request and re-inserted only after the
/// session channel has validated, so downstream code can trust it.
pub const SESSION_ATTESTATION_HEADER: &str = "x-hearth-session";

struct TransportState {
    config: TransportConfig,
    sessions: Arc<SessionManager>,
}

impl TransportState {
    fn is_public(&self, path: &str) -> bool {
        let trimmed = path.trim_end_matches('/');
        self.config
            .public_paths
            .iter()
            .any(|public| public.trim_end_matches('/') == trimmed)
    }

    fn is_handshake(&self, path: &str) -> bool {
        path.trim_end_matches('/') == self.config.handshake_path.trim_end_matches('/')
    }
}

/// Layer installing the session transport around a router.
#[derive(Clone)]
pub struct TransportLayer {
    state: Arc<TransportState>,
}

impl TransportLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(config: TransportConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            state: Arc::new(TransportState { config, sessions }),
        }
    }
}

impl std::fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for TransportLayer {
    type Service = TransportService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TransportService {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

/// The transport service wrapping the inner router.
#[derive(Clone)]
pub struct TransportService<S> {
    inner: S,
    state: Arc<TransportState>,
}

impl<S> Service<Request<Body>> for TransportService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let state = Arc::clone(&self.state);
        // Take the ready service, leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let path = req.uri().path().to_string();

            if !state.config.enabled {
                return inner.call(req).await;
            }

            // The handshake check runs before the public-path skip:
            // the handshake path is conventionally listed as public,
            // but the middleware must answer it itself.
            if state.is_handshake(&path) {
                return Ok(handle_handshake(&state, req).await);
            }

            if state.is_public(&path) {
                return inner.call(req).await;
            }

            match handle_protected(&state, req, &mut inner, &path).await {
                Ok(response) => Ok(response),
                Err(ProtectedOutcome::Reply(response)) => Ok(response),
                Err(ProtectedOutcome::Inner(err)) => Err(err),
            }
        })
    }
}

/// Early-return carrier for the protected-path flow.
enum ProtectedOutcome<E> {
    /// The middleware produced the response itself.
    Reply(Response<Body>),
    /// The inner service failed.
    Inner(E),
}

async fn handle_protected<S>(
    state: &TransportState,
    req: Request<Body>,
    inner: &mut S,
    path: &str,
) -> Result<Response<Body>, ProtectedOutcome<S::Error>>
where
    S: Service<Request<Body>, Response = Response<Body>> + Send,
    S::Future: Send,
{
    let (mut parts, body) = req.into_parts();

    // Never trust a client-supplied attestation.
    parts.headers.remove(SESSION_ATTESTATION_HEADER);

    let body_bytes = match to_bytes(body, state.config.message.max_payload_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!(path, "Request payload exceeds limit");
            return Ok(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({"error": "payload_too_large", "detail": "request body exceeds limit"}),
            ));
        }
    };

    let parsed: Option<Value> = serde_json::from_slice(&body_bytes).ok();
    let body_client_id = parsed
        .as_ref()
        .and_then(|value| value.get("client_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let encrypted_payload = parsed.as_ref().and_then(|value| {
        if value.get("encrypted").and_then(Value::as_bool) == Some(true) {
            value.get("payload").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        }
    });

    let client_id = body_client_id.unwrap_or_else(|| derived_client_key(&parts));

    if !state.sessions.has_valid_channel(&client_id) {
        if state.config.require_encryption {
            debug!(path, client_id, "Rejecting request without a valid session");
            return Ok(session_required_response(path, &state.config.handshake_path));
        }
        // Permissive mode: forward untouched.
        let req = rebuild_request(parts, body_bytes.to_vec());
        return inner.call(req).await.map_err(ProtectedOutcome::Inner);
    }

    let forward_body = if let Some(payload) = encrypted_payload {
        match state.sessions.decrypt(&client_id, &payload) {
            Ok(plaintext) => match serde_json::to_vec(&plaintext) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(path, error = %err, "Decrypted payload failed to re-serialize");
                    return Ok(internal_error_response());
                }
            },
            Err(CryptoError::SessionExpired) => {
                return Ok(session_required_response(path, &state.config.handshake_path));
            }
            Err(err) => {
                warn!(path, client_id, error = %err, "Request decryption failed");
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    &json!({"error": "encryption_error", "detail": err.to_string()}),
                ));
            }
        }
    } else {
        // A session exists but the request came in plaintext; forward
        // as-is and still encrypt the response.
        body_bytes.to_vec()
    };

    if let Ok(value) = HeaderValue::from_str(&client_id) {
        parts.headers.insert(SESSION_ATTESTATION_HEADER, value);
    }

    let req = rebuild_request(parts, forward_body);
    let response = inner.call(req).await.map_err(ProtectedOutcome::Inner)?;

    Ok(encrypt_response(state, &client_id, response).await)
}

/// Rewrap a JSON response body as an encrypted envelope; non-JSON
/// bodies and encryption failures pass through unmodified. Either way
/// the emitted `content-length` reflects the final body.
async fn encrypt_response(
    state: &TransportState,
    client_id: &str,
    response: Response<Body>,
) -> Response<Body> {
    let (mut parts, body) = response.into_parts();

    let body_bytes = match to_bytes(body, RESPONSE_BUFFER_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "Failed to buffer response body");
            return internal_error_response();
        }
    };

    let final_body = match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(plaintext) => match state.sessions.encrypt(client_id, &plaintext) {
            Ok(payload) => {
                let envelope = json!({
                    "encrypted": true,
                    "payload": payload,
                    "encryption": ENCRYPTION_SCHEME,
                });
                serde_json::to_vec(&envelope).unwrap_or_else(|_| body_bytes.to_vec())
            }
            Err(err) => {
                warn!(client_id, error = %err, "Response encryption failed, emitting plaintext");
                body_bytes.to_vec()
            }
        },
        // Not JSON: emit unmodified.
        Err(_) => body_bytes.to_vec(),
    };

    set_content_length(&mut parts.headers, final_body.len());
    Response::from_parts(parts, Body::from(final_body))
}

async fn handle_handshake(state: &TransportState, req: Request<Body>) -> Response<Body> {
    if req.method() != http::Method::POST {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({"error": "method_not_allowed", "detail": "handshake requires POST"}),
        );
    }

    let body = match to_bytes(req.into_body(), state.config.message.max_payload_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({"error": "payload_too_large", "detail": "handshake body exceeds limit"}),
            );
        }
    };

    let invalid_format = || {
        json_response(
            StatusCode::BAD_REQUEST,
            &json!({"error": "invalid_handshake_format", "detail": "expected {handshake_request}"}),
        )
    };

    let Ok(envelope) = serde_json::from_slice::<Value>(&body) else {
        return invalid_format();
    };
    let Some(request_value) = envelope.get("handshake_request") else {
        return invalid_format();
    };
    let Ok(mut handshake) = serde_json::from_value::<HandshakeRequest>(request_value.clone())
    else {
        return invalid_format();
    };

    match state.sessions.handshake(&mut handshake) {
        Ok((client_id, response)) => {
            debug!(client_id = %client_id, "Handshake complete");
            json_response(
                StatusCode::OK,
                &json!({
                    "status": "session_established",
                    "handshake_response": response,
                }),
            )
        }
        Err(
            err @ (CryptoError::InvalidHandshake(_)
            | CryptoError::InvalidBase64(_)
            | CryptoError::InvalidLength { .. }
            | CryptoError::SignatureVerification),
        ) => {
            warn!(error = %err, "Handshake rejected");
            json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": "invalid_handshake_format", "detail": err.to_string()}),
            )
        }
        Err(err) => {
            error!(error = %err, "Handshake processing failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({"error": "handshake_processing_failed"}),
            )
        }
    }
}

/// Fallback client key when the body carries no `client_id`: hash of
/// the connection's remote address and user agent.
fn derived_client_key(parts: &request::Parts) -> String {
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.to_string());
    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    ClientInfo::new(remote_addr, user_agent, "rest").client_key()
}

fn rebuild_request(mut parts: request::Parts, body: Vec<u8>) -> Request<Body> {
    set_content_length(&mut parts.headers, body.len());
    Request::from_parts(parts, Body::from(body))
}

fn set_content_length(headers: &mut http::HeaderMap, len: usize) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}

fn session_required_response(path: &str, handshake_path: &str) -> Response<Body> {
    json_response(
        StatusCode::UNAUTHORIZED,
        &json!({
            "error": "encryption_required",
            "detail": format!("Perform handshake at {handshake_path} first"),
            "endpoint": path,
            "handshake": handshake_path,
        }),
    )
}

fn internal_error_response() -> Response<Body> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &json!({"error": "internal_error"}),
    )
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let len = bytes.len();
    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_default();
    set_content_length(response.headers_mut(), len);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use hearth_crypto::{ClientHandshake, IdentityKeyPair, SessionChannel, TransportIdentity};
    use tower::ServiceExt;

    fn sessions() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            TransportIdentity::new(IdentityKeyPair::generate(), "gateway"),
            3600,
        ))
    }

    fn app(sessions: &Arc<SessionManager>, require_encryption: bool) -> Router {
        let config = TransportConfig {
            require_encryption,
            ..TransportConfig::default()
        };

        Router::new()
            .route("/api/v1/health", get(|| async { Json(json!({"status": "healthy"})) }))
            .route(
                "/api/v1/echo",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "echo": body.get("message").cloned().unwrap_or(Value::Null),
                        "status": "success",
                    }))
                }),
            )
            .layer(TransportLayer::new(config, Arc::clone(sessions)))
    }

    async fn establish(sessions: &Arc<SessionManager>) -> (String, SessionChannel) {
        let (client, mut request) = ClientHandshake::initiate("test-client");
        let (client_id, response) = sessions.handshake(&mut request).unwrap();
        let channel = client.complete(&response, 3600).unwrap();
        (client_id, channel)
    }

    fn encrypted_request(client_id: &str, channel: &SessionChannel, payload: &Value) -> Request<Body> {
        let envelope = json!({
            "encrypted": true,
            "client_id": client_id,
            "payload": channel.encrypt_json(payload).unwrap(),
            "encryption": ENCRYPTION_SCHEME,
        });
        Request::builder()
            .method("POST")
            .uri("/api/v1/echo")
            .header("content-type", "application/json")
            .body(Body::from(envelope.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> (http::StatusCode, Option<u64>, Value) {
        let status = response.status();
        let content_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        if let Some(expected) = content_length {
            assert_eq!(expected, bytes.len() as u64, "content-length mismatch");
        }
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, content_length, value)
    }

    #[tokio::test]
    async fn test_public_path_passes_through() {
        let sessions = sessions();
        let app = app(&sessions, true);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, _, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_protected_path_without_session_is_rejected() {
        let sessions = sessions();
        let app = app(&sessions, true);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/echo")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, _, body) = body_json(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "encryption_required");
        assert_eq!(body["endpoint"], "/api/v1/echo");
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .contains("/api/v1/handshake"));
    }

    #[tokio::test]
    async fn test_handshake_roundtrip_over_http() {
        let sessions = sessions();
        let app = app(&sessions, true);

        let (client, request) = ClientHandshake::initiate("test-client");
        let body = json!({"handshake_request": request});

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/handshake")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, _, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "session_established");

        let handshake_response =
            serde_json::from_value(body["handshake_response"].clone()).unwrap();
        let channel = client.complete(&handshake_response, 3600).unwrap();
        assert!(sessions.has_valid_channel(channel.client_id()));
    }

    #[tokio::test]
    async fn test_handshake_requires_post() {
        let sessions = sessions();
        let app = app(&sessions, true);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/handshake")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // Public-path matching would otherwise swallow it; the
        // handshake check runs first.
        let (status, _, _) = body_json(response).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_400() {
        let sessions = sessions();
        let app = app(&sessions, true);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/handshake")
                    .body(Body::from(r#"{"wrong": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, _, body) = body_json(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_handshake_format");
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip() {
        let sessions = sessions();
        let app = app(&sessions, true);
        let (client_id, channel) = establish(&sessions).await;

        let response = app
            .oneshot(encrypted_request(
                &client_id,
                &channel,
                &json!({"message": "hello"}),
            ))
            .await
            .unwrap();

        let (status, content_length, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_length.is_some());
        assert_eq!(body["encrypted"], true);
        assert_eq!(body["encryption"], ENCRYPTION_SCHEME);

        // The handler saw plaintext and the reply decrypts to it.
        let decrypted = channel
            .decrypt_json(body["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(decrypted["echo"], "hello");
        assert_eq!(decrypted["status"], "success");
    }

    #[tokio::test]
    async fn test_tampered_payload_is_400_and_channel_kept() {
        let sessions = sessions();
        let app = app(&sessions, true);
        let (client_id, _) = establish(&sessions).await;

        let envelope = json!({
            "encrypted": true,
            "client_id": client_id,
            "payload": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/echo")
                    .body(Body::from(envelope.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, _, body) = body_json(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "encryption_error");

        // Decryption failure does not evict the channel.
        assert!(sessions.has_valid_channel(&client_id));
    }

    #[tokio::test]
    async fn test_plaintext_response_promoted_for_valid_session() {
        let sessions = sessions();
        let app = app(&sessions, true);
        let (client_id, channel) = establish(&sessions).await;

        // Plaintext request that still names a valid session.
        let envelope = json!({"client_id": client_id, "message": "plain"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/echo")
                    .header("content-type", "application/json")
                    .body(Body::from(envelope.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, _, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["encrypted"], true);
        let decrypted = channel
            .decrypt_json(body["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(decrypted["echo"], "plain");
    }

    #[tokio::test]
    async fn test_disabled_transport_passes_everything() {
        let sessions = sessions();
        let config = TransportConfig {
            enabled: false,
            ..TransportConfig::default()
        };
        let app = Router::new()
            .route(
                "/api/v1/echo",
                post(|Json(body): Json<Value>| async move { Json(body) }),
            )
            .layer(TransportLayer::new(config, Arc::clone(&sessions)));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/echo")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"n": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, _, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["n"], 1);
    }
}

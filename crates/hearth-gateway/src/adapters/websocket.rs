//! Bidirectional session adapter over WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use hearth_core::{ApiError, ClientInfo, Protocol, VERSION};
use hearth_config::WebSocketProtocolConfig;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{run_pipeline, AdapterDeps, ProtocolAdapter};
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::PluginPipeline;
use crate::session::AuthTokens;

struct WsShared {
    pipeline: Arc<PluginPipeline>,
    auth: Arc<AuthTokens>,
    server_name: String,
}

struct ConnectionEntry {
    sender: mpsc::Sender<Message>,
    last_heartbeat: Arc<StdMutex<Instant>>,
    authenticated: Arc<AtomicBool>,
    token: Arc<StdMutex<Option<String>>>,
}

/// Long-lived connection adapter.
///
/// One connection's messages are handled strictly in arrival order by
/// its read loop; different connections run on independent tasks.
pub struct WebSocketAdapter {
    config: WebSocketProtocolConfig,
    shared: OnceLock<Arc<WsShared>>,
    connections: Arc<DashMap<String, ConnectionEntry>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebSocketAdapter {
    /// Create the adapter from its config subtree.
    #[must_use]
    pub fn new(config: WebSocketProtocolConfig) -> Self {
        Self {
            config,
            shared: OnceLock::new(),
            connections: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl ProtocolAdapter for WebSocketAdapter {
    fn protocol_name(&self) -> &'static str {
        "websocket"
    }

    async fn initialize(&self, deps: &AdapterDeps) -> GatewayResult<()> {
        let _ = self.shared.set(Arc::new(WsShared {
            pipeline: Arc::clone(&deps.pipeline),
            auth: Arc::clone(&deps.services.auth),
            server_name: deps.services.config.gateway.name.clone(),
        }));
        Ok(())
    }

    async fn start(&self) -> GatewayResult<()> {
        let shared = self
            .shared
            .get()
            .cloned()
            .ok_or_else(|| GatewayError::AdapterStartFailed {
                adapter: "websocket".to_string(),
                reason: "adapter not initialized".to_string(),
            })?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|err| {
            GatewayError::AdapterStartFailed {
                adapter: "websocket".to_string(),
                reason: format!("failed to bind {addr}: {err}"),
            }
        })?;

        info!(%addr, "WebSocket adapter listening");

        let mut tasks = self.tasks.lock().await;

        // Accept loop.
        let accept_shared = Arc::clone(&shared);
        let connections = Arc::clone(&self.connections);
        let max_connections = self.config.max_connections;
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };

                        if connections.len() >= max_connections {
                            warn!(%peer, "Connection limit reached, refusing");
                            tokio::spawn(refuse_busy(stream));
                            continue;
                        }

                        let shared = Arc::clone(&accept_shared);
                        let connections = Arc::clone(&connections);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer.to_string(), shared, connections, shutdown)
                                .await;
                        });
                    }
                }
            }
        }));

        // Heartbeat sweeper.
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let connections = Arc::clone(&self.connections);
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(interval) => {
                        sweep_heartbeats(&connections, interval).await;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn stop(&self) {
        // Tell every client we are going away before the loops die.
        // Senders are collected first so no map guard is held across
        // the sends.
        let senders: Vec<mpsc::Sender<Message>> = self
            .connections
            .iter()
            .map(|entry| entry.sender.clone())
            .collect();
        for sender in senders {
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutdown".into(),
                })))
                .await;
        }

        self.shutdown.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        self.connections.clear();
    }

    async fn handle_request(&self, payload: Value, client: ClientInfo) -> Result<Value, ApiError> {
        let shared = self
            .shared
            .get()
            .ok_or_else(|| ApiError::internal("adapter not initialized"))?;
        run_pipeline(&shared.pipeline, Protocol::WebSocket, payload, client).await
    }

    async fn health_check(&self) -> Value {
        json!({
            "protocol": "websocket",
            "bind": format!("{}:{}", self.config.host, self.config.port),
            "connections": self.connections.len(),
            "max_connections": self.config.max_connections,
        })
    }
}

impl std::fmt::Debug for WebSocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketAdapter")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

/// Complete the upgrade just enough to send a busy close code.
async fn refuse_busy(stream: TcpStream) {
    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Again,
                reason: "server busy".into(),
            }))
            .await;
    }
}

async fn sweep_heartbeats(
    connections: &DashMap<String, ConnectionEntry>,
    interval: Duration,
) {
    let deadline = interval * 3;
    let mut stale = Vec::new();

    for entry in connections.iter() {
        let last = *entry.last_heartbeat.lock().expect("heartbeat lock");
        if last.elapsed() > deadline {
            stale.push(entry.key().clone());
        }
    }

    for client_id in stale {
        if let Some((_, entry)) = connections.remove(&client_id) {
            warn!(client_id, "Closing connection after heartbeat timeout");
            let _ = entry
                .sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "heartbeat timeout".into(),
                })))
                .await;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_id: String,
    shared: Arc<WsShared>,
    connections: Arc<DashMap<String, ConnectionEntry>>,
    shutdown: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            debug!(client_id, %error, "WebSocket upgrade failed");
            return;
        }
    };

    info!(client_id, "WebSocket connection established");

    let (mut write, mut read) = ws.split();
    let (sender, mut outbound) = mpsc::channel::<Message>(64);

    let entry = ConnectionEntry {
        sender: sender.clone(),
        last_heartbeat: Arc::new(StdMutex::new(Instant::now())),
        authenticated: Arc::new(AtomicBool::new(false)),
        token: Arc::new(StdMutex::new(None)),
    };
    let last_heartbeat = Arc::clone(&entry.last_heartbeat);
    let authenticated = Arc::clone(&entry.authenticated);
    let token_slot = Arc::clone(&entry.token);
    connections.insert(client_id.clone(), entry);

    // Writer task: the single owner of the sink.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let welcome = json!({
        "type": "welcome",
        "client_id": client_id,
        "server": shared.server_name,
        "version": VERSION,
    });
    let _ = sender.send(Message::Text(welcome.to_string())).await;

    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = read.next() => message,
        };

        let Some(Ok(message)) = message else { break };

        match message {
            Message::Text(text) => {
                handle_frame(
                    &text,
                    &client_id,
                    &shared,
                    &sender,
                    &last_heartbeat,
                    &authenticated,
                    &token_slot,
                )
                .await;
            }
            Message::Close(_) => break,
            // Ping/pong are handled by the protocol layer.
            _ => {}
        }
    }

    connections.remove(&client_id);
    writer.abort();
    info!(client_id, "WebSocket connection closed");
}

async fn send_json(sender: &mpsc::Sender<Message>, value: &Value) {
    let _ = sender.send(Message::Text(value.to_string())).await;
}

async fn send_error(sender: &mpsc::Sender<Message>, error: &str, detail: Option<String>) {
    send_json(
        sender,
        &json!({"type": "error", "error": error, "detail": detail}),
    )
    .await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    text: &str,
    client_id: &str,
    shared: &Arc<WsShared>,
    sender: &mpsc::Sender<Message>,
    last_heartbeat: &Arc<StdMutex<Instant>>,
    authenticated: &Arc<AtomicBool>,
    token_slot: &Arc<StdMutex<Option<String>>>,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        send_error(sender, "invalid_json", None).await;
        return;
    };

    let Some(frame_type) = frame.get("type").and_then(Value::as_str) else {
        send_error(sender, "missing_type", Some("frames require a 'type' field".into())).await;
        return;
    };

    match frame_type {
        "auth" => {
            handle_auth(&frame, shared, sender, authenticated, token_slot).await;
        }
        "heartbeat" => {
            *last_heartbeat.lock().expect("heartbeat lock") = Instant::now();
            send_json(
                sender,
                &json!({
                    "type": "heartbeat_ack",
                    "timestamp": chrono::Utc::now().timestamp(),
                }),
            )
            .await;
        }
        kind => {
            // Everything else is a typed message for the pipeline.
            let token = token_slot.lock().expect("token lock").clone();
            let payload = json!({
                "kind": kind,
                "payload": frame
                    .get("payload")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                "token": frame
                    .get("token")
                    .cloned()
                    .unwrap_or_else(|| token.map_or(Value::Null, Value::String)),
            });

            let client = ClientInfo::new(client_id, "websocket-client", "websocket");
            match run_pipeline(&shared.pipeline, Protocol::WebSocket, payload, client).await {
                Ok(response) => {
                    send_json(sender, &json!({"type": "response", "payload": response})).await;
                }
                Err(error) => {
                    send_error(sender, error.kind.as_str(), Some(error.detail)).await;
                }
            }
        }
    }
}

async fn handle_auth(
    frame: &Value,
    shared: &Arc<WsShared>,
    sender: &mpsc::Sender<Message>,
    authenticated: &Arc<AtomicBool>,
    token_slot: &Arc<StdMutex<Option<String>>>,
) {
    // Either an existing token is presented for validation, or the
    // local user is signed in fresh. User management proper lives
    // behind the bus; the gateway only issues session tokens.
    let (token, principal) = match frame.get("token").and_then(Value::as_str) {
        Some(presented) => match shared.auth.validate(presented) {
            Ok(principal) => (presented.to_string(), principal),
            Err(error) => {
                send_error(sender, error.kind.as_str(), Some(error.detail)).await;
                return;
            }
        },
        None => {
            let user_id = Uuid::new_v4();
            let roles = vec!["user".to_string()];
            let token = shared.auth.issue(user_id, &roles);
            (
                token,
                hearth_core::Principal {
                    user_id,
                    roles,
                    auth_method: "session_token".into(),
                },
            )
        }
    };

    authenticated.store(true, Ordering::SeqCst);
    *token_slot.lock().expect("token lock") = Some(token.clone());

    send_json(
        sender,
        &json!({
            "type": "auth_success",
            "session_id": Uuid::new_v4().to_string(),
            "user_id": principal.user_id.to_string(),
            "token": token,
        }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins;
    use hearth_config::HearthConfig;

    async fn started_adapter(port: u16) -> (Arc<WebSocketAdapter>, AdapterDeps) {
        let auth = Arc::new(crate::session::AuthTokens::new(3600));
        let services = crate::core::test_support::shared_services(auth).await;
        let scheduler = crate::core::test_support::scheduler(&services).await;

        // Full plugin stack so typed messages traverse the pipeline.
        let mut config = HearthConfig::default();
        for name in ["message_bus", "security", "rate_limiting", "validation", "routing"] {
            config.plugins.insert(
                name.to_string(),
                hearth_config::PluginConfig {
                    enabled: true,
                    settings: Default::default(),
                },
            );
        }
        let pipeline = plugins::build_pipeline(&config).unwrap();
        pipeline.initialize_all(&services).await.unwrap();

        let deps = AdapterDeps {
            services,
            pipeline: Arc::new(pipeline),
            scheduler,
        };

        let adapter = Arc::new(WebSocketAdapter::new(WebSocketProtocolConfig {
            enabled: true,
            host: "127.0.0.1".into(),
            port,
            heartbeat_interval_secs: 30,
            max_connections: 4,
        }));
        adapter.initialize(&deps).await.unwrap();
        adapter.start().await.unwrap();
        (adapter, deps)
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    async fn connect(
        port: u16,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        ws
    }

    async fn next_json(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("frame timeout")
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_welcome_heartbeat_and_auth() {
        let port = free_port();
        let (adapter, _deps) = started_adapter(port).await;

        let mut ws = connect(port).await;

        let welcome = next_json(&mut ws).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["version"], VERSION);

        ws.send(Message::Text(json!({"type": "heartbeat"}).to_string()))
            .await
            .unwrap();
        let ack = next_json(&mut ws).await;
        assert_eq!(ack["type"], "heartbeat_ack");

        ws.send(Message::Text(json!({"type": "auth"}).to_string()))
            .await
            .unwrap();
        let auth = next_json(&mut ws).await;
        assert_eq!(auth["type"], "auth_success");
        assert!(auth["token"].is_string());

        assert_eq!(adapter.connection_count(), 1);
        adapter.stop().await;
        assert_eq!(adapter.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_frame_without_type_is_error() {
        let port = free_port();
        let (adapter, _deps) = started_adapter(port).await;

        let mut ws = connect(port).await;
        let _ = next_json(&mut ws).await; // welcome

        ws.send(Message::Text(json!({"payload": {}}).to_string()))
            .await
            .unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["error"], "missing_type");

        // Malformed JSON does not kill the connection either.
        ws.send(Message::Text("{not json".into())).await.unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["error"], "invalid_json");

        ws.send(Message::Text(json!({"type": "heartbeat"}).to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "heartbeat_ack");

        adapter.stop().await;
    }

    #[tokio::test]
    async fn test_typed_message_through_pipeline() {
        let port = free_port();
        let (adapter, deps) = started_adapter(port).await;

        // Echo responder on the bus.
        let bus = deps.services.bus.clone();
        let mut requests = bus.subscribe("gateway.request.echo.request");
        let responder_bus = bus.clone();
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                let reply = message.envelope.reply(
                    "echo.response",
                    json!({"echo": message.envelope.payload["message"].clone()}),
                    "echo-service",
                );
                responder_bus.publish("gateway.reply.echo.request", reply);
            }
        });

        let mut ws = connect(port).await;
        let _ = next_json(&mut ws).await; // welcome

        // Authenticate, then send a typed message.
        ws.send(Message::Text(json!({"type": "auth"}).to_string()))
            .await
            .unwrap();
        let _ = next_json(&mut ws).await;

        ws.send(Message::Text(
            json!({"type": "echo.request", "payload": {"message": "hi"}}).to_string(),
        ))
        .await
        .unwrap();

        let response = next_json(&mut ws).await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["payload"]["echo"], "hi");

        adapter.stop().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_typed_message_is_rejected() {
        let port = free_port();
        let (adapter, _deps) = started_adapter(port).await;

        let mut ws = connect(port).await;
        let _ = next_json(&mut ws).await; // welcome

        ws.send(Message::Text(
            json!({"type": "echo.request", "payload": {}}).to_string(),
        ))
        .await
        .unwrap();

        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["error"], "missing_credential");

        adapter.stop().await;
    }
}

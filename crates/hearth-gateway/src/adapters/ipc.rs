//! Local IPC adapter.
//!
//! Strict request/reply over newline-delimited JSON frames. The
//! primary transport is a Unix domain socket; when that cannot bind
//! (or the platform has no Unix sockets) the adapter falls back to
//! loopback TCP with a logged warning. On Windows the primary would be
//! a named pipe at the configured path; this build takes the TCP
//! fallback there.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use hearth_config::IpcProtocolConfig;
use hearth_core::{ApiError, ClientInfo, Protocol};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{run_pipeline, AdapterDeps, ProtocolAdapter};
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::PluginPipeline;

/// Which transport the adapter ended up binding.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BoundTransport {
    Unix(PathBuf),
    Tcp(String),
}

/// The local IPC adapter.
pub struct IpcAdapter {
    config: IpcProtocolConfig,
    pipeline: OnceLock<Arc<PluginPipeline>>,
    bound: Mutex<Option<BoundTransport>>,
    shutdown: CancellationToken,
    accept_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IpcAdapter {
    /// Create the adapter from its config subtree.
    #[must_use]
    pub fn new(config: IpcProtocolConfig) -> Self {
        Self {
            config,
            pipeline: OnceLock::new(),
            bound: Mutex::new(None),
            shutdown: CancellationToken::new(),
            accept_handle: Mutex::new(None),
        }
    }

    /// Try to bind the primary Unix socket, removing a stale socket
    /// file first.
    #[cfg(unix)]
    fn bind_unix(&self) -> std::io::Result<tokio::net::UnixListener> {
        let path = PathBuf::from(&self.config.socket_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(&path)?;
        }
        tokio::net::UnixListener::bind(&path)
    }
}

#[async_trait]
impl ProtocolAdapter for IpcAdapter {
    fn protocol_name(&self) -> &'static str {
        "ipc"
    }

    async fn initialize(&self, deps: &AdapterDeps) -> GatewayResult<()> {
        let _ = self.pipeline.set(Arc::clone(&deps.pipeline));
        Ok(())
    }

    async fn start(&self) -> GatewayResult<()> {
        let pipeline = self
            .pipeline
            .get()
            .cloned()
            .ok_or_else(|| GatewayError::AdapterStartFailed {
                adapter: "ipc".to_string(),
                reason: "adapter not initialized".to_string(),
            })?;

        #[cfg(unix)]
        {
            match self.bind_unix() {
                Ok(listener) => {
                    let path = PathBuf::from(&self.config.socket_path);
                    info!(path = %path.display(), "IPC adapter listening on Unix socket");
                    *self.bound.lock().await = Some(BoundTransport::Unix(path));

                    let shutdown = self.shutdown.clone();
                    let handle = tokio::spawn(async move {
                        unix_accept_loop(listener, pipeline, shutdown).await;
                    });
                    *self.accept_handle.lock().await = Some(handle);
                    return Ok(());
                }
                Err(error) => {
                    warn!(
                        path = %self.config.socket_path,
                        %error,
                        "Unix socket bind failed, falling back to loopback TCP"
                    );
                }
            }
        }

        let addr = format!("{}:{}", self.config.fallback_host, self.config.fallback_port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|err| {
            GatewayError::AdapterStartFailed {
                adapter: "ipc".to_string(),
                reason: format!("failed to bind fallback {addr}: {err}"),
            }
        })?;

        info!(%addr, "IPC adapter listening on loopback TCP");
        *self.bound.lock().await = Some(BoundTransport::Tcp(addr));

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tcp_accept_loop(listener, pipeline, shutdown).await;
        });
        *self.accept_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.accept_handle.lock().await.take() {
            let _ = handle.await;
        }

        if let Some(BoundTransport::Unix(path)) = self.bound.lock().await.take() {
            if let Err(error) = std::fs::remove_file(&path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %error, "Failed to remove socket file");
                }
            }
        }
    }

    async fn handle_request(&self, payload: Value, client: ClientInfo) -> Result<Value, ApiError> {
        let pipeline = self
            .pipeline
            .get()
            .ok_or_else(|| ApiError::internal("adapter not initialized"))?;
        run_pipeline(pipeline, Protocol::Ipc, payload, client).await
    }

    async fn health_check(&self) -> Value {
        let bound = match &*self.bound.lock().await {
            Some(BoundTransport::Unix(path)) => json!({"unix": path.display().to_string()}),
            Some(BoundTransport::Tcp(addr)) => json!({"tcp": addr}),
            None => Value::Null,
        };
        json!({"protocol": "ipc", "bound": bound})
    }
}

impl std::fmt::Debug for IpcAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcAdapter")
            .field("socket_path", &self.config.socket_path)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
async fn unix_accept_loop(
    listener: tokio::net::UnixListener,
    pipeline: Arc<PluginPipeline>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let pipeline = Arc::clone(&pipeline);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    serve_connection(stream, "unix-peer", pipeline, shutdown).await;
                });
            }
        }
    }
}

async fn tcp_accept_loop(
    listener: tokio::net::TcpListener,
    pipeline: Arc<PluginPipeline>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let pipeline = Arc::clone(&pipeline);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    serve_connection(stream, &peer.to_string(), pipeline, shutdown).await;
                });
            }
        }
    }
}

/// REP-style loop: one request line in, one response line out, in
/// strict alternation. Malformed JSON yields an error reply without
/// closing the connection.
async fn serve_connection<S>(
    stream: S,
    peer: &str,
    pipeline: Arc<PluginPipeline>,
    shutdown: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            _ => return,
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(request) => {
                let client = ClientInfo::new(peer, "ipc-client", "ipc");
                match run_pipeline(&pipeline, Protocol::Ipc, request, client).await {
                    Ok(response) => json!({"success": true, "payload": response}),
                    Err(error) => json!({
                        "success": false,
                        "error": error.kind.as_str(),
                        "detail": error.detail,
                    }),
                }
            }
            Err(error) => {
                debug!(peer, %error, "Malformed IPC frame");
                json!({"success": false, "error": "decode_failure", "detail": error.to_string()})
            }
        };

        let mut frame = reply.to_string();
        frame.push('\n');
        if writer.write_all(frame.as_bytes()).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins;
    use hearth_config::HearthConfig;

    async fn adapter_on_unix(dir: &std::path::Path) -> (Arc<IpcAdapter>, AdapterDeps) {
        let auth = Arc::new(crate::session::AuthTokens::new(3600));
        let services = crate::core::test_support::shared_services(auth).await;
        let scheduler = crate::core::test_support::scheduler(&services).await;

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

        let adapter = Arc::new(IpcAdapter::new(IpcProtocolConfig {
            enabled: true,
            socket_path: dir.join("hearth-test.sock").display().to_string(),
            fallback_host: "127.0.0.1".into(),
            fallback_port: 0,
        }));
        adapter.initialize(&deps).await.unwrap();
        adapter.start().await.unwrap();
        (adapter, deps)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_reply_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, deps) = adapter_on_unix(dir.path()).await;
        let socket_path = dir.path().join("hearth-test.sock");
        assert!(socket_path.exists());

        // Echo responder plus a token for the security plugin.
        let bus = deps.services.bus.clone();
        let mut requests = bus.subscribe("gateway.request.echo.request");
        let responder_bus = bus.clone();
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                let reply = message.envelope.reply(
                    "echo.response",
                    json!({"echo": "ipc"}),
                    "echo-service",
                );
                responder_bus.publish("gateway.reply.echo.request", reply);
            }
        });
        let token = deps.services.auth.issue(uuid::Uuid::new_v4(), &["user".into()]);

        let stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        // Malformed frame yields an error without closing the socket.
        writer.write_all(b"not json\n").await.unwrap();
        let reply: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "decode_failure");

        // A well-formed request then succeeds on the same connection.
        let request = json!({
            "kind": "echo.request",
            "payload": {"message": "hi"},
            "token": token,
        });
        writer
            .write_all(format!("{request}\n").as_bytes())
            .await
            .unwrap();
        let reply: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["success"], true);
        assert_eq!(reply["payload"]["echo"], "ipc");

        // Stop removes the socket file.
        adapter.stop().await;
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_fallback_to_tcp_when_unix_unavailable() {
        let auth = Arc::new(crate::session::AuthTokens::new(3600));
        let services = crate::core::test_support::shared_services(auth).await;
        let scheduler = crate::core::test_support::scheduler(&services).await;
        let deps = AdapterDeps {
            services,
            pipeline: Arc::new(PluginPipeline::new()),
            scheduler,
        };

        // A socket path whose parent cannot be created forces the
        // fallback.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let adapter = IpcAdapter::new(IpcProtocolConfig {
            enabled: true,
            socket_path: "/dev/null/impossible/hearth.sock".into(),
            fallback_host: "127.0.0.1".into(),
            fallback_port: port,
        });
        adapter.initialize(&deps).await.unwrap();
        adapter.start().await.unwrap();

        let health = adapter.health_check().await;
        assert!(health["bound"]["tcp"].is_string());

        adapter.stop().await;
    }
}

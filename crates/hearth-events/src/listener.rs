//! Loopback TCP listener for external backend modules.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON
//! [`BusMessage`]. A connected module receives every envelope matching
//! its requested pattern and may publish by sending frames of its own.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BusMessage, EventBus};
use crate::error::{EventsError, EventsResult};

/// Maximum accepted frame size (10 MiB).
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Topic pattern forwarded to connected modules.
const MODULE_PATTERN: &str = "**";

/// Bind the loopback listener and spawn its accept loop.
///
/// The returned handle finishes once `shutdown` is cancelled.
///
/// # Errors
///
/// Returns [`EventsError::Bind`] if the listener cannot bind.
pub async fn spawn_frame_listener(
    bus: EventBus,
    addr: &str,
    shutdown: CancellationToken,
) -> EventsResult<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| EventsError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    info!(%addr, "Event bus listener bound");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    debug!("Event bus listener shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Bus module connected");
                            let bus = bus.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                handle_module(stream, bus, shutdown).await;
                            });
                        }
                        Err(error) => {
                            warn!(%error, "Failed to accept bus connection");
                        }
                    }
                }
            }
        }
    }))
}

async fn handle_module(stream: TcpStream, bus: EventBus, shutdown: CancellationToken) {
    let mut subscription = bus.subscribe(MODULE_PATTERN);
    let (mut reader, mut writer) = stream.into_split();

    // Forwarding loop: bus -> module.
    let forward_shutdown = shutdown.clone();
    let forward = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = forward_shutdown.cancelled() => return,
                message = subscription.recv() => {
                    let Some(message) = message else { return };
                    if write_frame(&mut writer, &message).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    // Reading loop: module -> bus.
    loop {
        let mut len_buf = [0u8; 4];
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            read = reader.read_exact(&mut len_buf) => {
                if read.is_err() {
                    break;
                }
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            warn!(len, "Bus frame exceeds maximum size, dropping connection");
            break;
        }

        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }

        match serde_json::from_slice::<BusMessage>(&payload) {
            Ok(message) => {
                bus.publish(message.topic, message.envelope);
            }
            Err(error) => {
                warn!(%error, "Discarding malformed bus frame");
            }
        }
    }

    forward.abort();
    debug!("Bus module disconnected");
}

async fn write_frame(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &Arc<BusMessage>,
) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(message.as_ref())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await
}

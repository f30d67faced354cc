//! In-process broker core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use hearth_core::MessageEnvelope;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{EventsError, EventsResult};
use crate::topic::topic_matches;

/// Default per-subscriber channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A published envelope together with its topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the envelope was published on.
    pub topic: String,
    /// The envelope itself.
    pub envelope: MessageEnvelope,
}

/// Handler invoked for every published envelope when persistence is
/// enabled. Failures are logged and never fail the publish.
pub type PersistenceHandler =
    Arc<dyn Fn(BusMessage) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct Subscriber {
    pattern: String,
    sender: mpsc::Sender<Arc<BusMessage>>,
}

struct BusInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    capacity: usize,
    persistence: std::sync::RwLock<Option<PersistenceHandler>>,
}

/// The embedded publish/subscribe broker.
///
/// Cheap to clone; all clones share the same subscriber registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with the given per-subscriber channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                persistence: std::sync::RwLock::new(None),
            }),
        }
    }

    /// Install the persistence handler. Replaces any previous handler.
    pub fn enable_persistence(&self, handler: PersistenceHandler) {
        if let Ok(mut slot) = self.inner.persistence.write() {
            *slot = Some(handler);
        }
    }

    /// Publish an envelope on a topic.
    ///
    /// Returns the number of subscribers the message was delivered to.
    /// Subscribers whose channels are full lose the message (logged);
    /// subscribers whose receivers are gone are pruned.
    pub fn publish(&self, topic: impl Into<String>, envelope: MessageEnvelope) -> usize {
        let message = Arc::new(BusMessage {
            topic: topic.into(),
            envelope,
        });

        trace!(topic = %message.topic, kind = %message.envelope.kind, "Publishing envelope");

        if let Some(handler) = self
            .inner
            .persistence
            .read()
            .ok()
            .and_then(|slot| slot.clone())
        {
            let for_archive = (*message).clone();
            tokio::spawn(async move {
                if let Err(error) = handler(for_archive).await {
                    warn!(%error, "Event persistence failed");
                }
            });
        }

        let mut delivered = 0usize;
        let mut dead = Vec::new();

        for entry in self.inner.subscribers.iter() {
            if !topic_matches(&entry.pattern, &message.topic) {
                continue;
            }
            match entry.sender.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber = *entry.key(),
                        topic = %message.topic,
                        "Subscriber channel full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }

        for id in dead {
            self.inner.subscribers.remove(&id);
            debug!(subscriber = id, "Pruned closed subscriber");
        }

        delivered
    }

    /// Subscribe to every topic matching a pattern.
    #[must_use]
    pub fn subscribe(&self, pattern: impl Into<String>) -> EventStream {
        let pattern = pattern.into();
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.subscribers.insert(
            id,
            Subscriber {
                pattern: pattern.clone(),
                sender,
            },
        );

        debug!(subscriber = id, %pattern, "Subscriber registered");
        EventStream { receiver }
    }

    /// Publish a request and await the correlated reply.
    ///
    /// Subscribes to `reply_pattern` before publishing so the reply
    /// cannot be lost to a race, then waits up to `timeout` for an
    /// envelope whose `correlation_id` equals the request's message id.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::ReplyTimeout`] when nothing correlated
    /// arrives in time and [`EventsError::ReplyStreamClosed`] if the
    /// bus shuts down mid-wait.
    pub async fn request(
        &self,
        topic: impl Into<String>,
        envelope: MessageEnvelope,
        reply_pattern: &str,
        timeout: Duration,
    ) -> EventsResult<MessageEnvelope> {
        let topic = topic.into();
        let correlation = envelope.metadata.message_id;
        let mut replies = self.subscribe(reply_pattern);

        self.publish(topic.clone(), envelope);

        let wait = async {
            while let Some(message) = replies.recv().await {
                if message.envelope.metadata.correlation_id == Some(correlation) {
                    return Some(message.envelope.clone());
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => Err(EventsError::ReplyStreamClosed),
            Err(_) => Err(EventsError::ReplyTimeout(topic)),
        }
    }

    /// Register a backend module and hand it a scoped client.
    ///
    /// The returned client can only publish on topics matching one of
    /// `allowed_topics` (patterns are allowed, e.g. `logs.**`).
    #[must_use]
    pub fn register_module(
        &self,
        name: impl Into<String>,
        allowed_topics: Vec<String>,
    ) -> ModuleClient {
        let name = name.into();
        debug!(module = %name, topics = ?allowed_topics, "Module registered on bus");
        ModuleClient {
            name,
            allowed_topics,
            bus: self.clone(),
        }
    }

    /// Current number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// Receiver for messages matching one subscription.
pub struct EventStream {
    receiver: mpsc::Receiver<Arc<BusMessage>>,
}

impl EventStream {
    /// Receive the next matching message.
    ///
    /// Returns `None` once the bus side of the channel is gone.
    pub async fn recv(&mut self) -> Option<Arc<BusMessage>> {
        self.receiver.recv().await
    }

    /// Receive without blocking.
    pub fn try_recv(&mut self) -> Option<Arc<BusMessage>> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// A bus client scoped to a module's topic allow-list.
#[derive(Clone)]
pub struct ModuleClient {
    name: String,
    allowed_topics: Vec<String>,
    bus: EventBus,
}

impl ModuleClient {
    /// The module name this client was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish on a topic within the module's allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::TopicNotPermitted`] for topics outside
    /// the allow-list.
    pub fn publish(&self, topic: &str, envelope: MessageEnvelope) -> EventsResult<usize> {
        let permitted = self
            .allowed_topics
            .iter()
            .any(|pattern| topic_matches(pattern, topic));

        if !permitted {
            return Err(EventsError::TopicNotPermitted {
                module: self.name.clone(),
                topic: topic.to_string(),
            });
        }

        Ok(self.bus.publish(topic, envelope))
    }

    /// Subscribe to a pattern. Subscriptions are not restricted by the
    /// allow-list; only publishing is.
    #[must_use]
    pub fn subscribe(&self, pattern: impl Into<String>) -> EventStream {
        self.bus.subscribe(pattern)
    }
}

impl std::fmt::Debug for ModuleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleClient")
            .field("name", &self.name)
            .field("allowed_topics", &self.allowed_topics)
            .finish()
    }
}

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::traits::{EventSink, PushConnection, PushTransport};
use crate::types::{Message, SubscriptionId, TopicKey, TransportEvent, DEFAULT_EVENT_TYPE};

/// Consumer callback invoked once per message on a subscribed topic
pub type Handler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// One live topic: its connection and everyone sharing it
struct TopicEntry {
    connection: Box<dyn PushConnection>,
    listeners: Vec<(SubscriptionId, Handler)>,
    ref_count: usize,
    /// Distinguishes this connection from earlier ones opened for the same key
    generation: u64,
    closed: Arc<AtomicBool>,
}

struct Shared {
    transport: Arc<dyn PushTransport>,
    event_types: Vec<String>,
    topics: RwLock<HashMap<TopicKey, TopicEntry>>,
    /// Serializes subscribe/unsubscribe so a key never gets two connections.
    /// Never taken on the delivery path.
    lifecycle: Mutex<()>,
    next_subscription: AtomicU64,
    next_generation: AtomicU64,
}

/// Shares one push connection per topic key among any number of subscribers
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    shared: Arc<Shared>,
}

impl ConnectionMultiplexer {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self::with_event_types(transport, vec![DEFAULT_EVENT_TYPE.to_string()])
    }

    /// Create a multiplexer that routes the given server event types
    pub fn with_event_types(transport: Arc<dyn PushTransport>, event_types: Vec<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                event_types,
                topics: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(()),
                next_subscription: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe a closure to a topic
    ///
    /// The first subscriber for a key opens the connection; the returned
    /// [`Subscription`] releases the handler when unsubscribed or dropped.
    pub fn subscribe<F>(&self, key: impl Into<TopicKey>, handler: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(key, Arc::new(handler))
    }

    /// Subscribe an already shared handler to a topic
    pub fn subscribe_handler(&self, key: impl Into<TopicKey>, handler: Handler) -> Subscription {
        let key = key.into();
        let id = self.shared.next_subscription.fetch_add(1, Ordering::SeqCst);
        let _lifecycle = self.shared.lifecycle.lock();

        if let Some(entry) = self.shared.topics.write().get_mut(&key) {
            entry.listeners.push((id, handler));
            entry.ref_count += 1;
            debug!(
                "Subscription {} joined topic {} (refs={})",
                id, key, entry.ref_count
            );
            return Subscription::new(&self.shared, key, id);
        }

        // The table lock is not held across `open` so a transport may report
        // events synchronously; they are dropped until the entry exists.
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        let sink = upstream_sink(
            Arc::downgrade(&self.shared),
            key.clone(),
            generation,
            closed.clone(),
        );

        info!("Opening push connection for topic {}", key);
        let connection = self.shared.transport.open(&key, sink);

        self.shared.topics.write().insert(
            key.clone(),
            TopicEntry {
                connection,
                listeners: vec![(id, handler)],
                ref_count: 1,
                generation,
                closed,
            },
        );
        debug!("Subscription {} opened topic {} (refs=1)", id, key);

        Subscription::new(&self.shared, key, id)
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.shared.topics.read().len()
    }

    /// Active subscriptions for a topic (0 when no connection exists)
    pub fn ref_count(&self, key: &str) -> usize {
        self.shared
            .topics
            .read()
            .get(key)
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    /// Check whether a connection is open for a topic
    pub fn is_open(&self, key: &str) -> bool {
        self.shared.topics.read().contains_key(key)
    }

    /// All topics with an open connection
    pub fn topics(&self) -> Vec<TopicKey> {
        let mut keys: Vec<TopicKey> = self.shared.topics.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Shared {
    /// Remove one subscription; closes the connection when it was the last
    fn release(&self, key: &str, id: SubscriptionId) -> bool {
        let _lifecycle = self.lifecycle.lock();

        let mut entry = {
            let mut topics = self.topics.write();
            let Some(entry) = topics.get_mut(key) else {
                return false;
            };
            let Some(position) = entry.listeners.iter().position(|(sid, _)| *sid == id) else {
                return false;
            };
            entry.listeners.remove(position);
            entry.ref_count = entry.ref_count.saturating_sub(1);

            if entry.ref_count > 0 {
                debug!(
                    "Subscription {} left topic {} (refs={})",
                    id, key, entry.ref_count
                );
                return true;
            }

            match topics.remove(key) {
                Some(entry) => entry,
                None => return true,
            }
        };

        entry.closed.store(true, Ordering::SeqCst);
        entry.connection.close();
        info!("Closed push connection for topic {} (last subscriber left)", key);
        true
    }

    /// Fan a message out to a snapshot of the topic's listeners
    fn deliver(&self, key: &str, generation: u64, message: &Message) -> usize {
        let listeners: Vec<(SubscriptionId, Handler)> = {
            let topics = self.topics.read();
            match topics.get(key) {
                Some(entry) if entry.generation == generation => entry.listeners.clone(),
                _ => return 0,
            }
        };

        for (id, handler) in &listeners {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "Handler for subscription {} on topic {} failed: {:#}",
                        id, key, e
                    );
                }
                Err(panic) => {
                    error!(
                        "Handler for subscription {} on topic {} panicked: {}",
                        id,
                        key,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        listeners.len()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for (key, mut entry) in self.topics.get_mut().drain() {
            entry.closed.store(true, Ordering::SeqCst);
            entry.connection.close();
            debug!("Closed push connection for topic {} on shutdown", key);
        }
    }
}

/// The single upstream listener registered on a connection
fn upstream_sink(
    shared: Weak<Shared>,
    key: TopicKey,
    generation: u64,
    closed: Arc<AtomicBool>,
) -> EventSink {
    Arc::new(move |event| {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };

        match event {
            TransportEvent::Open => {
                debug!("Push connection for topic {} is open", key);
            }
            TransportEvent::Error(reason) => {
                warn!(
                    "Push connection error on topic {}: {} (left to the transport to recover)",
                    key, reason
                );
            }
            TransportEvent::Event { event_type, data, .. } => {
                if !shared.event_types.iter().any(|t| *t == event_type) {
                    debug!("Ignoring '{}' event on topic {}", event_type, key);
                    return;
                }
                match serde_json::from_str::<Message>(&data) {
                    Ok(message) => {
                        shared.deliver(&key, generation, &message);
                    }
                    Err(e) => {
                        warn!("Dropping malformed message on topic {}: {}", key, e);
                    }
                }
            }
        }
    })
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Disposer returned by [`ConnectionMultiplexer::subscribe`]
///
/// Dropping it unsubscribes; calling [`Subscription::unsubscribe`] more than
/// once has no further effect.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    shared: Weak<Shared>,
    key: TopicKey,
    id: SubscriptionId,
    active: bool,
}

impl Subscription {
    fn new(shared: &Arc<Shared>, key: TopicKey, id: SubscriptionId) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            key,
            id,
            active: true,
        }
    }

    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(shared) = self.shared.upgrade() {
            shared.release(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

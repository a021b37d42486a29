//! Topic-keyed publish/subscribe.
//!
//! [`TopicBus`] fans a value out to every sink registered under a topic at
//! the moment of publishing. Sinks are [`tokio::sync::mpsc`] unbounded
//! senders, so publishing never waits on a slow subscriber and can run
//! under the table's read lock. Nothing is buffered for topics without
//! subscribers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Delivery endpoint registered on a topic.
pub type Sink<T> = mpsc::UnboundedSender<T>;

/// Publish/subscribe table keyed by topic string.
///
/// A sink registered twice under the same topic is stored once, identified by
/// channel identity, so it never receives duplicate deliveries. The same sink
/// may be registered under any number of topics.
pub struct TopicBus<T> {
    subs: RwLock<HashMap<String, Vec<Sink<T>>>>,
}

impl<T: Clone> TopicBus<T> {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `sink` for future publishes on `topic`.
    ///
    /// An existing registration of the same sink under `topic` is removed
    /// before re-adding, so the sink moves to the end of the delivery order.
    pub fn subscribe(&self, topic: &str, sink: &Sink<T>) {
        let mut subs = self.subs.write();
        let sinks = subs.entry(topic.to_string()).or_default();
        sinks.retain(|existing| !existing.same_channel(sink));
        sinks.push(sink.clone());
    }

    /// Hands a clone of `value` to every sink on `topic`, in registration
    /// order.
    ///
    /// Returns `true` if at least one sink accepted it. Sinks whose receiver
    /// is gone do not count.
    pub fn publish(&self, topic: &str, value: T) -> bool {
        let subs = self.subs.read();
        let Some(sinks) = subs.get(topic) else {
            return false;
        };
        let mut delivered = false;
        for sink in sinks {
            if sink.send(value.clone()).is_ok() {
                delivered = true;
            }
        }
        delivered
    }

    /// Removes `sink` from `topic`. Does nothing if it is not registered.
    pub fn unsubscribe(&self, topic: &str, sink: &Sink<T>) {
        let mut subs = self.subs.write();
        if let Some(sinks) = subs.get_mut(topic) {
            sinks.retain(|existing| !existing.same_channel(sink));
            if sinks.is_empty() {
                subs.remove(topic);
            }
        }
    }

    /// Returns the number of sinks registered under `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subs.read().get(topic).map_or(0, Vec::len)
    }

    /// Returns the number of topics with at least one sink.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.subs.read().len()
    }

    /// Creates a fresh sink, registers it on `topic` and returns a guard that
    /// unregisters it when dropped.
    #[must_use]
    pub fn subscribe_scoped(self: &Arc<Self>, topic: String) -> Subscription<T> {
        let (sink, receiver) = mpsc::unbounded_channel();
        self.subscribe(&topic, &sink);
        Subscription {
            bus: Arc::clone(self),
            topic,
            sink,
            receiver,
        }
    }
}

impl<T: Clone> Default for TopicBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TopicBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicBus")
            .field("topics", &self.subs.read().len())
            .finish()
    }
}

/// Ephemeral registration created by [`TopicBus::subscribe_scoped`].
///
/// The registration lives exactly as long as this value, including when the
/// owning future is dropped before completing.
pub struct Subscription<T: Clone> {
    bus: Arc<TopicBus<T>>,
    topic: String,
    sink: Sink<T>,
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Waits for the next value published on the topic.
    ///
    /// Returns `None` only if the channel is closed, which cannot happen while
    /// the subscription holds its own sink.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Returns a value already delivered, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Returns the topic this subscription listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, &self.sink);
    }
}

impl<T: Clone> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

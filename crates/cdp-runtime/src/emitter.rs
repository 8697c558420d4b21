//! Asynchronous publish/subscribe primitive for protocol events.
//!
//! Both the connection and each session own an [`EventEmitter`] to fan
//! protocol events out to interested subscribers. Each subscription has its
//! own bounded FIFO queue, so one slow consumer cannot stall the connection
//! read loop or delivery to other subscribers. On overflow the oldest queued
//! event is dropped with a diagnostic.
//!
//! Subscribing to [`WILDCARD`] receives every event on the emitter,
//! including events with an empty method name (raw messages the protocol
//! layer could not classify).

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Subscription name that matches every emitted event.
pub const WILDCARD: &str = "*";

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// An event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name (protocol method); empty for unclassifiable messages.
    pub name: String,
    /// Event payload.
    pub data: Value,
}

struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Bounded delivery queue owned by one subscription.
struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    fn push(&self, event: Event) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.events.len() == self.capacity {
                state.events.pop_front();
                tracing::warn!(name = %event.name, "subscriber queue full, dropping oldest event");
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    // Queued events remain drainable after close; the subscriber observes
    // closure once the queue is empty.
    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

struct EmitterInner {
    closed: bool,
    next_sub_id: u64,
    subscribers: HashMap<String, Vec<(u64, Arc<SubscriberQueue>)>>,
}

/// Publish/subscribe fan-out with cancellable subscriptions.
pub struct EventEmitter {
    inner: Arc<Mutex<EmitterInner>>,
    capacity: usize,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    /// Creates an emitter with the default per-subscriber queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates an emitter with a custom per-subscriber queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                closed: false,
                next_sub_id: 0,
                subscribers: HashMap::new(),
            })),
            capacity,
        }
    }

    /// Registers interest in events named `name`.
    ///
    /// Multiple independent subscriptions to the same name are permitted and
    /// each receives every matching event. Fails once the emitter is closed.
    pub fn on(&self, name: &str) -> Result<Subscription> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::EmitterClosed);
        }
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        let queue = SubscriberQueue::new(self.capacity);
        inner
            .subscribers
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::clone(&queue)));
        Ok(Subscription {
            name: name.to_string(),
            id,
            queue,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Subscribes to every event on this emitter.
    pub fn on_all(&self) -> Result<Subscription> {
        self.on(WILDCARD)
    }

    /// Delivers `data` to every subscriber of `name` and every wildcard
    /// subscriber. Never blocks the publisher.
    pub fn emit(&self, name: &str, data: Value) {
        let mut targets: Vec<Arc<SubscriberQueue>> = Vec::new();
        {
            let inner = self.inner.lock();
            if inner.closed {
                return;
            }
            if let Some(subs) = inner.subscribers.get(name) {
                targets.extend(subs.iter().map(|(_, q)| Arc::clone(q)));
            }
            if name != WILDCARD {
                if let Some(subs) = inner.subscribers.get(WILDCARD) {
                    targets.extend(subs.iter().map(|(_, q)| Arc::clone(q)));
                }
            }
        }

        for queue in targets {
            queue.push(Event {
                name: name.to_string(),
                data: data.clone(),
            });
        }
    }

    /// Closes the emitter: all outstanding subscriptions observe stream end,
    /// and further [`EventEmitter::on`] calls are rejected. Idempotent.
    pub fn close(&self) {
        let queues: Vec<Arc<SubscriberQueue>> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner
                .subscribers
                .drain()
                .flat_map(|(_, subs)| subs.into_iter().map(|(_, q)| q))
                .collect()
        };

        for queue in queues {
            queue.close();
        }
    }

    /// Returns true if the emitter has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Handle to an active subscription; the caller is its sole owner.
///
/// Dropping the subscription cancels it and releases its delivery queue.
pub struct Subscription {
    name: String,
    id: u64,
    queue: Arc<SubscriberQueue>,
    inner: Arc<Mutex<EmitterInner>>,
}

impl Subscription {
    /// Waits for the next matching event.
    ///
    /// Returns `None` once the emitter is closed and the queue is drained.
    pub async fn next(&mut self) -> Option<Event> {
        self.queue.recv().await
    }

    /// Cancels the subscription explicitly (equivalent to dropping it).
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(&self.name) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                inner.subscribers.remove(&self.name);
            }
        }
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_delivers_to_subscriber() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.on("Page.loadEventFired").unwrap();

        emitter.emit("Page.loadEventFired", json!({"timestamp": 1.0}));

        let event = sub.next().await.unwrap();
        assert_eq!(event.name, "Page.loadEventFired");
        assert_eq!(event.data["timestamp"], 1.0);
    }

    #[tokio::test]
    async fn test_emit_only_matching_name() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.on("Network.responseReceived").unwrap();

        emitter.emit("Page.loadEventFired", json!({}));
        emitter.emit("Network.responseReceived", json!({"requestId": "r1"}));

        let event = sub.next().await.unwrap();
        assert_eq!(event.name, "Network.responseReceived");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let emitter = EventEmitter::new();
        let mut first = emitter.on("console").unwrap();
        let mut second = emitter.on("console").unwrap();

        emitter.emit("console", json!({"text": "hello"}));

        assert_eq!(first.next().await.unwrap().data["text"], "hello");
        assert_eq!(second.next().await.unwrap().data["text"], "hello");
    }

    #[tokio::test]
    async fn test_wildcard_receives_everything() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.on_all().unwrap();

        emitter.emit("Page.loadEventFired", json!({}));
        emitter.emit("", json!({"raw": true}));

        assert_eq!(sub.next().await.unwrap().name, "Page.loadEventFired");
        let raw = sub.next().await.unwrap();
        assert_eq!(raw.name, "");
        assert_eq!(raw.data["raw"], true);
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.on("tick").unwrap();

        for i in 0..10 {
            emitter.emit("tick", json!({"seq": i}));
        }

        for i in 0..10 {
            assert_eq!(sub.next().await.unwrap().data["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let emitter = EventEmitter::with_capacity(2);
        let mut sub = emitter.on("tick").unwrap();

        emitter.emit("tick", json!({"seq": 0}));
        emitter.emit("tick", json!({"seq": 1}));
        emitter.emit("tick", json!({"seq": 2}));

        assert_eq!(sub.next().await.unwrap().data["seq"], 1);
        assert_eq!(sub.next().await.unwrap().data["seq"], 2);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_subscriber() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.on("never").unwrap();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::task::yield_now().await;

        emitter.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_drains_queued_events_first() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.on("tick").unwrap();

        emitter.emit("tick", json!({"seq": 0}));
        emitter.close();

        assert_eq!(sub.next().await.unwrap().data["seq"], 0);
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn test_on_after_close_rejected() {
        let emitter = EventEmitter::new();
        emitter.close();
        assert!(matches!(emitter.on("any"), Err(Error::EmitterClosed)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let emitter = EventEmitter::new();
        emitter.close();
        emitter.close();
        assert!(emitter.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_deregistered() {
        let emitter = EventEmitter::new();
        let first = emitter.on("tick").unwrap();
        let mut second = emitter.on("tick").unwrap();

        drop(first);
        emitter.emit("tick", json!({"seq": 0}));

        assert_eq!(second.next().await.unwrap().data["seq"], 0);
        assert!(emitter.inner.lock().subscribers.get("tick").unwrap().len() == 1);
    }
}

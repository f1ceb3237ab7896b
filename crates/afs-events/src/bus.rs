//! In-process publish/subscribe bus.
//!
//! Listeners subscribe with a topic filter and receive events through a
//! bounded channel. Delivery waits at most `send_timeout` per listener;
//! a listener that times out or whose receiver was dropped is removed
//! from the registry and never blocks later publishes.

use afs_types::{EventsSettings, NodeEvent, TopicEvent};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::EventsError;

/// Identity of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Which topics a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    All,
    Topics(HashSet<String>),
}

impl TopicFilter {
    pub fn topic(topic: &str) -> Self {
        TopicFilter::Topics(HashSet::from([topic.to_string()]))
    }

    pub fn topics(topics: &[&str]) -> Self {
        TopicFilter::Topics(topics.iter().map(|t| t.to_string()).collect())
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Topics(topics) => topics.contains(topic),
        }
    }
}

/// Handle returned by `add_listener`.
///
/// Holding the handle does not keep the listener registered: the owner
/// removes it with `EventsBus::remove_listener` on teardown. Dropping the
/// handle without removing it disconnects the channel and the bus drops
/// the listener on its next publish.
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    receiver: Receiver<TopicEvent>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn receiver(&self) -> &Receiver<TopicEvent> {
        &self.receiver
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<TopicEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Take every event delivered so far without blocking.
    pub fn drain(&self) -> Vec<TopicEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Publish/subscribe contract shared by the in-memory bus and the event store.
pub trait EventsBus: Send + Sync {
    /// Deliver `event` to every listener whose filter matches `topic`.
    fn push_event(&self, event: NodeEvent, topic: &str) -> Result<(), EventsError>;

    fn add_listener(&self, filter: TopicFilter) -> Subscription;

    /// Remove a listener. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    fn listener_count(&self) -> usize;

    /// Make everything published so far durable, if the bus records events.
    fn flush(&self) -> Result<(), EventsError> {
        Ok(())
    }
}

struct Listener {
    filter: TopicFilter,
    sender: Sender<TopicEvent>,
}

/// Bus that only delivers to live listeners.
pub struct InMemoryEventsBus {
    // Publishing holds this lock for the whole fan-out, which keeps
    // delivery order per topic equal to publish order.
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
    send_timeout: Duration,
    queue_capacity: usize,
}

impl InMemoryEventsBus {
    pub fn new(send_timeout: Duration, queue_capacity: usize) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn from_settings(settings: &EventsSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.listener_timeout_ms),
            settings.listener_queue_capacity,
        )
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

impl Default for InMemoryEventsBus {
    fn default() -> Self {
        Self::from_settings(&EventsSettings::default())
    }
}

impl EventsBus for InMemoryEventsBus {
    fn push_event(&self, event: NodeEvent, topic: &str) -> Result<(), EventsError> {
        // Held across sends. A full listener delays every publisher by up
        // to `send_timeout` before it is dropped.
        let mut listeners = self.listeners.lock();
        let mut dropped = Vec::new();

        for (id, listener) in listeners.iter() {
            if !listener.filter.matches(topic) {
                continue;
            }
            let delivery = TopicEvent::new(topic, event.clone());
            match listener.sender.send_timeout(delivery, self.send_timeout) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(listener = %id, topic, "Listener did not accept event in time, dropping it");
                    dropped.push(*id);
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    debug!(listener = %id, topic, "Listener disconnected, dropping it");
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            listeners.remove(&id);
        }
        Ok(())
    }

    fn add_listener(&self, filter: TopicFilter) -> Subscription {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.queue_capacity);
        self.listeners.lock().insert(id, Listener { filter, sender });
        debug!(listener = %id, "Registered listener");
        Subscription { id, receiver }
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self.listeners.lock().remove(&id).is_some();
        if removed {
            debug!(listener = %id, "Removed listener");
        }
        removed
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afs_types::{DEPENDENCY_TOPIC, NODE_TOPIC};

    fn created(id: &str) -> NodeEvent {
        NodeEvent::NodeCreated {
            id: id.to_string(),
            parent_id: None,
        }
    }

    #[test]
    fn test_delivers_to_matching_listeners() {
        let bus = InMemoryEventsBus::default();
        let nodes = bus.add_listener(TopicFilter::topic(NODE_TOPIC));
        let deps = bus.add_listener(TopicFilter::topic(DEPENDENCY_TOPIC));
        let all = bus.add_listener(TopicFilter::All);

        bus.push_event(created("a"), NODE_TOPIC).unwrap();

        assert_eq!(nodes.drain().len(), 1);
        assert!(deps.drain().is_empty());
        let received = all.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic, NODE_TOPIC);
        assert_eq!(received[0].event.node_id(), "a");
    }

    #[test]
    fn test_preserves_publish_order() {
        let bus = InMemoryEventsBus::default();
        let sub = bus.add_listener(TopicFilter::All);
        for i in 0..10 {
            bus.push_event(created(&i.to_string()), NODE_TOPIC).unwrap();
        }
        let ids: Vec<String> = sub
            .drain()
            .into_iter()
            .map(|e| e.event.node_id().to_string())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_remove_listener_is_idempotent() {
        let bus = InMemoryEventsBus::default();
        let sub = bus.add_listener(TopicFilter::All);
        assert!(bus.remove_listener(sub.id()));
        assert!(!bus.remove_listener(sub.id()));

        bus.push_event(created("a"), NODE_TOPIC).unwrap();
        assert!(sub.drain().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_slow_listener_is_dropped() {
        let bus = InMemoryEventsBus::new(Duration::from_millis(20), 1);
        let slow = bus.add_listener(TopicFilter::All);
        let healthy = bus.add_listener(TopicFilter::All);

        // Capacity 1: second publish times out on the listener that never reads.
        bus.push_event(created("a"), NODE_TOPIC).unwrap();
        assert_eq!(healthy.drain().len(), 1);
        bus.push_event(created("b"), NODE_TOPIC).unwrap();
        assert_eq!(healthy.drain().len(), 1);

        assert_eq!(bus.listener_count(), 1);
        assert_eq!(slow.drain().len(), 1);
    }

    #[test]
    fn test_full_listener_delays_publish_once() {
        let bus = InMemoryEventsBus::new(Duration::from_millis(50), 1);
        let _slow = bus.add_listener(TopicFilter::All);
        bus.push_event(created("a"), NODE_TOPIC).unwrap();

        let started = std::time::Instant::now();
        bus.push_event(created("b"), NODE_TOPIC).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        // the slow listener is gone, later publishes do not wait
        let started = std::time::Instant::now();
        bus.push_event(created("c"), NODE_TOPIC).unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = InMemoryEventsBus::default();
        let sub = bus.add_listener(TopicFilter::All);
        drop(sub);
        bus.push_event(created("a"), NODE_TOPIC).unwrap();
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_topic_filter_matching() {
        let filter = TopicFilter::topics(&[NODE_TOPIC, DEPENDENCY_TOPIC]);
        assert!(filter.matches(NODE_TOPIC));
        assert!(filter.matches(DEPENDENCY_TOPIC));
        assert!(!filter.matches("other"));
        assert!(TopicFilter::All.matches("other"));
    }
}

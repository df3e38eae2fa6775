//! Round-trip fan-out: bounded channel, consumer pool, and pub/sub (spec.md §4.6).
//!
//! Grounded on the teacher's `multicore::channel_dispatcher::ChannelDispatcher<T>`: a
//! `crossbeam::channel::bounded` channel with non-blocking `try_send`, plus a registry of
//! subscriber queues that drop on overflow rather than block the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::roundtrip::RoundTrip;

/// Something that wants to see every matched round-trip: a raw sink, the metrics aggregator, the
/// trace aggregator, or the admin pub/sub (spec.md §4.6 steps 1-3).
pub trait RoundTripConsumer: Send + Sync {
    fn on_round_trip(&self, rt: &RoundTrip);
}

/// Creates the bounded round-trip channel (capacity `2 × cpu_count`, spec.md §4.6) and the
/// consumer-side [`Dispatcher`] that fans each item out to every registered consumer.
pub fn new_channel(consumers: Vec<Arc<dyn RoundTripConsumer>>) -> (Sender<RoundTrip>, Dispatcher) {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let capacity = (2 * cpus).max(2);
    let (tx, rx) = bounded(capacity);
    (tx, Dispatcher { rx, consumers: Arc::new(consumers) })
}

/// Owns the receiving end of the round-trip channel and the list of consumers each item is
/// dispatched to. `crossbeam::channel::Receiver` is a cheap-to-clone MPMC handle, so `spawn_pool`
/// can hand out `N = 2 × cpu_count` independent consumer tasks (spec.md §5) sharing one channel.
pub struct Dispatcher {
    rx: Receiver<RoundTrip>,
    consumers: Arc<Vec<Arc<dyn RoundTripConsumer>>>,
}

impl Dispatcher {
    /// Runs the consumer loop on the calling thread until the channel disconnects (spec.md §5
    /// "consumer loops drain and exit" once the producer side is dropped on shutdown).
    pub fn run(&self) {
        while let Ok(rt) = self.rx.recv() {
            for consumer in self.consumers.iter() {
                consumer.on_round_trip(&rt);
            }
        }
    }

    /// Spawns `n` blocking consumer tasks sharing this dispatcher's channel.
    pub fn spawn_pool(&self, n: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..n)
            .map(|_| {
                let rx = self.rx.clone();
                let consumers = self.consumers.clone();
                tokio::task::spawn_blocking(move || {
                    while let Ok(rt) = rx.recv() {
                        for consumer in consumers.iter() {
                            consumer.on_round_trip(&rt);
                        }
                    }
                })
            })
            .collect()
    }
}

/// In-process pub/sub for the admin `/watch` endpoint (spec.md §4.6 step 1, §6 `GET /watch`).
/// Subscribers each get a bounded queue of pre-serialized JSON lines; a full queue drops the new
/// message rather than blocking the publisher.
pub struct PubSub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Sender<Arc<str>>>>,
    queue_capacity: usize,
}

impl PubSub {
    pub fn new(queue_capacity: usize) -> Self {
        PubSub {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Registers a new subscriber and returns its id and receiving end. The caller (an admin HTTP
    /// handler) must call [`PubSub::unsubscribe`] on connection close (spec.md §10 "Cyclic
    /// references": "subscribers are unregistered explicitly on HTTP handler exit").
    pub fn subscribe(&self) -> (u64, Receiver<Arc<str>>) {
        let (tx, rx) = bounded(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Serializes `value` once and broadcasts it to every subscriber, dropping silently on a full
    /// queue.
    pub fn publish<T: Serialize>(&self, value: &T) {
        let json: Arc<str> = match serde_json::to_string(value) {
            Ok(s) => Arc::from(s),
            Err(e) => {
                log::debug!("pubsub: failed to serialize: {}", e);
                return;
            }
        };
        let subs = self.subscribers.lock().unwrap();
        for tx in subs.values() {
            match tx.try_send(json.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {}
            }
        }
    }
}

impl RoundTripConsumer for PubSub {
    fn on_round_trip(&self, rt: &RoundTrip) {
        self.publish(rt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_drops_on_full_subscriber_queue() {
        let pubsub = PubSub::new(1);
        let (_id, rx) = pubsub.subscribe();
        pubsub.publish(&serde_json::json!({"a": 1}));
        pubsub.publish(&serde_json::json!({"a": 2}));
        let first = rx.try_recv().unwrap();
        assert!(first.contains('1'));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_removes_entry() {
        let pubsub = PubSub::new(4);
        let (id, _rx) = pubsub.subscribe();
        assert_eq!(pubsub.subscriber_count(), 1);
        pubsub.unsubscribe(id);
        assert_eq!(pubsub.subscriber_count(), 0);
    }
}

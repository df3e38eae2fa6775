//! Request/response pairing (spec.md §4.5).
//!
//! Receives decoder [`Object`](crate::decoder::Object)s in arrival order for one connection (both
//! directions interleaved) and emits a [`Pair`] once a request can be matched to a response.
//! Grounded on the teacher's `hashlink::LinkedHashMap` FIFO-eviction idiom used in
//! `conntrack::mod::ConnTracker` (oldest-first eviction via `raw_entry_mut`/iteration order),
//! applied here to pending-request bookkeeping instead of connection eviction.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;

use crate::decoder::Object;

/// A matched request/response pair, ready to become a [`crate::roundtrip::RoundTrip`].
pub struct Pair {
    pub request: Object,
    pub response: Object,
}

/// FIFO matcher for protocols with in-order responses on a single connection (HTTP/1, MySQL,
/// Redis, PostgreSQL, MongoDB): spec.md §4.5.
#[derive(Default)]
pub struct SingleMatcher {
    pending: VecDeque<Object>,
    /// Responses observed with no pending request to pair against. Exposed for diagnosis per
    /// spec.md §9's open question ("an implementation may wish to surface a counter").
    pub dropped_responses: u64,
}

impl SingleMatcher {
    pub fn new() -> Self {
        SingleMatcher::default()
    }

    pub fn push(&mut self, object: Object) -> Option<Pair> {
        match object {
            Object::Request(_) => {
                self.pending.push_back(object);
                None
            }
            Object::Response(_) => match self.pending.pop_front() {
                Some(request) => Some(Pair {
                    request,
                    response: object,
                }),
                None => {
                    self.dropped_responses += 1;
                    None
                }
            },
        }
    }
}

/// Id-keyed matcher for multiplexed protocols (HTTP/2, gRPC, Kafka, AMQP, DNS): spec.md §4.5.
/// Requests without a response expire after `conn_expired / 2`.
pub struct MultiplexedMatcher {
    pending: LinkedHashMap<u64, (Object, Instant)>,
    expiry: Duration,
}

impl MultiplexedMatcher {
    pub fn new(conn_expired: Duration) -> Self {
        MultiplexedMatcher {
            pending: LinkedHashMap::new(),
            expiry: conn_expired / 2,
        }
    }

    pub fn push(&mut self, object: Object, now: Instant) -> Option<Pair> {
        self.expire(now);
        let id = object.match_id()?;
        match object {
            Object::Request(_) => {
                self.pending.insert(id, (object, now));
                None
            }
            Object::Response(_) => self.pending.remove(&id).map(|(request, _)| Pair {
                request,
                response: object,
            }),
        }
    }

    /// Drops pending requests older than `conn_expired / 2` (spec.md §4.5). `pending` is iterated
    /// in insertion order, so the oldest entry is always first.
    fn expire(&mut self, now: Instant) {
        loop {
            let Some(oldest_id) = self.pending.iter().next().and_then(|(id, (_, inserted_at))| {
                (now.saturating_duration_since(*inserted_at) > self.expiry).then_some(*id)
            }) else {
                break;
            };
            self.pending.remove(&oldest_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Message, Payload};
    use crate::decoder::http::{HttpMessage, HttpRequest, HttpResponse};

    fn req(t: Instant) -> Object {
        Object::Request(Message {
            payload: Payload::Http(HttpMessage::Request(HttpRequest::default())),
            time: t,
            size: 10,
        })
    }

    fn resp(t: Instant) -> Object {
        Object::Response(Message {
            payload: Payload::Http(HttpMessage::Response(HttpResponse::default())),
            time: t,
            size: 10,
        })
    }

    #[test]
    fn fifo_pairs_in_order() {
        let mut m = SingleMatcher::new();
        let t = Instant::now();
        assert!(m.push(req(t)).is_none());
        assert!(m.push(req(t)).is_none());
        let pair1 = m.push(resp(t)).unwrap();
        let pair2 = m.push(resp(t)).unwrap();
        assert!(matches!(pair1.request, Object::Request(_)));
        assert!(matches!(pair2.request, Object::Request(_)));
    }

    #[test]
    fn response_with_empty_queue_is_dropped() {
        let mut m = SingleMatcher::new();
        assert!(m.push(resp(Instant::now())).is_none());
        assert_eq!(m.dropped_responses, 1);
    }
}

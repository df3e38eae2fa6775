//! Round-trip records (spec.md §3, §6).
//!
//! The JSON shape mirrors the teacher's transaction types (`HttpRequest`/`HttpResponse`,
//! `DnsQuery`/`DnsResponse`): a flat `#[derive(Serialize)]` struct per side, carrying the fields
//! the admin `/watch` endpoint and the round-trip sink both serialize directly.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::decoder::{Object, Payload};
use crate::fanout::RoundTripConsumer;
use crate::matcher::Pair;

/// One side of a round-trip: request or response, with connection-identifying context.
#[derive(Debug, Serialize)]
pub struct Side {
    pub host: IpAddr,
    pub port: u16,
    pub proto: &'static str,
    pub size: usize,
    pub time: DateTime<Utc>,
    pub payload: Payload,
}

/// A matched request/response pair, ready for fan-out (spec.md §3).
#[derive(Debug, Serialize)]
pub struct RoundTrip {
    pub proto: &'static str,
    pub request: Side,
    pub response: Side,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
}

impl RoundTrip {
    /// Builds a `RoundTrip` from a matched [`Pair`], enforcing the spec.md §3 invariant that
    /// `response.time >= request.time`. Returns `None` (the round-trip is discarded) otherwise.
    ///
    /// `server_ip`/`server_port` name the server side of the connection (spec.md:63) — resolved
    /// once at `Connection` construction, not re-derived from either message's own packet tuple,
    /// so `Side.host`/`Side.port` are stable regardless of which direction happened to speak
    /// first (e.g. a MySQL server's unsolicited handshake greeting).
    pub fn from_pair(pair: Pair, server_ip: IpAddr, server_port: u16, now_instant: std::time::Instant, now_system: SystemTime) -> Option<Self> {
        let Pair { request, response } = pair;
        let req_time = request.time();
        let resp_time = response.time();
        if resp_time < req_time {
            return None;
        }
        let duration = resp_time.saturating_duration_since(req_time);
        let to_system = |i: std::time::Instant| {
            let delta = now_instant.saturating_duration_since(i);
            now_system - delta
        };
        let proto = request_proto_name(&request);
        Some(RoundTrip {
            proto,
            request: to_side(request, server_ip, server_port, to_system),
            response: to_side(response, server_ip, server_port, to_system),
            duration,
        })
    }
}

fn request_proto_name(obj: &Object) -> &'static str {
    match obj {
        Object::Request(m) | Object::Response(m) => m.payload.name(),
    }
}

fn to_side(obj: Object, server_ip: IpAddr, server_port: u16, to_system: impl Fn(std::time::Instant) -> SystemTime) -> Side {
    match obj {
        Object::Request(m) | Object::Response(m) => Side {
            host: server_ip,
            port: server_port,
            proto: m.payload.name(),
            size: m.size,
            time: to_system(m.time).into(),
            payload: m.payload,
        },
    }
}

mod duration_nanos {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.as_nanos() as i64)
    }
}

/// Fan-out envelope (spec.md §3): what kind of data a [`crate::fanout`] consumer is forwarding.
#[derive(Debug, Serialize)]
#[serde(tag = "kind")]
pub enum Record {
    RoundTrips { data: Box<RoundTrip> },
    Metrics { data: MetricsSnapshot },
    Traces { data: TraceBatch },
}

/// A batch of exported metric samples (spec.md §6: "Prometheus remote-write" shape, simplified to
/// the subset carried internally before hand-off to `prometheus-client`'s own encoder).
#[derive(Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub samples: Vec<(String, f64)>,
}

/// A batch of spans derived from round-trips (spec.md §6).
#[derive(Debug, Default, Serialize)]
pub struct TraceBatch {
    pub spans: Vec<Span>,
}

#[derive(Debug, Serialize)]
pub struct Span {
    pub name: &'static str,
    pub start: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
}

/// Accumulates one [`Span`] per matched round-trip between export windows, mirroring
/// [`crate::stats::Stats`]'s own `totals`/`drain_snapshot` pattern (spec.md §6 "traces-batch
/// timer"). A single instance is shared (behind an `Arc`) between the fan-out dispatcher, which
/// feeds it via [`RoundTripConsumer`], and the traces-batch timer, which drains it.
#[derive(Default)]
pub struct TraceAccumulator {
    spans: Mutex<Vec<Span>>,
}

impl TraceAccumulator {
    pub fn new() -> Self {
        TraceAccumulator::default()
    }

    /// Drains the accumulated spans into a [`TraceBatch`] for the external traces sink, resetting
    /// the accumulator for the next export window.
    pub fn drain_batch(&self) -> TraceBatch {
        let spans = std::mem::take(&mut *self.spans.lock().unwrap());
        TraceBatch { spans }
    }
}

impl RoundTripConsumer for TraceAccumulator {
    fn on_round_trip(&self, rt: &RoundTrip) {
        let span = Span {
            name: rt.proto,
            start: rt.request.time,
            duration: rt.duration,
        };
        self.spans.lock().unwrap().push(span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Message, Payload};
    use crate::decoder::http::{HttpMessage, HttpRequest, HttpResponse};
    use std::net::Ipv4Addr;
    use std::time::Instant;

    #[test]
    fn discards_out_of_order_pair() {
        let now_i = Instant::now();
        let later = now_i + Duration::from_secs(1);
        let pair = Pair {
            request: Object::Request(Message {
                payload: Payload::Http(HttpMessage::Request(HttpRequest::default())),
                time: later,
                size: 1,
            }),
            response: Object::Response(Message {
                payload: Payload::Http(HttpMessage::Response(HttpResponse::default())),
                time: now_i,
                size: 1,
            }),
        };
        let server_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let rt = RoundTrip::from_pair(pair, server_ip, 80, now_i, SystemTime::now());
        assert!(rt.is_none());
    }

    #[test]
    fn host_reflects_server_address_not_first_packet_sender() {
        let now_i = Instant::now();
        let pair = Pair {
            request: Object::Request(Message {
                payload: Payload::Http(HttpMessage::Request(HttpRequest::default())),
                time: now_i,
                size: 1,
            }),
            response: Object::Response(Message {
                payload: Payload::Http(HttpMessage::Response(HttpResponse::default())),
                time: now_i + Duration::from_millis(1),
                size: 1,
            }),
        };
        // The server's address, resolved once at Connection construction - distinct from either
        // endpoint a caller might mistakenly pass as "whoever sent the first packet".
        let server_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        let rt = RoundTrip::from_pair(pair, server_ip, 3306, now_i, SystemTime::now()).unwrap();
        assert_eq!(rt.request.host, server_ip);
        assert_eq!(rt.request.port, 3306);
        assert_eq!(rt.response.host, server_ip);
        assert_eq!(rt.response.port, 3306);
    }

    #[test]
    fn trace_accumulator_drains_one_span_per_round_trip_and_resets() {
        let now_i = Instant::now();
        let pair = Pair {
            request: Object::Request(Message {
                payload: Payload::Http(HttpMessage::Request(HttpRequest::default())),
                time: now_i,
                size: 1,
            }),
            response: Object::Response(Message {
                payload: Payload::Http(HttpMessage::Response(HttpResponse::default())),
                time: now_i + Duration::from_millis(2),
                size: 1,
            }),
        };
        let server_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let rt = RoundTrip::from_pair(pair, server_ip, 80, now_i, SystemTime::now()).unwrap();

        let acc = TraceAccumulator::new();
        acc.on_round_trip(&rt);
        acc.on_round_trip(&rt);
        let batch = acc.drain_batch();
        assert_eq!(batch.spans.len(), 2);
        assert_eq!(batch.spans[0].name, "http");
        assert_eq!(batch.spans[0].duration, Duration::from_millis(2));

        let empty = acc.drain_batch();
        assert!(empty.spans.is_empty());
    }
}

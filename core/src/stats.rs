//! In-process metrics (spec.md §5 "Metric storage", §6 `GET /metrics` / `GET /protocol/metrics`).
//!
//! Grounded on the teacher's `stats::prometheus` module: a `prometheus_client::registry::Registry`
//! of `Family<Labels, Metric>`, a hand-rolled `EncodeLabelSet` impl for the label type (the teacher
//! does this for `CoreId`; here it's the protocol name), and a `serve_req`-style text encoder for
//! the admin HTTP surface. Unlike the teacher (per-core thread-local counters flushed
//! periodically), round-trips arrive from several consumer tasks concurrently, so counters are
//! updated directly through `Family::get_or_create`, which is lock-striped internally.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use prometheus_client::encoding::{EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};

use crate::conntrack::ConnStats;
use crate::fanout::RoundTripConsumer;
use crate::roundtrip::{MetricsSnapshot, RoundTrip};

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ProtoLabel {
    pub proto: String,
}

impl EncodeLabelSet for ProtoLabel {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        let mut label = encoder.encode_label();
        let mut key = label.encode_label_key()?;
        key.write_str("proto")?;
        let mut value = key.encode_label_value()?;
        write!(value, "{}", self.proto)?;
        value.finish()
    }
}

#[derive(Default)]
struct Families {
    round_trips_total: Family<ProtoLabel, Counter>,
    request_bytes_total: Family<ProtoLabel, Counter>,
    response_bytes_total: Family<ProtoLabel, Counter>,
    round_trip_duration_nanos_total: Family<ProtoLabel, Counter>,
    active_connections: Family<ProtoLabel, Gauge>,
    closed_connections_total: Family<ProtoLabel, Counter>,
    closed_connection_bytes_total: Family<ProtoLabel, Counter>,
    closed_connection_packets_total: Family<ProtoLabel, Counter>,
}

/// Per-protocol running totals kept alongside the Prometheus families, for the simplified
/// `MetricsSnapshot` handed to the external metrics sink (spec.md §6 `sink(write_request)`).
#[derive(Default, Clone, Copy)]
struct ProtoTotals {
    round_trips: u64,
    request_bytes: u64,
    response_bytes: u64,
    duration_nanos: u64,
}

fn register_protocol_families(registry: &mut Registry, families: &Families) {
    registry.register_with_unit(
        "flowwatch_round_trips",
        "Total matched round-trips observed, by protocol.",
        Unit::Other("total".to_string()),
        families.round_trips_total.clone(),
    );
    registry.register_with_unit(
        "flowwatch_request_bytes",
        "Total request wire bytes observed, by protocol.",
        Unit::Bytes,
        families.request_bytes_total.clone(),
    );
    registry.register_with_unit(
        "flowwatch_response_bytes",
        "Total response wire bytes observed, by protocol.",
        Unit::Bytes,
        families.response_bytes_total.clone(),
    );
    registry.register(
        "flowwatch_round_trip_duration_nanos",
        "Cumulative round-trip latency, by protocol (divide by flowwatch_round_trips_total for the mean).",
        families.round_trip_duration_nanos_total.clone(),
    );
    registry.register(
        "flowwatch_active_connections",
        "Currently tracked connections, by protocol pool.",
        families.active_connections.clone(),
    );
    registry.register(
        "flowwatch_closed_connections",
        "Total connections removed from a pool (closed or expired), by protocol.",
        families.closed_connections_total.clone(),
    );
    registry.register_with_unit(
        "flowwatch_closed_connection_bytes",
        "Total bytes (both directions) seen by connections removed from a pool, by protocol.",
        Unit::Bytes,
        families.closed_connection_bytes_total.clone(),
    );
    registry.register_with_unit(
        "flowwatch_closed_connection_packets",
        "Total packets (both directions) seen by connections removed from a pool, by protocol.",
        Unit::Other("pkts".to_string()),
        families.closed_connection_packets_total.clone(),
    );
}

fn encode_registry(registry: &Registry) -> String {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, registry).unwrap_or_else(|e| {
        log::error!("metrics encode failed: {}", e);
    });
    buf
}

/// The process-wide metrics registry. One instance lives for the life of the agent; admin handlers
/// and the export timer both read from it, consumer tasks write to it.
///
/// Two `Registry` views are kept over the same underlying `Family`/`Counter` instances (cheap to
/// clone — each is an `Arc` handle): `registry` backs `GET /metrics` (everything, plus capture
/// packet/drop counters), `protocol_registry` backs `GET /protocol/metrics` (the per-protocol
/// subset only), per spec.md §6.
pub struct Stats {
    families: Families,
    capture_packets: Counter,
    capture_drops: Counter,
    registry: Registry,
    protocol_registry: Registry,
    totals: Mutex<HashMap<String, ProtoTotals>>,
}

impl Stats {
    pub fn new() -> Self {
        let families = Families::default();
        let capture_packets = Counter::default();
        let capture_drops = Counter::default();

        let mut protocol_registry = Registry::default();
        register_protocol_families(&mut protocol_registry, &families);

        let mut registry = Registry::default();
        register_protocol_families(&mut registry, &families);
        registry.register_with_unit(
            "flowwatch_capture_packets",
            "Total packets seen by the capture backend.",
            Unit::Other("pkts".to_string()),
            capture_packets.clone(),
        );
        registry.register_with_unit(
            "flowwatch_capture_drops",
            "Total packets dropped by the capture backend.",
            Unit::Other("pkts".to_string()),
            capture_drops.clone(),
        );

        Stats {
            families,
            capture_packets,
            capture_drops,
            registry,
            protocol_registry,
            totals: Mutex::new(HashMap::new()),
        }
    }

    /// Renders the full registry as Prometheus text (spec.md §6 `GET /metrics`).
    pub fn encode_text(&self) -> String {
        encode_registry(&self.registry)
    }

    /// Renders just the per-protocol subset (spec.md §6 `GET /protocol/metrics`).
    pub fn encode_protocol_text(&self) -> String {
        encode_registry(&self.protocol_registry)
    }

    /// Records one capture poll's stats (spec.md §6 `handle.stats()`).
    pub fn record_capture_stats(&self, stats: &crate::capture::CaptureStats) {
        self.capture_packets.inc_by(stats.packets);
        self.capture_drops.inc_by(stats.drops);
    }

    /// Sets the active-connection gauge for one protocol pool (spec.md §4.2 `active_pool_conns`),
    /// called from the periodic connection-expiry sweeper. `Gauge::set` assigns rather than
    /// accumulates, so each sweep's value simply replaces the last.
    pub fn set_active_connections(&self, proto: &str, count: usize) {
        self.families
            .active_connections
            .get_or_create(&ProtoLabel { proto: proto.to_string() })
            .set(count as i64);
    }

    /// Snapshots a connection's lifetime byte/packet counts into the registry before it's dropped
    /// from its pool, whether by the expiry sweep or by its decoder reporting `ConnClosed` (spec.md:63
    /// "snapshot conn.stats() into metrics and pool.delete(tuple)").
    pub fn record_closed_connection(&self, proto: &str, conn_stats: &ConnStats) {
        let label = ProtoLabel { proto: proto.to_string() };
        self.families.closed_connections_total.get_or_create(&label).inc();
        self.families
            .closed_connection_bytes_total
            .get_or_create(&label)
            .inc_by(conn_stats.bytes_c2s + conn_stats.bytes_s2c);
        self.families
            .closed_connection_packets_total
            .get_or_create(&label)
            .inc_by(conn_stats.total_packets());
    }

    /// Builds the simplified snapshot handed to the external metrics sink (spec.md §6), then
    /// resets the running totals for the next export window.
    pub fn drain_snapshot(&self) -> MetricsSnapshot {
        let mut totals = self.totals.lock().unwrap();
        let mut samples = Vec::with_capacity(totals.len() * 4);
        for (proto, t) in totals.drain() {
            samples.push((format!("{}_round_trips_total", proto), t.round_trips as f64));
            samples.push((format!("{}_request_bytes_total", proto), t.request_bytes as f64));
            samples.push((format!("{}_response_bytes_total", proto), t.response_bytes as f64));
            samples.push((format!("{}_round_trip_duration_nanos_total", proto), t.duration_nanos as f64));
        }
        MetricsSnapshot { samples }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundTripConsumer for Stats {
    fn on_round_trip(&self, rt: &RoundTrip) {
        let label = ProtoLabel { proto: rt.proto.to_string() };
        self.families.round_trips_total.get_or_create(&label).inc();
        self.families.request_bytes_total.get_or_create(&label).inc_by(rt.request.size as u64);
        self.families.response_bytes_total.get_or_create(&label).inc_by(rt.response.size as u64);
        self.families
            .round_trip_duration_nanos_total
            .get_or_create(&label)
            .inc_by(rt.duration.as_nanos() as u64);

        let mut totals = self.totals.lock().unwrap();
        let entry = totals.entry(rt.proto.to_string()).or_default();
        entry.round_trips += 1;
        entry.request_bytes += rt.request.size as u64;
        entry.response_bytes += rt.response.size as u64;
        entry.duration_nanos += rt.duration.as_nanos() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::http::{HttpMessage, HttpRequest, HttpResponse};
    use crate::decoder::{Message, Payload};
    use crate::matcher::Pair;
    use crate::roundtrip::RoundTrip;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant, SystemTime};

    fn sample_round_trip() -> RoundTrip {
        let t = Instant::now();
        let pair = Pair {
            request: crate::decoder::Object::Request(Message {
                payload: Payload::Http(HttpMessage::Request(HttpRequest::default())),
                time: t,
                size: 10,
            }),
            response: crate::decoder::Object::Response(Message {
                payload: Payload::Http(HttpMessage::Response(HttpResponse::default())),
                time: t + Duration::from_millis(5),
                size: 20,
            }),
        };
        let server_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        RoundTrip::from_pair(pair, server_ip, 80, t, SystemTime::now()).unwrap()
    }

    #[test]
    fn records_round_trip_into_totals_and_registry() {
        let stats = Stats::new();
        stats.on_round_trip(&sample_round_trip());
        let text = stats.encode_text();
        assert!(text.contains("flowwatch_round_trips"));
        let snapshot = stats.drain_snapshot();
        assert!(snapshot.samples.iter().any(|(k, v)| k.contains("round_trips_total") && *v == 1.0));
    }

    #[test]
    fn record_closed_connection_adds_to_registry() {
        let stats = Stats::new();
        let conn_stats = ConnStats {
            packets_c2s: 3,
            packets_s2c: 2,
            bytes_c2s: 100,
            bytes_s2c: 50,
        };
        stats.record_closed_connection("mysql", &conn_stats);
        let text = stats.encode_text();
        assert!(text.contains("flowwatch_closed_connections"));
        assert!(text.contains("flowwatch_closed_connection_bytes"));
        assert!(text.contains("flowwatch_closed_connection_packets"));
        assert!(text.contains("proto=\"mysql\""));
    }

    #[test]
    fn protocol_registry_excludes_capture_counters() {
        let stats = Stats::new();
        stats.record_capture_stats(&crate::capture::CaptureStats {
            iface: "eth0".to_string(),
            packets: 5,
            drops: 1,
        });
        let global = stats.encode_text();
        let protocol = stats.encode_protocol_text();
        assert!(global.contains("flowwatch_capture_packets"));
        assert!(!protocol.contains("flowwatch_capture_packets"));
        assert!(protocol.contains("flowwatch_round_trips"));
    }
}

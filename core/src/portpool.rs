//! Port-pool registry: routes packets to a protocol decoder factory by server port (spec.md §4.2).
//!
//! Grounded on the teacher's `filter`/`subscription` registration idiom (a static table mapping a
//! name to a constructor), adapted here to build one [`PortPool`] per configured protocol from
//! [`crate::config::ProtocolConfig`] and route packets into it by `L4Proto × port`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Sender;

use crate::config::ProtocolConfig;
use crate::conntrack::{Connection, ConnectionPool, Matcher, PacketOutcome};
use crate::decoder::{amqp, dns, grpc, http, http2, kafka, mongodb, mysql, postgres, redis, Decoder, MatcherKind};
use crate::matcher::{MultiplexedMatcher, SingleMatcher};
use crate::packet::{Direction, L4Packet};
use crate::roundtrip::RoundTrip;
use crate::stats::Stats;
use crate::tuple::{L4Proto, Tuple};

/// Builds the pair of per-direction decoders and declares the matcher a protocol uses. One
/// instance is shared by every connection in a [`PortPool`] (spec.md §9 "Polymorphic decoders").
pub trait ProtocolFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn l4_proto(&self) -> L4Proto;
    fn matcher_kind(&self) -> MatcherKind;
    /// Returns `(decoder_c2s, decoder_s2c)`. `server_port` is the port the registry decided is the
    /// server side of the connection, for protocols whose decoder wants it (e.g. MySQL).
    fn new_decoders(&self, server_port: u16) -> (Box<dyn Decoder>, Box<dyn Decoder>);
}

macro_rules! simple_factory {
    ($name:ident, $proto_name:literal, $l4:expr, $kind:expr, |$port:ident| $make_c2s:expr, $make_s2c:expr) => {
        pub struct $name;
        impl ProtocolFactory for $name {
            fn name(&self) -> &'static str {
                $proto_name
            }
            fn l4_proto(&self) -> L4Proto {
                $l4
            }
            fn matcher_kind(&self) -> MatcherKind {
                $kind
            }
            fn new_decoders(&self, $port: u16) -> (Box<dyn Decoder>, Box<dyn Decoder>) {
                (Box::new($make_c2s), Box::new($make_s2c))
            }
        }
    };
}

simple_factory!(MysqlFactory, "mysql", L4Proto::Tcp, MatcherKind::Single, |port| mysql::MysqlDecoder::new(true, port), mysql::MysqlDecoder::new(false, port));
simple_factory!(PostgresFactory, "postgres", L4Proto::Tcp, MatcherKind::Single, |_port| postgres::PostgresDecoder::new(true), postgres::PostgresDecoder::new(false));
simple_factory!(HttpFactory, "http", L4Proto::Tcp, MatcherKind::Single, |_port| http::HttpDecoder::new(true), http::HttpDecoder::new(false));
simple_factory!(RedisFactory, "redis", L4Proto::Tcp, MatcherKind::Single, |_port| redis::RedisDecoder::new(true), redis::RedisDecoder::new(false));
simple_factory!(MongodbFactory, "mongodb", L4Proto::Tcp, MatcherKind::Single, |_port| mongodb::MongoDecoder::new(true), mongodb::MongoDecoder::new(false));
simple_factory!(DnsFactory, "dns", L4Proto::Udp, MatcherKind::Multiplexed, |_port| dns::DnsDecoder::new(true), dns::DnsDecoder::new(false));
simple_factory!(Http2Factory, "http2", L4Proto::Tcp, MatcherKind::Multiplexed, |_port| http2::Http2Decoder::new(true), http2::Http2Decoder::new(false));
simple_factory!(AmqpFactory, "amqp", L4Proto::Tcp, MatcherKind::Multiplexed, |_port| amqp::AmqpDecoder::new(true), amqp::AmqpDecoder::new(false));
simple_factory!(KafkaFactory, "kafka", L4Proto::Tcp, MatcherKind::Multiplexed, |_port| kafka::KafkaDecoder::new(true), kafka::KafkaDecoder::new(false));

/// gRPC decoders are keyed per-stream on HTTP/2, but spec.md §4.4.3 allows a standalone framed
/// decoder; `new_decoders` seeds stream id 0 and the HTTP/2 layer above (if present) is expected to
/// construct additional per-stream instances. Out of scope here: see `DESIGN.md`.
pub struct GrpcFactory;
impl ProtocolFactory for GrpcFactory {
    fn name(&self) -> &'static str {
        "grpc"
    }
    fn l4_proto(&self) -> L4Proto {
        L4Proto::Tcp
    }
    fn matcher_kind(&self) -> MatcherKind {
        MatcherKind::Multiplexed
    }
    fn new_decoders(&self, _server_port: u16) -> (Box<dyn Decoder>, Box<dyn Decoder>) {
        (Box::new(grpc::GrpcDecoder::new(true, 0)), Box::new(grpc::GrpcDecoder::new(false, 0)))
    }
}

/// Looks up the built-in factory for a protocol name (spec.md §6 "Protocol registration").
pub fn make_factory(name: &str) -> Option<Arc<dyn ProtocolFactory>> {
    Some(match name {
        "mysql" => Arc::new(MysqlFactory),
        "postgres" => Arc::new(PostgresFactory),
        "http" => Arc::new(HttpFactory),
        "redis" => Arc::new(RedisFactory),
        "mongodb" => Arc::new(MongodbFactory),
        "dns" => Arc::new(DnsFactory),
        "http2" => Arc::new(Http2Factory),
        "amqp" => Arc::new(AmqpFactory),
        "kafka" => Arc::new(KafkaFactory),
        "grpc" => Arc::new(GrpcFactory),
        _ => return None,
    })
}

/// An instance of `{protocol, server_port_set, factory, connections}` (spec.md §3 "PortPool").
pub struct PortPool {
    pub protocol: String,
    l4_proto: L4Proto,
    ports: Vec<u16>,
    factory: Arc<dyn ProtocolFactory>,
    conn_expired: std::time::Duration,
    max_message_size: usize,
    connections: Arc<ConnectionPool>,
}

impl PortPool {
    fn new(protocol: String, l4_proto: L4Proto, ports: Vec<u16>, factory: Arc<dyn ProtocolFactory>, max_connections: usize, conn_expired: std::time::Duration, max_message_size: usize) -> Self {
        PortPool {
            protocol,
            l4_proto,
            ports,
            factory,
            conn_expired,
            max_message_size,
            connections: Arc::new(ConnectionPool::new(max_connections)),
        }
    }

    fn owns(&self, l4: L4Proto, port: u16) -> bool {
        self.l4_proto == l4 && self.ports.contains(&port)
    }

    /// Feeds `pkt` (direction already resolved) into this pool's connection table.
    fn dispatch(&self, tuple: Tuple, server_port: u16, pkt: &L4Packet, rt_tx: &Sender<RoundTrip>, stats: &Stats) -> PacketOutcome {
        let factory = self.factory.clone();
        let matcher_kind = factory.matcher_kind();
        let conn_expired = self.conn_expired;
        let max_message_size = self.max_message_size;
        let timestamp = pkt.timestamp;
        self.connections.get_or_create_and_feed(tuple, server_port, pkt, rt_tx, stats, &self.protocol, move || {
            let (decoder_c2s, decoder_s2c) = factory.new_decoders(server_port);
            let matcher = match matcher_kind {
                MatcherKind::Single => Matcher::Single(SingleMatcher::new()),
                MatcherKind::Multiplexed => Matcher::Multiplexed(MultiplexedMatcher::new(conn_expired)),
            };
            Connection::new(tuple, server_port, decoder_c2s, decoder_s2c, matcher, max_message_size, timestamp)
        })
    }

    /// Sweeps expired connections (spec.md §4.3 `remove_expired`).
    pub fn sweep_expired(&self, now: Instant, stats: &Stats) -> usize {
        self.connections.remove_expired(self.conn_expired, now, stats, &self.protocol)
    }

    pub fn active_conns(&self) -> usize {
        self.connections.len()
    }

    pub fn for_each_stats(&self, f: impl FnMut(&Tuple, &crate::conntrack::ConnStats)) {
        self.connections.for_each_stats(f);
    }
}

/// Routes packets to pools and owns the live routing table (spec.md §4.2).
///
/// `decide` probes `(l4, dst_port)` then `(l4, src_port)`; the matching port is the server port.
/// `reload` rebuilds the table from new rules, reusing the `ConnectionPool` of any protocol that
/// survives the reload so in-flight connections aren't dropped.
pub struct PortPoolRegistry {
    pools: Vec<Arc<PortPool>>,
}

impl PortPoolRegistry {
    pub fn empty() -> Self {
        PortPoolRegistry { pools: Vec::new() }
    }

    /// Builds a fresh registry from `rules`, optionally reusing connection state from `previous`
    /// for protocols present in both (spec.md §4.2 "Reload").
    pub fn build(rules: &[ProtocolConfig], max_connections: usize, conn_expired: std::time::Duration, max_message_size: usize, previous: Option<&PortPoolRegistry>) -> Self {
        let mut pools = Vec::with_capacity(rules.len());
        for rule in rules {
            let Some(factory) = make_factory(&rule.name) else {
                log::warn!("unknown protocol {:?} in config, skipping", rule.name);
                continue;
            };
            let l4_proto = factory.l4_proto();
            if let Some(prev) = previous {
                if let Some(existing) = prev.pools.iter().find(|p| p.protocol == rule.name) {
                    pools.push(Arc::new(PortPool {
                        protocol: existing.protocol.clone(),
                        l4_proto: existing.l4_proto,
                        ports: rule.ports.clone(),
                        factory: existing.factory.clone(),
                        conn_expired,
                        max_message_size,
                        connections: existing.connections.clone(),
                    }));
                    continue;
                }
            }
            pools.push(Arc::new(PortPool::new(rule.name.clone(), l4_proto, rule.ports.clone(), factory, max_connections, conn_expired, max_message_size)));
        }
        PortPoolRegistry { pools }
    }

    /// `decide(tuple) -> (server_port, pool) | none` (spec.md §4.2).
    fn decide(&self, tuple: &Tuple) -> Option<(u16, &Arc<PortPool>)> {
        self.pools
            .iter()
            .find(|p| p.owns(tuple.l4_proto, tuple.dst_port))
            .map(|p| (tuple.dst_port, p))
            .or_else(|| {
                self.pools
                    .iter()
                    .find(|p| p.owns(tuple.l4_proto, tuple.src_port))
                    .map(|p| (tuple.src_port, p))
            })
    }

    /// Routes one packet per spec.md §4.1's algorithm: resolve direction relative to the decided
    /// server port, get-or-create the connection, and feed it. Drops the packet silently if no
    /// pool claims either port.
    pub fn route(&self, tuple: Tuple, mut pkt: L4Packet, rt_tx: &Sender<RoundTrip>, stats: &Stats) -> Option<PacketOutcome> {
        let (server_port, pool) = self.decide(&tuple)?;
        pkt.direction = if tuple.dst_port == server_port {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };
        Some(pool.dispatch(tuple, server_port, &pkt, rt_tx, stats))
    }

    pub fn sweep_expired(&self, now: Instant, stats: &Stats) -> usize {
        self.pools.iter().map(|p| p.sweep_expired(now, stats)).sum()
    }

    /// Active connections per protocol (spec.md §4.2 `active_pool_conns`).
    pub fn active_pool_conns(&self) -> HashMap<String, usize> {
        self.pools.iter().map(|p| (p.protocol.clone(), p.active_conns())).collect()
    }

    pub fn pools(&self) -> &[Arc<PortPool>] {
        &self.pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn cfg() -> Vec<ProtocolConfig> {
        vec![ProtocolConfig {
            name: "http".to_string(),
            ports: vec![80],
            options: Default::default(),
        }]
    }

    #[test]
    fn decides_server_port_from_destination() {
        let reg = PortPoolRegistry::build(&cfg(), 1024, Duration::from_secs(300), 1 << 20, None);
        let tuple = Tuple::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5555,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            L4Proto::Tcp,
        );
        let (port, pool) = reg.decide(&tuple).unwrap();
        assert_eq!(port, 80);
        assert_eq!(pool.protocol, "http");
    }

    #[test]
    fn reload_reuses_surviving_pool() {
        let reg1 = PortPoolRegistry::build(&cfg(), 1024, Duration::from_secs(300), 1 << 20, None);
        let reg2 = PortPoolRegistry::build(&cfg(), 1024, Duration::from_secs(300), 1 << 20, Some(&reg1));
        assert!(Arc::ptr_eq(&reg1.pools[0].factory, &reg2.pools[0].factory));
        assert!(Arc::ptr_eq(&reg1.pools[0].connections, &reg2.pools[0].connections));
    }

    #[test]
    fn reload_keeps_in_flight_connections_for_surviving_pool() {
        use crate::packet::{Direction, L4Packet};
        use std::time::Instant;

        let reg1 = PortPoolRegistry::build(&cfg(), 1024, Duration::from_secs(300), 1 << 20, None);
        let tuple = Tuple::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5555,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            L4Proto::Tcp,
        );
        let (tx, _rx) = crossbeam::channel::bounded(8);
        let payload = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let pkt = L4Packet {
            tuple: tuple.clone(),
            direction: Direction::ClientToServer,
            payload,
            timestamp: Instant::now(),
        };
        let stats = Stats::new();
        reg1.route(tuple, pkt, &tx, &stats);
        assert_eq!(reg1.pools[0].active_conns(), 1);

        let reg2 = PortPoolRegistry::build(&cfg(), 1024, Duration::from_secs(300), 1 << 20, Some(&reg1));
        assert_eq!(reg2.pools[0].active_conns(), 1);
    }
}

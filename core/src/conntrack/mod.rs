//! Connection pool & per-connection state (spec.md §4.3).
//!
//! Grounded on the teacher's `conntrack::mod::ConnTracker<T>`: a `hashlink::LinkedHashMap` keyed by
//! connection identifier, probed with `raw_entry_mut` so lookup and insert share one hash
//! computation. Unlike the teacher (one `ConnTracker` per core, `TimerWheel`-bucketed expiry), this
//! pool is per-[`crate::portpool::PortPool`] and sweeps expiry with a plain O(n) pass, per spec.md
//! §4.3: "`remove_expired(ttl)` — sweep; O(n) is acceptable".

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};
use log::debug;

use crate::decoder::{DecodeError, Decoder};
use crate::matcher::{MultiplexedMatcher, Pair, SingleMatcher};
use crate::packet::{Direction, L4Packet};
use crate::roundtrip::RoundTrip;
use crate::stats::Stats;
use crate::tuple::{ConnKey, Tuple};

/// Byte/packet counters for one connection (spec.md §3 `Connection.stats`).
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnStats {
    pub packets_c2s: u64,
    pub packets_s2c: u64,
    pub bytes_c2s: u64,
    pub bytes_s2c: u64,
}

impl ConnStats {
    pub fn total_packets(&self) -> u64 {
        self.packets_c2s + self.packets_s2c
    }
}

/// Whether a protocol pairs by FIFO order or by an explicit id (spec.md §4.5).
pub enum Matcher {
    Single(SingleMatcher),
    Multiplexed(MultiplexedMatcher),
}

impl Matcher {
    fn push(&mut self, object: crate::decoder::Object, now: Instant) -> Option<Pair> {
        match self {
            Matcher::Single(m) => m.push(object),
            Matcher::Multiplexed(m) => m.push(object, now),
        }
    }
}

/// Per-tuple connection state: two directional streams, two decoders, and a matcher (spec.md §3).
pub struct Connection {
    pub tuple: Tuple,
    pub server_port: u16,
    /// The server's IP address, resolved once at construction from whichever endpoint of the
    /// first-observed packet's tuple carries `server_port` — fixed for the connection's lifetime
    /// regardless of whether that first packet happened to be client→server or server→client
    /// (spec.md:63, round-trip `Side.host` must name the server, not whichever peer spoke first).
    pub server_ip: std::net::IpAddr,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub stats: ConnStats,
    client_stream: crate::stream::Stream,
    server_stream: crate::stream::Stream,
    decoder_c2s: Box<dyn Decoder>,
    decoder_s2c: Box<dyn Decoder>,
    matcher: Matcher,
}

/// Result of feeding one packet through a connection (spec.md §4.1 algorithm).
pub enum PacketOutcome {
    Continue,
    Closed,
}

impl Connection {
    pub fn new(
        tuple: Tuple,
        server_port: u16,
        decoder_c2s: Box<dyn Decoder>,
        decoder_s2c: Box<dyn Decoder>,
        matcher: Matcher,
        max_message_size: usize,
        now: Instant,
    ) -> Self {
        let server_ip = if tuple.dst_port == server_port { tuple.dst_ip } else { tuple.src_ip };
        Connection {
            tuple,
            server_port,
            server_ip,
            created_at: now,
            last_seen: now,
            stats: ConnStats::default(),
            client_stream: crate::stream::Stream::new(max_message_size),
            server_stream: crate::stream::Stream::new(max_message_size),
            decoder_c2s,
            decoder_s2c,
            matcher,
        }
    }

    /// Feeds one packet through this connection's stream/decoder/matcher pipeline (spec.md §4.3
    /// `Connection.on_packet`). Matched round-trips are sent non-blockingly on `rt_tx`; a full
    /// channel drops the round-trip rather than backpressuring capture.
    pub fn on_packet(&mut self, pkt: &L4Packet, rt_tx: &Sender<RoundTrip>) -> PacketOutcome {
        self.last_seen = pkt.timestamp;
        match pkt.direction {
            Direction::ClientToServer => {
                self.stats.packets_c2s += 1;
                self.stats.bytes_c2s += pkt.payload.len() as u64;
            }
            Direction::ServerToClient => {
                self.stats.packets_s2c += 1;
                self.stats.bytes_s2c += pkt.payload.len() as u64;
            }
        }

        let (stream, decoder) = match pkt.direction {
            Direction::ClientToServer => (&mut self.client_stream, &mut self.decoder_c2s),
            Direction::ServerToClient => (&mut self.server_stream, &mut self.decoder_s2c),
        };

        // Each decoder internally loops over as many complete frames as `data` allows and reports
        // the total bytes consumed (spec.md §4.4), so one append/decode/commit cycle per packet
        // suffices here.
        let cursor = stream.append(pkt.payload);
        let total_len = cursor.len();
        let slice = cursor.as_slice().to_vec();
        match decoder.decode(&slice, pkt.timestamp) {
            Ok(outcome) => {
                let consumed = outcome.consumed;
                let remainder = &slice[consumed.min(slice.len())..];
                if stream.commit(total_len, consumed, remainder).is_err() {
                    debug!("{}: stream overflow, resetting", self.tuple);
                    stream.reset();
                }
                for object in outcome.objects {
                    if let Some(pair) = self.matcher.push(object, pkt.timestamp) {
                        if let Some(rt) = RoundTrip::from_pair(pair, self.server_ip, self.server_port, pkt.timestamp, std::time::SystemTime::now()) {
                            let _ = rt_tx.try_send(rt);
                        }
                    }
                }
                PacketOutcome::Continue
            }
            Err(DecodeError::ConnClosed) => PacketOutcome::Closed,
            Err(DecodeError::InvalidBytes) => {
                debug!("{}: decoder reset after invalid bytes", self.tuple);
                stream.reset();
                PacketOutcome::Continue
            }
        }
    }
}

/// A map of `Tuple -> Connection` for one [`crate::portpool::PortPool`] (spec.md §4.3 Pool
/// operations), guarded for concurrent callers on different tuples.
pub struct ConnectionPool {
    table: Mutex<LinkedHashMap<ConnKey, Connection>>,
    max_connections: usize,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        ConnectionPool {
            table: Mutex::new(LinkedHashMap::with_capacity(max_connections.min(1024))),
            max_connections,
        }
    }

    /// Returns the existing connection for `tuple`'s key, or constructs one via `make` (spec.md
    /// §4.3 `get_or_create`). `make` is only invoked on a miss.
    ///
    /// A connection removed here because its decoder reported `DecodeError::ConnClosed` has its
    /// `ConnStats` snapshotted into `stats` under `proto` first (spec.md:63 "snapshot conn.stats()
    /// into metrics and pool.delete(tuple)").
    pub fn get_or_create_and_feed(
        &self,
        tuple: Tuple,
        server_port: u16,
        pkt: &L4Packet,
        rt_tx: &Sender<RoundTrip>,
        stats: &Stats,
        proto: &str,
        make: impl FnOnce() -> Connection,
    ) -> PacketOutcome {
        let mut table = self.table.lock().unwrap();
        let key = tuple.key();
        match table.raw_entry_mut().from_key(&key) {
            RawEntryMut::Occupied(mut occ) => {
                let outcome = occ.get_mut().on_packet(pkt, rt_tx);
                if matches!(outcome, PacketOutcome::Closed) {
                    stats.record_closed_connection(proto, &occ.get().stats);
                    occ.remove();
                }
                outcome
            }
            RawEntryMut::Vacant(_) => {
                if table.len() >= self.max_connections {
                    log::warn!("connection pool full ({} conns), dropping packet", self.max_connections);
                    return PacketOutcome::Continue;
                }
                let mut conn = make();
                let outcome = conn.on_packet(pkt, rt_tx);
                if matches!(outcome, PacketOutcome::Closed) {
                    stats.record_closed_connection(proto, &conn.stats);
                } else {
                    table.insert(key, conn);
                }
                let _ = server_port;
                outcome
            }
        }
    }

    /// Removes connections whose `last_seen` is older than `ttl` (spec.md §4.3
    /// `remove_expired(ttl)`). Snapshots keys first so expiry decisions don't hold the lock for
    /// the whole sweep (spec.md §5), then snapshots each removed connection's `ConnStats` into
    /// `stats` under `proto` before it's dropped (spec.md §8 S5).
    pub fn remove_expired(&self, ttl: Duration, now: Instant, stats: &Stats, proto: &str) -> usize {
        let mut table = self.table.lock().unwrap();
        let expired: Vec<ConnKey> = table
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(conn) = table.remove(key) {
                stats.record_closed_connection(proto, &conn.stats);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates stats for all live connections (spec.md §4.2 `range_pool_stats`).
    pub fn for_each_stats(&self, mut f: impl FnMut(&Tuple, &ConnStats)) {
        let table = self.table.lock().unwrap();
        for conn in table.values() {
            f(&conn.tuple, &conn.stats);
        }
    }

    pub fn drain(&self) {
        self.table.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::http::HttpDecoder;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple() -> Tuple {
        Tuple::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5555,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            crate::tuple::L4Proto::Tcp,
        )
    }

    fn http_connection(now: Instant) -> Connection {
        Connection::new(
            tuple(),
            80,
            Box::new(HttpDecoder::new(false)),
            Box::new(HttpDecoder::new(true)),
            Matcher::Single(SingleMatcher::new()),
            1 << 20,
            now,
        )
    }

    /// spec.md:63: `Side.host`/`Side.port` must name the server, even when the server speaks
    /// first (e.g. MySQL's unsolicited handshake greeting) so the connection's very first packet
    /// is server→client. The first-observed tuple's `dst_ip`/`dst_port` are the *client*'s
    /// address in that case; `server_ip` must still resolve to the real server.
    #[test]
    fn server_ip_resolves_correctly_when_server_speaks_first() {
        let client_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let server_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        // This packet's tuple is from the server's perspective: src = server:3306, dst =
        // client:5555. dst_port (5555) != server_port (3306).
        let first_packet_tuple = Tuple::new(server_ip, 3306, client_ip, 5555, crate::tuple::L4Proto::Tcp);
        let conn = Connection::new(
            first_packet_tuple,
            3306,
            Box::new(HttpDecoder::new(false)),
            Box::new(HttpDecoder::new(true)),
            Matcher::Single(SingleMatcher::new()),
            1 << 20,
            Instant::now(),
        );
        assert_eq!(conn.server_ip, server_ip);
        assert_eq!(conn.server_port, 3306);
    }

    /// S5: a connection idle past `conn_expired` is swept, its stats are readable right up until
    /// the sweep removes it, and the sweep snapshots those stats into `Stats` before deletion
    /// (spec.md §8 S5: "assert... its stats are captured in metrics before deletion").
    #[test]
    fn sweep_removes_expired_connection_after_recording_its_stats() {
        let pool = ConnectionPool::new(16);
        let stats = Stats::new();
        let t0 = Instant::now();
        let (tx, _rx) = crossbeam::channel::bounded(8);
        let payload = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let pkt = L4Packet {
            tuple: tuple(),
            direction: Direction::ClientToServer,
            payload,
            timestamp: t0,
        };
        pool.get_or_create_and_feed(tuple(), 80, &pkt, &tx, &stats, "http", || http_connection(t0));
        assert_eq!(pool.len(), 1);

        let mut seen_packets = 0;
        pool.for_each_stats(|_, stats| seen_packets = stats.total_packets());
        assert_eq!(seen_packets, 1);

        let ttl = Duration::from_secs(60);
        let past_expiry = t0 + ttl + Duration::from_secs(1);
        let removed = pool.remove_expired(ttl, past_expiry, &stats, "http");
        assert_eq!(removed, 1);
        assert!(pool.is_empty());

        let text = stats.encode_text();
        assert!(text.contains("flowwatch_closed_connections"));
        assert!(text.contains("flowwatch_closed_connection_packets"));
        assert!(text.contains("proto=\"http\""));
    }

    /// `ConnClosed` (a decoder reporting end-of-connection, e.g. a TCP FIN-driven close) also
    /// snapshots stats before the connection leaves the table, not only the expiry sweep path.
    #[test]
    fn conn_closed_outcome_records_stats_before_removal() {
        use crate::decoder::{DecodeError, Decoder, DecodeOutcome};

        struct CloseOnFirstByte;
        impl Decoder for CloseOnFirstByte {
            fn decode(&mut self, _data: &[u8], _now: Instant) -> Result<DecodeOutcome, DecodeError> {
                Err(DecodeError::ConnClosed)
            }
        }

        let pool = ConnectionPool::new(16);
        let stats = Stats::new();
        let t0 = Instant::now();
        let (tx, _rx) = crossbeam::channel::bounded(8);
        let payload = b"x";
        let pkt = L4Packet {
            tuple: tuple(),
            direction: Direction::ClientToServer,
            payload,
            timestamp: t0,
        };
        let outcome = pool.get_or_create_and_feed(tuple(), 80, &pkt, &tx, &stats, "http", || {
            Connection::new(
                tuple(),
                80,
                Box::new(CloseOnFirstByte),
                Box::new(CloseOnFirstByte),
                Matcher::Single(SingleMatcher::new()),
                1 << 20,
                t0,
            )
        });
        assert!(matches!(outcome, PacketOutcome::Closed));
        assert!(pool.is_empty());
        let text = stats.encode_text();
        assert!(text.contains("flowwatch_closed_connections"));
        assert!(text.contains("proto=\"http\""));
    }
}

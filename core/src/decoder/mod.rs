//! Layer-7 decoders.
//!
//! Mirrors the teacher's `protocols::stream` module: each protocol owns a parser type and a
//! transaction type, implementing a shared capability trait (`ConnParsable` in the teacher;
//! [`Decoder`] here) so the connection pool can hold one per direction without knowing which
//! protocol it is. Request/Response payloads are modeled as a tagged sum, per spec.md §9
//! "Polymorphic decoders".

pub mod amqp;
pub mod dns;
pub mod grpc;
pub mod http;
pub mod http2;
pub mod kafka;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod redis;

use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

/// Errors a decoder may return from [`Decoder::decode`], per spec.md §7's error taxonomy.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame structure unrecognized; the decoder has reset its per-request state.
    #[error("invalid bytes in frame")]
    InvalidBytes,
    /// The protocol signaled connection termination; the pool should delete the connection.
    #[error("connection closed by protocol")]
    ConnClosed,
}

/// Result of one `decode` call: zero or more completed objects, plus how many bytes of the input
/// were consumed (spec.md §4.3 step 4: the caller commits the stream by this amount).
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub objects: Vec<Object>,
    pub consumed: usize,
}

impl DecodeOutcome {
    pub fn none(consumed: usize) -> Self {
        DecodeOutcome {
            objects: Vec::new(),
            consumed,
        }
    }
}

/// The phase state machine common to framed binary protocols (spec.md §4.4).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    DecodeHeader,
    DecodePayload,
}

/// Tracks consecutive decode failures so a decoder can self-recover once, then give up and
/// propagate `InvalidBytes` on the second failure (spec.md §4.4 restart discipline).
#[derive(Debug, Default)]
pub struct FailureCounter {
    strikes: u8,
}

impl FailureCounter {
    pub fn new() -> Self {
        FailureCounter { strikes: 0 }
    }

    /// Records a failure. Returns `true` once this is the second consecutive failure, at which
    /// point the caller must reset its phase state and propagate `InvalidBytes`.
    pub fn strike(&mut self) -> bool {
        self.strikes = self.strikes.saturating_add(1);
        self.strikes >= 2
    }

    pub fn clear(&mut self) {
        self.strikes = 0;
    }
}

/// A decoder output: a completed request or response. `size` is the number of wire bytes drained
/// (including framing) to produce it.
#[derive(Debug)]
pub enum Object {
    Request(Message),
    Response(Message),
}

impl Object {
    pub fn time(&self) -> Instant {
        match self {
            Object::Request(m) | Object::Response(m) => m.time,
        }
    }

    /// A multiplexing id, for protocols using the `MultiplexedMatcher` (spec.md §4.5): HTTP/2
    /// stream id, gRPC stream id, Kafka correlation id, DNS transaction id, AMQP correlation tag.
    pub fn match_id(&self) -> Option<u64> {
        match self {
            Object::Request(m) | Object::Response(m) => m.payload.match_id(),
        }
    }
}

/// One decoded message: a timestamped, sized, protocol-specific payload.
#[derive(Debug, Serialize)]
pub struct Message {
    pub payload: Payload,
    pub time: Instant,
    pub size: usize,
}

/// Protocol-specific payload, tagged by protocol (spec.md §9: "Model as a tagged sum").
#[derive(Debug, Serialize)]
#[serde(tag = "proto", content = "packet")]
pub enum Payload {
    Http(http::HttpMessage),
    Mysql(mysql::MysqlPacket),
    Postgres(postgres::PostgresPacket),
    Dns(dns::DnsPacket),
    Http2(http2::Http2Frame),
    Grpc(grpc::GrpcFrame),
    Redis(redis::RespValue),
    Amqp(amqp::AmqpFrame),
    Kafka(kafka::KafkaFrame),
    Mongodb(mongodb::MongoMessage),
}

impl Payload {
    fn match_id(&self) -> Option<u64> {
        match self {
            Payload::Http2(f) => Some(f.stream_id as u64),
            Payload::Grpc(f) => Some(f.stream_id as u64),
            Payload::Kafka(f) => Some(f.correlation_id as u64),
            Payload::Dns(p) => Some(p.transaction_id as u64),
            Payload::Amqp(f) => f.correlation_id,
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::Http(_) => "http",
            Payload::Mysql(_) => "mysql",
            Payload::Postgres(_) => "postgres",
            Payload::Dns(_) => "dns",
            Payload::Http2(_) => "http2",
            Payload::Grpc(_) => "grpc",
            Payload::Redis(_) => "redis",
            Payload::Amqp(_) => "amqp",
            Payload::Kafka(_) => "kafka",
            Payload::Mongodb(_) => "mongodb",
        }
    }
}

/// A per-connection, per-direction decoder instance. One instance is owned per direction (spec.md
/// §4.4: "Decoders see packets in only one direction per instance").
pub trait Decoder: Send {
    fn decode(&mut self, data: &[u8], time: Instant) -> Result<DecodeOutcome, DecodeError>;
}

/// Whether a protocol pairs requests/responses by FIFO order or by an explicit id (spec.md §4.5).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MatcherKind {
    Single,
    Multiplexed,
}

/// Truncates a byte slice to `max` bytes, matching spec.md §4.4's truncation-cap requirement for
/// unbounded string fields (e.g. SQL statements at 1024 bytes, error messages at 256).
pub fn truncate(bytes: &[u8], max: usize) -> &[u8] {
    if bytes.len() > max {
        &bytes[..max]
    } else {
        bytes
    }
}

/// Truncates at the first LF (if any is within `max` bytes) or at `max` bytes, replacing any
/// remaining LF with a space (spec.md §4.4.1: MySQL statement truncation).
pub fn truncate_statement(bytes: &[u8], max: usize) -> String {
    let capped = truncate(bytes, max);
    let s = String::from_utf8_lossy(capped);
    s.replace('\n', " ").replace('\r', "")
}

/// Truncates at the first LF or at `max` bytes, for error messages (spec.md §4.4.1/§4.4.2).
pub fn truncate_to_line(bytes: &[u8], max: usize) -> String {
    let capped = truncate(bytes, max);
    let line = match capped.iter().position(|&b| b == b'\n') {
        Some(i) => &capped[..i],
        None => capped,
    };
    String::from_utf8_lossy(line).to_string()
}

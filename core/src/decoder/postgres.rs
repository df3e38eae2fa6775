//! PostgreSQL frontend/backend protocol decoder (spec.md §4.4.2).
//!
//! Frame header is 5 bytes: a 1-byte type tag followed by a 4-byte big-endian length (inclusive of
//! the length field itself). The very first client message may be a tag-less `StartupMessage`.

use std::time::Instant;

use hashlink::LinkedHashMap;
use serde::Serialize;

use super::{truncate_statement, truncate_to_line, DecodeError, DecodeOutcome, FailureCounter, Message, Object, Payload, Phase};

const MAX_STATEMENT: usize = 1024;
const MAX_ERROR_MSG: usize = 256;
const STATEMENT_CACHE_CAP: usize = 16;
/// Upper bound on a single message's declared payload length (the 4-byte length field is
/// wire-controlled and otherwise unbounded); exceeding it resets the decoder rather than
/// accumulating an attacker-sized buffer in `self.msg`.
const MAX_PAYLOAD: usize = 1 << 20;
const STARTUP_VERSION: u32 = 0x0003_0000;
/// Codes sent in place of a genuine `StartupMessage`'s version field: `SSLRequest`,
/// `GSSENCRequest`, `CancelRequest` (spec.md §4.4.2). None of these start a real session, so the
/// decoder keeps waiting for the actual `StartupMessage` that follows.
const SSL_REQUEST_CODE: u32 = 80_877_103;
const GSSENC_REQUEST_CODE: u32 = 80_877_104;
const CANCEL_REQUEST_CODE: u32 = 80_877_102;

#[derive(Debug, Serialize)]
pub enum PostgresPacket {
    Query {
        statement: String,
    },
    Parse {
        name: String,
        statement: String,
    },
    Bind {
        portal: String,
        statement: String,
    },
    Describe {
        target: char,
        name: String,
    },
    CommandComplete {
        command: String,
        rows: u64,
    },
    ErrorResponse {
        severity: String,
        code: String,
        message: String,
    },
    FlagPacket {
        flag: char,
    },
}

enum HeaderKind {
    Startup,
    Tagged(u8),
}

pub struct PostgresDecoder {
    is_client: bool,
    phase: Phase,
    kind: Option<HeaderKind>,
    payload_len: usize,
    msg: Vec<u8>,
    frame_time: Option<Instant>,
    seen_startup: bool,
    failures: FailureCounter,
    /// Named-statement cache shared only within this decoder instance; bound per spec.md §4.4.2.
    statements: LinkedHashMap<String, String>,
}

impl PostgresDecoder {
    pub fn new(is_client: bool) -> Self {
        PostgresDecoder {
            is_client,
            phase: Phase::DecodeHeader,
            kind: None,
            payload_len: 0,
            msg: Vec::new(),
            frame_time: None,
            seen_startup: !is_client,
            failures: FailureCounter::new(),
            statements: LinkedHashMap::new(),
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::DecodeHeader;
        self.kind = None;
        self.msg.clear();
        self.frame_time = None;
    }

    fn remember_statement(&mut self, name: String, query: String) {
        if self.statements.len() >= STATEMENT_CACHE_CAP {
            let oldest = self.statements.keys().next().cloned();
            if let Some(k) = oldest {
                self.statements.remove(&k);
            }
        }
        self.statements.insert(name, query);
    }

    fn handle_client(&mut self, tag: u8, body: &[u8]) -> Option<PostgresPacket> {
        match tag {
            b'Q' => {
                let statement = truncate_statement(strip_nul(body), MAX_STATEMENT);
                Some(PostgresPacket::Query { statement })
            }
            b'P' => {
                let mut parts = split_nul_fields(body, 2);
                let name = parts.remove(0);
                let query = truncate_statement(parts.remove(0).as_bytes(), MAX_STATEMENT);
                self.remember_statement(name.clone(), query.clone());
                Some(PostgresPacket::Parse {
                    name,
                    statement: query,
                })
            }
            b'B' => {
                let mut parts = split_nul_fields(body, 2);
                let portal = parts.remove(0);
                let stmt_name = parts.remove(0);
                let statement = self
                    .statements
                    .get(&stmt_name)
                    .cloned()
                    .unwrap_or_default();
                Some(PostgresPacket::Bind { portal, statement })
            }
            b'D' => {
                let target = *body.first().unwrap_or(&0) as char;
                let name = body.get(1..).map(strip_nul).map(|b| String::from_utf8_lossy(b).to_string()).unwrap_or_default();
                Some(PostgresPacket::Describe { target, name })
            }
            b'E' | b'C' => None,
            _ => None,
        }
    }

    fn handle_server(&mut self, tag: u8, body: &[u8]) -> Option<PostgresPacket> {
        match tag {
            b'C' => {
                let text = String::from_utf8_lossy(strip_nul(body));
                let (command, rows) = parse_command_tag(&text);
                Some(PostgresPacket::CommandComplete { command, rows })
            }
            b'E' => {
                let mut severity = String::new();
                let mut code = String::new();
                let mut message = String::new();
                let mut i = 0;
                while i < body.len() && body[i] != 0 {
                    let field = body[i];
                    i += 1;
                    let start = i;
                    while i < body.len() && body[i] != 0 {
                        i += 1;
                    }
                    let value = String::from_utf8_lossy(&body[start..i]).to_string();
                    i += 1; // skip NUL
                    match field {
                        b'S' => severity = value,
                        b'C' => code = value,
                        b'M' => message = truncate_to_line(value.as_bytes(), MAX_ERROR_MSG),
                        _ => {}
                    }
                }
                Some(PostgresPacket::ErrorResponse {
                    severity,
                    code,
                    message,
                })
            }
            b'D' | b'3' | b'1' | b'2' => Some(PostgresPacket::FlagPacket { flag: tag as char }),
            _ => None,
        }
    }
}

impl super::Decoder for PostgresDecoder {
    fn decode(&mut self, data: &[u8], time: Instant) -> Result<DecodeOutcome, DecodeError> {
        let mut pos = 0;
        let mut objects = Vec::new();
        loop {
            match self.phase {
                Phase::DecodeHeader => {
                    let remaining = &data[pos..];
                    if self.is_client && !self.seen_startup {
                        if remaining.len() < 4 {
                            break;
                        }
                        let len = u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]) as usize;
                        if len < 8 || len - 4 > MAX_PAYLOAD {
                            self.reset();
                            if self.failures.strike() {
                                self.failures.clear();
                                return Err(DecodeError::InvalidBytes);
                            }
                            pos += 4;
                            continue;
                        }
                        self.kind = Some(HeaderKind::Startup);
                        self.payload_len = len - 4;
                        pos += 4;
                        self.frame_time.get_or_insert(time);
                        self.phase = Phase::DecodePayload;
                        continue;
                    }
                    if remaining.len() < 5 {
                        break;
                    }
                    let tag = remaining[0];
                    let len = u32::from_be_bytes([remaining[1], remaining[2], remaining[3], remaining[4]]) as usize;
                    if len < 4 || len - 4 > MAX_PAYLOAD {
                        self.reset();
                        if self.failures.strike() {
                            self.failures.clear();
                            return Err(DecodeError::InvalidBytes);
                        }
                        pos += 5;
                        continue;
                    }
                    self.kind = Some(HeaderKind::Tagged(tag));
                    self.payload_len = len - 4;
                    pos += 5;
                    self.frame_time.get_or_insert(time);
                    self.phase = Phase::DecodePayload;
                }
                Phase::DecodePayload => {
                    let remaining = &data[pos..];
                    let have = self.msg.len();
                    let need = self.payload_len.saturating_sub(have);
                    let take = need.min(remaining.len());
                    self.msg.extend_from_slice(&remaining[..take]);
                    pos += take;
                    if self.msg.len() < self.payload_len {
                        break;
                    }
                    let body = std::mem::take(&mut self.msg);
                    let kind = self.kind.take();
                    // Request.time is the earliest contributing byte; Response.time is the
                    // latest (spec.md §4.4).
                    let start = if self.is_client {
                        self.frame_time.take().unwrap_or(time)
                    } else {
                        self.frame_time.take();
                        time
                    };
                    let size = match kind {
                        Some(HeaderKind::Startup) => 4 + body.len(),
                        Some(HeaderKind::Tagged(_)) => 5 + body.len(),
                        None => body.len(),
                    };
                    self.phase = Phase::DecodeHeader;
                    self.failures.clear();

                    match kind {
                        Some(HeaderKind::Startup) => {
                            let version = body
                                .get(0..4)
                                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                                .unwrap_or(0);
                            match version {
                                STARTUP_VERSION => {
                                    self.seen_startup = true;
                                }
                                SSL_REQUEST_CODE | GSSENC_REQUEST_CODE | CANCEL_REQUEST_CODE => {
                                    // Not a genuine session start; the real StartupMessage (or a
                                    // fresh connection, for CancelRequest) follows.
                                }
                                _ => {
                                    log::debug!("postgres: unrecognized startup version 0x{:08x}", version);
                                    self.seen_startup = true;
                                }
                            }
                        }
                        Some(HeaderKind::Tagged(tag)) => {
                            let pkt = if self.is_client {
                                self.handle_client(tag, &body)
                            } else {
                                self.handle_server(tag, &body)
                            };
                            if let Some(pkt) = pkt {
                                let msg = Message {
                                    payload: Payload::Postgres(pkt),
                                    time: start,
                                    size,
                                };
                                objects.push(if self.is_client {
                                    Object::Request(msg)
                                } else {
                                    Object::Response(msg)
                                });
                            }
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(DecodeOutcome {
            objects,
            consumed: pos,
        })
    }
}

fn strip_nul(body: &[u8]) -> &[u8] {
    match body.iter().position(|&b| b == 0) {
        Some(i) => &body[..i],
        None => body,
    }
}

/// Splits a NUL-delimited byte string into up to `max` fields (spec.md §4.4.2 `P`/`B` message
/// bodies: `name \0 value \0 ...`).
fn split_nul_fields(body: &[u8], max: usize) -> Vec<String> {
    let mut fields = Vec::new();
    let mut start = 0;
    for (i, &b) in body.iter().enumerate() {
        if b == 0 {
            fields.push(String::from_utf8_lossy(&body[start..i]).to_string());
            start = i + 1;
            if fields.len() == max {
                break;
            }
        }
    }
    while fields.len() < max {
        fields.push(String::new());
    }
    fields
}

/// Parses a PostgreSQL `CommandComplete` tag like `"SELECT 3"` or `"INSERT 0 1"`: the command verb
/// and the trailing row count.
fn parse_command_tag(text: &str) -> (String, u64) {
    let parts: Vec<&str> = text.split_whitespace().collect();
    let command = parts.first().map(|s| s.to_string()).unwrap_or_default();
    let rows = parts.last().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
    (command, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder as _;

    fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![tag];
        frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn extended_query_round_trip() {
        let mut client = PostgresDecoder::new(true);
        let mut parse_body = b"s1\0".to_vec();
        parse_body.extend_from_slice(b"SELECT $1\0");
        parse_body.extend_from_slice(&[0, 0]); // param count
        let parse = tagged(b'P', &parse_body);
        let out = client.decode(&parse, Instant::now()).unwrap();
        assert_eq!(out.objects.len(), 1);

        let mut bind_body = b"\0".to_vec(); // unnamed portal
        bind_body.extend_from_slice(b"s1\0");
        let bind = tagged(b'B', &bind_body);
        let out = client.decode(&bind, Instant::now()).unwrap();
        match &out.objects[0] {
            Object::Request(m) => match &m.payload {
                Payload::Postgres(PostgresPacket::Bind { statement, .. }) => {
                    assert_eq!(statement, "SELECT $1");
                }
                _ => panic!("wrong payload"),
            },
            _ => panic!("expected request"),
        }

        let mut server = PostgresDecoder::new(false);
        let complete = tagged(b'C', b"SELECT 1\0");
        let out = server.decode(&complete, Instant::now()).unwrap();
        match &out.objects[0] {
            Object::Response(m) => match &m.payload {
                Payload::Postgres(PostgresPacket::CommandComplete { command, rows }) => {
                    assert_eq!(command, "SELECT");
                    assert_eq!(*rows, 1);
                }
                _ => panic!("wrong payload"),
            },
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn sslrequest_does_not_consume_the_real_startup_message() {
        let mut client = PostgresDecoder::new(true);

        let mut sslrequest = 8u32.to_be_bytes().to_vec();
        sslrequest.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        let out = client.decode(&sslrequest, Instant::now()).unwrap();
        assert!(out.objects.is_empty());
        assert!(!client.seen_startup, "SSLRequest must not be treated as the real StartupMessage");

        let mut startup_body = STARTUP_VERSION.to_be_bytes().to_vec();
        startup_body.extend_from_slice(b"user\0postgres\0\0");
        let mut startup = ((startup_body.len() + 4) as u32).to_be_bytes().to_vec();
        startup.extend_from_slice(&startup_body);
        let out = client.decode(&startup, Instant::now()).unwrap();
        assert!(out.objects.is_empty());
        assert!(client.seen_startup);

        let query = tagged(b'Q', b"SELECT 1\0");
        let out = client.decode(&query, Instant::now()).unwrap();
        assert_eq!(out.objects.len(), 1);
    }

    /// A forged, oversized length field must reset the decoder (and eventually force a stream
    /// reset via `FailureCounter`) instead of growing `self.msg` without bound.
    #[test]
    fn oversized_declared_length_is_rejected_not_accumulated() {
        let mut server = PostgresDecoder::new(false);
        let mut frame = vec![b'C'];
        frame.extend_from_slice(&((MAX_PAYLOAD + 4 + 1) as u32).to_be_bytes());
        frame.extend_from_slice(b"only a few bytes follow");
        let out = server.decode(&frame, Instant::now()).unwrap();
        assert!(out.objects.is_empty());
        assert_eq!(server.msg.len(), 0);
    }
}

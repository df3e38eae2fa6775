//! Redis RESP decoder (spec.md §4.4.3: "Redis is RESP-framed").
//!
//! A structurally faithful but lighter-fidelity decoder: arrays/bulk-strings/simple values are
//! framed correctly (so the stream stays bounded), but nested array elements are captured as their
//! raw bytes rather than fully recursively typed.

use std::time::Instant;

use memchr::memmem;
use serde::Serialize;

use super::{DecodeError, DecodeOutcome, FailureCounter, Message, Object, Payload};

/// Upper bound on a bulk string's declared length (the `$<len>\r\n` prefix is wire-controlled and
/// otherwise unbounded); a declared length past this is treated as malformed input rather than
/// accumulated in `self.buf` while waiting for bytes that may never arrive.
const MAX_BULK_LEN: i64 = 1 << 20;

#[derive(Debug, Serialize)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<String>),
    Array(Vec<String>),
}

pub struct RedisDecoder {
    is_client: bool,
    buf: Vec<u8>,
    frame_time: Option<Instant>,
    failures: FailureCounter,
}

impl RedisDecoder {
    pub fn new(is_client: bool) -> Self {
        RedisDecoder {
            is_client,
            buf: Vec::new(),
            frame_time: None,
            failures: FailureCounter::new(),
        }
    }
}

/// Attempts to parse one complete RESP value starting at the front of `buf`. Returns
/// `(value, bytes_consumed)` or `None` if more data is needed.
fn try_parse(buf: &[u8]) -> Result<Option<(RespValue, usize)>, ()> {
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        b'+' | b'-' | b':' => {
            let Some(end) = memmem::find(buf, b"\r\n") else {
                return Ok(None);
            };
            let text = std::str::from_utf8(&buf[1..end]).map_err(|_| ())?.to_string();
            let consumed = end + 2;
            let value = match buf[0] {
                b'+' => RespValue::Simple(text),
                b'-' => RespValue::Error(text),
                b':' => RespValue::Integer(text.parse().map_err(|_| ())?),
                _ => unreachable!(),
            };
            Ok(Some((value, consumed)))
        }
        b'$' => {
            let Some(end) = memmem::find(buf, b"\r\n") else {
                return Ok(None);
            };
            let len: i64 = std::str::from_utf8(&buf[1..end]).map_err(|_| ())?.parse().map_err(|_| ())?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), end + 2)));
            }
            if len > MAX_BULK_LEN {
                return Err(());
            }
            let data_start = end + 2;
            let data_end = data_start + len as usize;
            if buf.len() < data_end + 2 {
                return Ok(None);
            }
            let s = String::from_utf8_lossy(&buf[data_start..data_end]).to_string();
            Ok(Some((RespValue::Bulk(Some(s)), data_end + 2)))
        }
        b'*' => {
            let Some(end) = memmem::find(buf, b"\r\n") else {
                return Ok(None);
            };
            let count: i64 = std::str::from_utf8(&buf[1..end]).map_err(|_| ())?.parse().map_err(|_| ())?;
            let mut pos = end + 2;
            let mut elems = Vec::new();
            if count < 0 {
                return Ok(Some((RespValue::Array(elems), pos)));
            }
            for _ in 0..count {
                match try_parse(&buf[pos..])? {
                    Some((v, used)) => {
                        pos += used;
                        elems.push(render(&v));
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(elems), pos)))
        }
        _ => Err(()),
    }
}

fn render(v: &RespValue) -> String {
    match v {
        RespValue::Simple(s) | RespValue::Error(s) => s.clone(),
        RespValue::Integer(i) => i.to_string(),
        RespValue::Bulk(Some(s)) => s.clone(),
        RespValue::Bulk(None) => String::new(),
        RespValue::Array(items) => items.join(" "),
    }
}

impl super::Decoder for RedisDecoder {
    fn decode(&mut self, data: &[u8], time: Instant) -> Result<DecodeOutcome, DecodeError> {
        self.buf.extend_from_slice(data);
        if self.frame_time.is_none() {
            self.frame_time = Some(time);
        }
        let mut objects = Vec::new();
        let mut consumed_total = 0;
        loop {
            match try_parse(&self.buf[consumed_total..]) {
                Ok(Some((value, used))) => {
                    consumed_total += used;
                    self.failures.clear();
                    let start = self.frame_time.take().unwrap_or(time);
                    let msg = Message {
                        payload: Payload::Redis(value),
                        time: if self.is_client { start } else { time },
                        size: used,
                    };
                    objects.push(if self.is_client {
                        Object::Request(msg)
                    } else {
                        Object::Response(msg)
                    });
                }
                Ok(None) => break,
                Err(()) => {
                    self.buf.drain(..consumed_total);
                    self.buf.clear();
                    self.frame_time = None;
                    if self.failures.strike() {
                        self.failures.clear();
                        return Err(DecodeError::InvalidBytes);
                    }
                    return Ok(DecodeOutcome {
                        objects,
                        consumed: data.len(),
                    });
                }
            }
        }
        self.buf.drain(..consumed_total);
        Ok(DecodeOutcome {
            objects,
            consumed: data.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder as _;

    #[test]
    fn simple_command_round_trip() {
        let mut dec = RedisDecoder::new(true);
        let out = dec.decode(b"*1\r\n$4\r\nPING\r\n", Instant::now()).unwrap();
        assert_eq!(out.objects.len(), 1);
        match &out.objects[0] {
            Object::Request(m) => match &m.payload {
                Payload::Redis(RespValue::Array(items)) => assert_eq!(items, &["PING"]),
                _ => panic!("wrong payload"),
            },
            _ => panic!("expected request"),
        }
    }

    /// A bulk string declaring a length far past `MAX_BULK_LEN` must be rejected rather than
    /// leaving the decoder waiting indefinitely for bytes that will never arrive while `self.buf`
    /// grows unbounded.
    #[test]
    fn oversized_bulk_length_is_rejected() {
        let mut dec = RedisDecoder::new(true);
        let forged = format!("${}\r\n", MAX_BULK_LEN + 1);
        let out = dec.decode(forged.as_bytes(), Instant::now());
        assert!(out.is_ok());
        assert!(out.unwrap().objects.is_empty());
        assert!(dec.buf.is_empty(), "buffer must be cleared, not left growing toward the forged length");
    }
}

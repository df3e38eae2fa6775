//! Kafka decoder (spec.md §4.4.3: "Kafka is length-prefixed").
//!
//! Each message is a 4-byte big-endian length prefix followed by the message body. Requests lead
//! with `{api_key: i16, api_version: i16, correlation_id: i32}`; responses lead with just
//! `correlation_id`. Lighter fidelity: request/response bodies beyond these header fields are not
//! decoded.

use std::time::Instant;

use serde::Serialize;

use super::{DecodeError, DecodeOutcome, FailureCounter, Message, Object, Payload, Phase};

const LEN_PREFIX: usize = 4;
/// Upper bound on a single message's declared body length (the 4-byte length prefix is
/// wire-controlled and otherwise unbounded); exceeding it resets the decoder rather than
/// accumulating an attacker-sized buffer in `self.body`.
const MAX_BODY: usize = 1 << 20;

#[derive(Debug, Serialize)]
pub struct KafkaFrame {
    pub correlation_id: i32,
    pub api_key: Option<i16>,
    pub api_version: Option<i16>,
    pub size: usize,
}

pub struct KafkaDecoder {
    is_client: bool,
    phase: Phase,
    len_buf: [u8; LEN_PREFIX],
    len_have: usize,
    body_len: usize,
    body: Vec<u8>,
    failures: FailureCounter,
}

impl KafkaDecoder {
    pub fn new(is_client: bool) -> Self {
        KafkaDecoder {
            is_client,
            phase: Phase::DecodeHeader,
            len_buf: [0; LEN_PREFIX],
            len_have: 0,
            body_len: 0,
            body: Vec::new(),
            failures: FailureCounter::new(),
        }
    }
}

impl super::Decoder for KafkaDecoder {
    fn decode(&mut self, data: &[u8], time: Instant) -> Result<DecodeOutcome, DecodeError> {
        let mut pos = 0;
        let mut objects = Vec::new();
        loop {
            match self.phase {
                Phase::DecodeHeader => {
                    let remaining = &data[pos..];
                    let need = LEN_PREFIX - self.len_have;
                    let take = need.min(remaining.len());
                    self.len_buf[self.len_have..self.len_have + take].copy_from_slice(&remaining[..take]);
                    self.len_have += take;
                    pos += take;
                    if self.len_have < LEN_PREFIX {
                        break;
                    }
                    self.body_len = u32::from_be_bytes(self.len_buf) as usize;
                    self.len_have = 0;
                    self.body.clear();
                    if self.body_len > MAX_BODY {
                        if self.failures.strike() {
                            self.failures.clear();
                            return Err(DecodeError::InvalidBytes);
                        }
                        continue;
                    }
                    self.phase = Phase::DecodePayload;
                    self.failures.clear();
                }
                Phase::DecodePayload => {
                    let remaining = &data[pos..];
                    let need = self.body_len - self.body.len();
                    let take = need.min(remaining.len());
                    self.body.extend_from_slice(&remaining[..take]);
                    pos += take;
                    if self.body.len() < self.body_len {
                        break;
                    }
                    self.phase = Phase::DecodeHeader;
                    let body = std::mem::take(&mut self.body);
                    let frame = if self.is_client {
                        if body.len() < 8 {
                            self.failures.strike();
                            continue;
                        }
                        KafkaFrame {
                            api_key: Some(i16::from_be_bytes([body[0], body[1]])),
                            api_version: Some(i16::from_be_bytes([body[2], body[3]])),
                            correlation_id: i32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                            size: LEN_PREFIX + self.body_len,
                        }
                    } else {
                        if body.len() < 4 {
                            self.failures.strike();
                            continue;
                        }
                        KafkaFrame {
                            api_key: None,
                            api_version: None,
                            correlation_id: i32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                            size: LEN_PREFIX + self.body_len,
                        }
                    };
                    self.failures.clear();
                    let msg = Message {
                        size: frame.size,
                        time,
                        payload: Payload::Kafka(frame),
                    };
                    objects.push(if self.is_client {
                        Object::Request(msg)
                    } else {
                        Object::Response(msg)
                    });
                }
            }
        }
        Ok(DecodeOutcome {
            objects,
            consumed: pos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder as _;

    /// A forged, oversized length prefix must not accumulate in `self.body` without bound; the
    /// decoder should strike instead and eventually force a stream reset via `FailureCounter`.
    #[test]
    fn oversized_declared_length_does_not_grow_body_buffer() {
        let mut dec = KafkaDecoder::new(true);
        let mut frame = ((MAX_BODY + 1) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 16]);
        let out = dec.decode(&frame, Instant::now()).unwrap();
        assert!(out.objects.is_empty());
        assert!(dec.body.len() <= 16, "body buffer must not retain the oversized declared length");
    }
}

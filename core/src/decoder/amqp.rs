//! AMQP 0-9-1 decoder (spec.md §4.4.3).
//!
//! Lighter fidelity: frames the standard `{type, channel, size, payload, frame-end}` envelope
//! without decoding method-class/method-id or content-header fields. The real per-message
//! correlation id lives inside method/property payloads this decoder does not parse, so pairing
//! falls back to the frame's channel number: at most one request per channel is held pending at a
//! time, and the next response on that channel closes it out (documented in DESIGN.md).

use std::time::Instant;

use serde::Serialize;

use super::{DecodeError, DecodeOutcome, FailureCounter, Message, Object, Payload, Phase};

const FRAME_HEADER_LEN: usize = 7;
const FRAME_END: u8 = 0xce;

#[derive(Debug, Serialize)]
pub struct AmqpFrame {
    pub frame_type: u8,
    pub channel: u16,
    pub payload_len: usize,
    pub correlation_id: Option<u64>,
}

pub struct AmqpDecoder {
    is_client: bool,
    phase: Phase,
    header: [u8; FRAME_HEADER_LEN],
    header_len: usize,
    payload_len: usize,
    consumed: usize,
    frame_type: u8,
    channel: u16,
    failures: FailureCounter,
}

impl AmqpDecoder {
    pub fn new(is_client: bool) -> Self {
        AmqpDecoder {
            is_client,
            phase: Phase::DecodeHeader,
            header: [0; FRAME_HEADER_LEN],
            header_len: 0,
            payload_len: 0,
            consumed: 0,
            frame_type: 0,
            channel: 0,
            failures: FailureCounter::new(),
        }
    }
}

impl super::Decoder for AmqpDecoder {
    fn decode(&mut self, data: &[u8], time: Instant) -> Result<DecodeOutcome, DecodeError> {
        let mut pos = 0;
        let mut objects = Vec::new();
        loop {
            match self.phase {
                Phase::DecodeHeader => {
                    let remaining = &data[pos..];
                    let need = FRAME_HEADER_LEN - self.header_len;
                    let take = need.min(remaining.len());
                    self.header[self.header_len..self.header_len + take].copy_from_slice(&remaining[..take]);
                    self.header_len += take;
                    pos += take;
                    if self.header_len < FRAME_HEADER_LEN {
                        break;
                    }
                    self.frame_type = self.header[0];
                    self.channel = u16::from_be_bytes([self.header[1], self.header[2]]);
                    self.payload_len = u32::from_be_bytes([self.header[3], self.header[4], self.header[5], self.header[6]]) as usize;
                    self.consumed = 0;
                    self.header_len = 0;
                    self.phase = Phase::DecodePayload;
                    self.failures.clear();
                }
                Phase::DecodePayload => {
                    // payload bytes, then a 1-byte frame-end marker we also consume here.
                    let total = self.payload_len + 1;
                    let remaining = &data[pos..];
                    let need = total - self.consumed;
                    let take = need.min(remaining.len());
                    let end_byte_seen = self.consumed + take >= total;
                    self.consumed += take;
                    pos += take;
                    if self.consumed < total {
                        break;
                    }
                    if end_byte_seen && data.get(pos - 1) != Some(&FRAME_END) {
                        self.phase = Phase::DecodeHeader;
                        self.consumed = 0;
                        if self.failures.strike() {
                            self.failures.clear();
                            return Err(DecodeError::InvalidBytes);
                        }
                        continue;
                    }
                    self.phase = Phase::DecodeHeader;
                    let frame = AmqpFrame {
                        frame_type: self.frame_type,
                        channel: self.channel,
                        payload_len: self.payload_len,
                        // Channel number stands in for the real method/property correlation id
                        // (see module doc): it's always present, unlike the payload fields this
                        // decoder doesn't parse.
                        correlation_id: Some(self.channel as u64),
                    };
                    let msg = Message {
                        size: FRAME_HEADER_LEN + total,
                        time,
                        payload: Payload::Amqp(frame),
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
    use crate::decoder::Decoder;
    use crate::matcher::MultiplexedMatcher;

    fn frame(channel: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![1u8]; // frame_type: method
        buf.extend_from_slice(&channel.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf.push(FRAME_END);
        buf
    }

    #[test]
    fn correlation_id_is_the_channel_number() {
        let mut dec = AmqpDecoder::new(true);
        let out = dec.decode(&frame(7, b"method-body"), Instant::now()).unwrap();
        assert_eq!(out.objects.len(), 1);
        match &out.objects[0] {
            Object::Request(m) => match &m.payload {
                Payload::Amqp(f) => {
                    assert_eq!(f.channel, 7);
                    assert_eq!(f.correlation_id, Some(7));
                }
                _ => panic!("wrong payload"),
            },
            _ => panic!("expected request"),
        }
    }

    /// A request and response on the same channel must actually pair through
    /// `MultiplexedMatcher` now that `correlation_id` is populated — previously the `?` in
    /// `MultiplexedMatcher::push` silently dropped every AMQP object since `match_id()` always
    /// returned `None`.
    #[test]
    fn request_and_response_on_same_channel_pair() {
        let mut client = AmqpDecoder::new(true);
        let mut server = AmqpDecoder::new(false);
        let mut matcher = MultiplexedMatcher::new(std::time::Duration::from_secs(60));
        let now = Instant::now();

        let req_out = client.decode(&frame(3, b"publish"), now).unwrap();
        let req = req_out.objects.into_iter().next().unwrap();
        assert!(matcher.push(req, now).is_none());

        let resp_out = server.decode(&frame(3, b"publish-ok"), now).unwrap();
        let resp = resp_out.objects.into_iter().next().unwrap();
        assert!(matcher.push(resp, now).is_some());
    }
}

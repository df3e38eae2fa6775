//! gRPC decoder (spec.md §4.4.3).
//!
//! Lighter fidelity: models gRPC's length-prefixed message framing (1-byte compressed flag + 4-byte
//! big-endian length) directly, without the surrounding HTTP/2 stream multiplexing — sufficient to
//! keep each message correctly bounded and sized.

use std::time::Instant;

use serde::Serialize;

use super::{DecodeError, DecodeOutcome, FailureCounter, Message, Object, Payload, Phase};

const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Serialize)]
pub struct GrpcFrame {
    pub stream_id: u32,
    pub compressed: bool,
    pub message_len: usize,
}

pub struct GrpcDecoder {
    is_client: bool,
    stream_id: u32,
    phase: Phase,
    header: [u8; FRAME_HEADER_LEN],
    header_len: usize,
    message_len: usize,
    consumed: usize,
    compressed: bool,
    failures: FailureCounter,
}

impl GrpcDecoder {
    pub fn new(is_client: bool, stream_id: u32) -> Self {
        GrpcDecoder {
            is_client,
            stream_id,
            phase: Phase::DecodeHeader,
            header: [0; FRAME_HEADER_LEN],
            header_len: 0,
            message_len: 0,
            consumed: 0,
            compressed: false,
            failures: FailureCounter::new(),
        }
    }
}

impl super::Decoder for GrpcDecoder {
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
                    self.compressed = self.header[0] != 0;
                    self.message_len = u32::from_be_bytes([self.header[1], self.header[2], self.header[3], self.header[4]]) as usize;
                    self.consumed = 0;
                    self.header_len = 0;
                    self.phase = Phase::DecodePayload;
                    self.failures.clear();
                }
                Phase::DecodePayload => {
                    let remaining = &data[pos..];
                    let need = self.message_len - self.consumed;
                    let take = need.min(remaining.len());
                    self.consumed += take;
                    pos += take;
                    if self.consumed < self.message_len {
                        break;
                    }
                    self.phase = Phase::DecodeHeader;
                    let frame = GrpcFrame {
                        stream_id: self.stream_id,
                        compressed: self.compressed,
                        message_len: self.message_len,
                    };
                    let msg = Message {
                        size: FRAME_HEADER_LEN + self.message_len,
                        time,
                        payload: Payload::Grpc(frame),
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

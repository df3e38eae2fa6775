//! MongoDB wire protocol decoder (spec.md §4.4.3: "MongoDB is OP_MSG-framed").
//!
//! Standard message header (16 bytes: `messageLength, requestID, responseTo, opCode`) plus OP_MSG's
//! `flagBits`. Lighter fidelity: section/document bodies are framed but not BSON-decoded.

use std::time::Instant;

use serde::Serialize;

use super::{DecodeError, DecodeOutcome, FailureCounter, Message, Object, Payload, Phase};

const HEADER_LEN: usize = 16;
const OP_MSG: i32 = 2013;

#[derive(Debug, Serialize)]
pub struct MongoMessage {
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
    pub message_len: usize,
}

pub struct MongoDecoder {
    is_client: bool,
    phase: Phase,
    header: [u8; HEADER_LEN],
    header_len: usize,
    message_len: usize,
    body_len: usize,
    body_consumed: usize,
    request_id: i32,
    response_to: i32,
    op_code: i32,
    failures: FailureCounter,
}

impl MongoDecoder {
    pub fn new(is_client: bool) -> Self {
        MongoDecoder {
            is_client,
            phase: Phase::DecodeHeader,
            header: [0; HEADER_LEN],
            header_len: 0,
            message_len: 0,
            body_len: 0,
            body_consumed: 0,
            request_id: 0,
            response_to: 0,
            op_code: 0,
            failures: FailureCounter::new(),
        }
    }
}

impl super::Decoder for MongoDecoder {
    fn decode(&mut self, data: &[u8], time: Instant) -> Result<DecodeOutcome, DecodeError> {
        let mut pos = 0;
        let mut objects = Vec::new();
        loop {
            match self.phase {
                Phase::DecodeHeader => {
                    let remaining = &data[pos..];
                    let need = HEADER_LEN - self.header_len;
                    let take = need.min(remaining.len());
                    self.header[self.header_len..self.header_len + take].copy_from_slice(&remaining[..take]);
                    self.header_len += take;
                    pos += take;
                    if self.header_len < HEADER_LEN {
                        break;
                    }
                    let message_len = i32::from_le_bytes(self.header[0..4].try_into().unwrap()).max(HEADER_LEN as i32) as usize;
                    self.request_id = i32::from_le_bytes(self.header[4..8].try_into().unwrap());
                    self.response_to = i32::from_le_bytes(self.header[8..12].try_into().unwrap());
                    self.op_code = i32::from_le_bytes(self.header[12..16].try_into().unwrap());
                    self.message_len = message_len;
                    self.body_len = message_len - HEADER_LEN;
                    self.body_consumed = 0;
                    self.header_len = 0;
                    self.phase = Phase::DecodePayload;
                    self.failures.clear();
                }
                Phase::DecodePayload => {
                    let remaining = &data[pos..];
                    let need = self.body_len - self.body_consumed;
                    let take = need.min(remaining.len());
                    self.body_consumed += take;
                    pos += take;
                    if self.body_consumed < self.body_len {
                        break;
                    }
                    self.phase = Phase::DecodeHeader;
                    if self.op_code != OP_MSG {
                        continue;
                    }
                    let frame = MongoMessage {
                        request_id: self.request_id,
                        response_to: self.response_to,
                        op_code: self.op_code,
                        message_len: self.message_len,
                    };
                    let msg = Message {
                        size: self.message_len,
                        time,
                        payload: Payload::Mongodb(frame),
                    };
                    let is_request = self.response_to == 0;
                    objects.push(if self.is_client || is_request {
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

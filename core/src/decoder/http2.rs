//! HTTP/2 decoder (spec.md §4.4.3: "HTTP/2 tracks per-stream-id state").
//!
//! Lighter fidelity than the MySQL/PostgreSQL decoders: frames are parsed down to
//! `{stream_id, frame_type, flags, payload_len}` without decoding HPACK header blocks or DATA
//! payloads, which is sufficient to keep the stream correctly bounded and to pair HEADERS frames
//! by stream id via the multiplexed matcher.

use std::time::Instant;

use serde::Serialize;

use super::{DecodeError, DecodeOutcome, FailureCounter, Message, Object, Payload, Phase};

const FRAME_HEADER_LEN: usize = 9;
const FRAME_TYPE_HEADERS: u8 = 0x1;
const FLAG_END_STREAM: u8 = 0x1;

#[derive(Debug, Serialize)]
pub struct Http2Frame {
    pub stream_id: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub payload_len: usize,
    pub end_stream: bool,
}

pub struct Http2Decoder {
    is_client: bool,
    phase: Phase,
    header: [u8; FRAME_HEADER_LEN],
    header_len: usize,
    payload_len: usize,
    payload_consumed: usize,
    pending: Option<Http2Frame>,
    failures: FailureCounter,
}

impl Http2Decoder {
    pub fn new(is_client: bool) -> Self {
        Http2Decoder {
            is_client,
            phase: Phase::DecodeHeader,
            header: [0; FRAME_HEADER_LEN],
            header_len: 0,
            payload_len: 0,
            payload_consumed: 0,
            pending: None,
            failures: FailureCounter::new(),
        }
    }
}

impl super::Decoder for Http2Decoder {
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
                    let len = ((self.header[0] as usize) << 16) | ((self.header[1] as usize) << 8) | self.header[2] as usize;
                    let frame_type = self.header[3];
                    let flags = self.header[4];
                    let stream_id = u32::from_be_bytes([self.header[5], self.header[6], self.header[7], self.header[8]]) & 0x7fff_ffff;
                    self.payload_len = len;
                    self.payload_consumed = 0;
                    self.header_len = 0;
                    self.pending = Some(Http2Frame {
                        stream_id,
                        frame_type,
                        flags,
                        payload_len: len,
                        end_stream: flags & FLAG_END_STREAM != 0,
                    });
                    self.phase = Phase::DecodePayload;
                    self.failures.clear();
                }
                Phase::DecodePayload => {
                    let remaining = &data[pos..];
                    let need = self.payload_len - self.payload_consumed;
                    let take = need.min(remaining.len());
                    self.payload_consumed += take;
                    pos += take;
                    if self.payload_consumed < self.payload_len {
                        break;
                    }
                    self.phase = Phase::DecodeHeader;
                    let frame = self.pending.take().unwrap();
                    if frame.frame_type == FRAME_TYPE_HEADERS {
                        let msg = Message {
                            size: FRAME_HEADER_LEN + frame.payload_len,
                            time,
                            payload: Payload::Http2(frame),
                        };
                        objects.push(if self.is_client {
                            Object::Request(msg)
                        } else {
                            Object::Response(msg)
                        });
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

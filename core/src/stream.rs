//! Per-direction byte-stream reassembly.
//!
//! Mirrors the teacher's stream-state idiom (`conntrack::conn::tcp_conn` buffers the out-of-order
//! window; protocol parsers such as `protocols::stream::ssh::parser::SshParser` keep their own
//! `buffer_clt`/`buffer_srv` `Vec<u8>` tails) but simplified per spec.md §3: bytes are delivered to
//! the decoder strictly in packet arrival order, with no sequence-number reordering. A [`Stream`]
//! retains only the undrained "partial" suffix across packet boundaries; the common case (a
//! complete frame lands in one packet) never copies.

use thiserror::Error;

/// A decoder-owned bound on how large a retained partial tail may grow before the stream gives up
/// and resets (spec.md glossary: "Partial").
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("retained tail ({len} bytes) exceeds maximum message size ({max})")]
    Overflow { len: usize, max: usize },
}

/// An ordered, bounded byte buffer for one direction of one connection.
///
/// Usage per packet: [`Stream::append`] combines the retained tail (if any) with the new payload
/// into a [`Cursor`] handed to the decoder; after the decoder reports how many bytes it consumed,
/// [`Stream::commit`] releases the consumed prefix and re-retains any unconsumed suffix, bounded by
/// `max_size`.
pub struct Stream {
    tail: Vec<u8>,
    max_size: usize,
}

impl Stream {
    pub fn new(max_size: usize) -> Self {
        Stream {
            tail: Vec::new(),
            max_size,
        }
    }

    /// `true` if there is no carried-over partial data (i.e. the next `append` will be zero-copy).
    pub fn is_empty(&self) -> bool {
        self.tail.is_empty()
    }

    /// Combines the retained tail with freshly arrived `payload` into a cursor for the decoder.
    /// When there is no retained tail this aliases `payload` directly with no allocation; only
    /// decoders that left a tail behind pay for an internal copy, matching the teacher's "clone
    /// the tail into your own staging buffer" discipline (applied here at the stream layer so
    /// individual decoders don't each reimplement it).
    pub fn append<'a>(&'a mut self, payload: &'a [u8]) -> Cursor<'a> {
        if self.tail.is_empty() {
            Cursor::Borrowed(payload)
        } else {
            self.tail.extend_from_slice(payload);
            Cursor::Owned(&self.tail)
        }
    }

    /// Releases the first `consumed` bytes of the buffer handed out by the last `append`, and
    /// retains the remainder as the new tail (bounded by `max_size`). `total_len` is the length of
    /// the slice the decoder was given (i.e. `cursor.len()` from the matching `append`).
    pub fn commit(&mut self, total_len: usize, consumed: usize, remainder: &[u8]) -> Result<(), StreamError> {
        debug_assert!(consumed <= total_len);
        let remaining = remainder.len();
        if remaining > self.max_size {
            self.tail.clear();
            return Err(StreamError::Overflow {
                len: remaining,
                max: self.max_size,
            });
        }
        self.tail.clear();
        self.tail.extend_from_slice(remainder);
        Ok(())
    }

    /// Discards any retained partial data, e.g. after two consecutive short-read recoveries fail
    /// (spec.md §4.4 restart discipline: "if retry fails twice, the decoder resets").
    pub fn reset(&mut self) {
        self.tail.clear();
    }
}

/// A slice handed to a decoder for one `decode` call: either a direct alias of the packet payload
/// (zero-copy, the common case) or the stream's own staging buffer when a tail was retained.
pub enum Cursor<'a> {
    Borrowed(&'a [u8]),
    Owned(&'a [u8]),
}

impl<'a> Cursor<'a> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Cursor::Borrowed(s) => s,
            Cursor::Owned(s) => s,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_copy_when_no_tail() {
        let mut s = Stream::new(1024);
        let data = [1u8, 2, 3];
        let cursor = s.append(&data);
        assert!(matches!(cursor, Cursor::Borrowed(_)));
        assert_eq!(cursor.as_slice(), &data);
    }

    #[test]
    fn retains_tail_across_packets() {
        let mut s = Stream::new(1024);
        {
            let cursor = s.append(&[1, 2, 3]);
            let slice = cursor.as_slice().to_vec();
            s.commit(cursor.len(), 1, &slice[1..]).unwrap();
        }
        assert!(!s.is_empty());
        let cursor = s.append(&[4, 5]);
        assert_eq!(cursor.as_slice(), &[2, 3, 4, 5]);
    }

    #[test]
    fn overflow_resets_and_errors() {
        let mut s = Stream::new(2);
        let cursor = s.append(&[1, 2, 3, 4]);
        let slice = cursor.as_slice().to_vec();
        let err = s.commit(cursor.len(), 0, &slice).unwrap_err();
        assert!(matches!(err, StreamError::Overflow { .. }));
        assert!(s.is_empty());
    }
}

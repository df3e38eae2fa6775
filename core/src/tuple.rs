//! Connection identifiers.
//!
//! A [`Tuple`] identifies one connection independent of packet direction. [`Tuple::key`] is used
//! for table lookups; [`Tuple`] itself retains the orientation of the first observed packet so
//! that direction can later be recovered relative to the known server port.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Layer-4 transport protocol.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl L4Proto {
    /// IANA assigned protocol number.
    pub fn number(&self) -> u8 {
        match self {
            L4Proto::Tcp => 6,
            L4Proto::Udp => 17,
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Proto::Tcp => write!(f, "tcp"),
            L4Proto::Udp => write!(f, "udp"),
        }
    }
}

/// The connection 5-tuple: `{src_ip, src_port, dst_ip, dst_port, l4_proto}`.
///
/// Immutable once constructed. Two packets belong to the same connection iff their tuples are
/// equal in either orientation; [`Tuple::key`] normalizes orientation for table lookups, while
/// `src`/`dst` retain the orientation of the packet that produced this value.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct Tuple {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub l4_proto: L4Proto,
}

impl Tuple {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16, l4_proto: L4Proto) -> Self {
        Tuple {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            l4_proto,
        }
    }

    /// Returns the tuple with source and destination swapped.
    pub fn swap(&self) -> Self {
        Tuple {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            l4_proto: self.l4_proto,
        }
    }

    /// A direction-independent key suitable for a connection table: the two endpoints ordered
    /// canonically so that `t.key() == t.swap().key()`.
    pub fn key(&self) -> ConnKey {
        let a = (self.src_ip, self.src_port);
        let b = (self.dst_ip, self.dst_port);
        if a <= b {
            ConnKey(a, b, self.l4_proto)
        } else {
            ConnKey(b, a, self.l4_proto)
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.l4_proto
        )
    }
}

/// Direction-independent connection table key.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnKey((IpAddr, u16), (IpAddr, u16), L4Proto);

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <> {}:{} ({})",
            self.0 .0, self.0 .1, self.1 .0, self.1 .1, self.2
        )
    }
}

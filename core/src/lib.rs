//! A passive network-traffic observability agent core: capture a link, reassemble connections,
//! decode layer-7 requests and responses, pair them into round-trips, and fan the result out to
//! sinks, a metrics registry, and an admin HTTP surface.
//!
//! Traffic flows through the pipeline in five stages, each owned by its own module:
//!
//! 1. [`capture`] reads frames off the wire (or a pcap file) and parses them down to a
//!    [`packet::L4Packet`].
//! 2. [`portpool`] decides which configured protocol owns a packet's `(l4, port)` and routes it
//!    into a [`conntrack`] connection pool.
//! 3. Each [`conntrack::Connection`] retains bytes in a [`stream::Stream`] until a [`decoder`]
//!    claims them as a complete request or response.
//! 4. [`matcher`] pairs requests with responses, either FIFO (one connection at a time) or by
//!    protocol-assigned id (multiplexed protocols).
//! 5. [`roundtrip`] turns a matched pair into a serializable record, and [`fanout`] distributes it
//!    to the round-trip sink, the live pub/sub used by `GET /watch`, and the [`stats`] registry.
//!
//! [`admin`] exposes the whole thing over HTTP (`/metrics`, `/protocol/metrics`, `/-/reload`,
//! `/-/logger`, `/watch`); [`config`] loads the YAML document that drives all of it.

pub mod admin;
pub mod capture;
pub mod config;
pub mod conntrack;
pub mod decoder;
pub mod fanout;
pub mod matcher;
pub mod packet;
pub mod portpool;
pub mod roundtrip;
pub mod sinks;
pub mod stats;
pub mod stream;
pub mod tuple;

pub use conntrack::{Connection, ConnectionPool};
pub use portpool::PortPoolRegistry;
pub use roundtrip::RoundTrip;
pub use tuple::{L4Proto, Tuple};

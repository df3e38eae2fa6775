//! Parsed layer-4 packets.
//!
//! Mirrors the teacher's `conntrack::pdu` layer: a capture frame is reduced to a [`Tuple`], a
//! payload slice, a capture timestamp, and a direction. Unlike the teacher (which parses directly
//! out of a DPDK `Mbuf`), frames here come from `pcap` and are parsed with `pnet`.

use std::net::IpAddr;
use std::time::Instant;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet as _;

use crate::tuple::{L4Proto, Tuple};

/// Direction of a packet relative to the connection's server endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// One parsed layer-4 protocol data unit.
///
/// `payload` aliases the capture buffer: see [`crate::stream::Stream`] for the zero-copy
/// discipline decoders must follow when retaining data across packets.
pub struct L4Packet<'a> {
    pub tuple: Tuple,
    pub payload: &'a [u8],
    pub timestamp: Instant,
    pub direction: Direction,
}

/// Parses an Ethernet frame into a `(Tuple, payload_range)` pair.
///
/// Returns `None` for anything that isn't IPv4/IPv6-over-Ethernet TCP/UDP, mirroring spec.md
/// §4.1's "If no pool, drop silently" posture one layer up: unparseable frames are simply not
/// handed to the dispatcher.
pub fn parse_l4<'a>(frame: &'a [u8]) -> Option<(Tuple, &'a [u8])> {
    let eth = EthernetPacket::new(frame)?;
    match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(eth.payload())?;
            parse_transport(
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.get_next_level_protocol(),
                ip.payload(),
            )
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(eth.payload())?;
            parse_transport(
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.get_next_header(),
                ip.payload(),
            )
        }
        _ => None,
    }
}

fn parse_transport<'a>(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    proto: pnet::packet::ip::IpNextHeaderProtocol,
    data: &'a [u8],
) -> Option<(Tuple, &'a [u8])> {
    match proto {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(data)?;
            let tuple = Tuple::new(src_ip, tcp.get_source(), dst_ip, tcp.get_destination(), L4Proto::Tcp);
            // pnet's owned `payload()` lifetime is tied to `data`; re-slice from the offset so the
            // returned slice aliases the caller's buffer directly instead of `tcp`'s temporary.
            let header_len = tcp.get_data_offset() as usize * 4;
            if header_len > data.len() {
                return None;
            }
            Some((tuple, &data[header_len..]))
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(data)?;
            let tuple = Tuple::new(src_ip, udp.get_source(), dst_ip, udp.get_destination(), L4Proto::Udp);
            const UDP_HEADER_LEN: usize = 8;
            if UDP_HEADER_LEN > data.len() {
                return None;
            }
            Some((tuple, &data[UDP_HEADER_LEN..]))
        }
        _ => None,
    }
}

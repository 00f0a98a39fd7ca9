#![forbid(unsafe_code)]

//! Zero-copy parsers and in-place builders for the IPv4, TCP and UDP headers carried over a tun
//! device.
//!
//! Parsers return borrowed views (`Ipv4Packet`, `TcpSegment`, `UdpPacket`) that validate lengths
//! up front so accessors never panic. Builders write a header into a caller-provided buffer whose
//! payload region is already populated, which lets the NAT core read socket data directly after
//! the reserved header space and avoid a copy.

pub mod checksum;
pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use ipv4::{Ipv4HeaderBuilder, Ipv4Packet, IPPROTO_TCP, IPPROTO_UDP, IPV4_HEADER_LEN};
pub use tcp::{TcpFlags, TcpHeaderBuilder, TcpSegment, TCP_HEADER_LEN};
pub use udp::{UdpHeaderBuilder, UdpPacket, UDP_HEADER_LEN};

/// Largest datagram an IPv4 total-length field can describe.
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_out_buf_len(out: &[u8], needed: usize) -> Result<(), PacketError> {
    if out.len() < needed {
        return Err(PacketError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }
    Ok(())
}

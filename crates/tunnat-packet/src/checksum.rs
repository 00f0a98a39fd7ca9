//! RFC 1071 Internet checksum helpers.

use std::net::Ipv4Addr;

/// Adds the big-endian 16-bit words of `data` to `initial`. A trailing odd byte is padded with a
/// zero low byte.
///
/// The result is only partially folded; pass it to [`fold`] before use.
pub fn ones_complement_sum(initial: u32, data: &[u8]) -> u32 {
    let mut sum = u64::from(initial);
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }
    while sum >> 32 != 0 {
        sum = (sum & 0xffff_ffff) + (sum >> 32);
    }
    sum as u32
}

/// Folds the carries of a 32-bit accumulator back into 16 bits.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(ones_complement_sum(0, data))
}

/// Checksum of an IPv4 header. With the checksum field zeroed this is the value to store; over
/// a header that already carries its checksum it is zero when the header is intact.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// Sum of the IPv4 pseudo-header (source, destination, zero, protocol, transport length).
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let sum = ones_complement_sum(0, &src.octets());
    let sum = ones_complement_sum(sum, &dst.octets());
    sum + u32::from(protocol) + u32::from(len)
}

/// TCP/UDP checksum over the pseudo-header and `segment`.
///
/// Segments longer than 65535 bytes cannot be described by an IPv4 header; their length is
/// truncated in the pseudo-header the same way the wire field would be.
pub fn transport_checksum_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let pseudo = pseudo_header_sum(src, dst, protocol, segment.len() as u16);
    !fold(ones_complement_sum(pseudo, segment))
}

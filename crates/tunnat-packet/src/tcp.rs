use std::net::Ipv4Addr;

use crate::ipv4::IPPROTO_TCP;
use crate::{checksum, ensure_len, ensure_out_buf_len, PacketError, MAX_DATAGRAM_SIZE};

/// Length of an option-less TCP header, the only kind the builder emits.
pub const TCP_HEADER_LEN: usize = 20;

bitflags::bitflags! {
    /// Control bits from byte 13 of the TCP header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

/// A received TCP segment. Options are skipped, not decoded; the NAT only reads the fixed header
/// fields below.
#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    bytes: &'a [u8],
    payload_at: usize,
}

impl<'a> TcpSegment<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(bytes, TCP_HEADER_LEN)?;
        let payload_at = usize::from(bytes[12] >> 4) * 4;
        if payload_at < TCP_HEADER_LEN {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        ensure_len(bytes, payload_at)?;
        Ok(Self { bytes, payload_at })
    }

    fn be16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    fn be32(&self, at: usize) -> u32 {
        (u32::from(self.be16(at)) << 16) | u32::from(self.be16(at + 2))
    }

    pub fn src_port(&self) -> u16 {
        self.be16(0)
    }

    pub fn dst_port(&self) -> u16 {
        self.be16(2)
    }

    pub fn seq_number(&self) -> u32 {
        self.be32(4)
    }

    pub fn ack_number(&self) -> u32 {
        self.be32(8)
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_retain(self.bytes[13])
    }

    pub fn window_size(&self) -> u16 {
        self.be16(14)
    }

    /// Header length including options.
    pub fn header_len(&self) -> usize {
        self.payload_at
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.payload_at..]
    }

    /// Whether the segment, pseudo-header included, sums to zero.
    pub fn checksum_valid_ipv4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
        checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, self.bytes) == 0
    }
}

/// Fields of a synthesized TCP header. Always option-less with a zero urgent pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeaderBuilder {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
}

impl TcpHeaderBuilder {
    /// Writes the header into `segment[..20]` and checksums the whole of `segment`, whose
    /// remaining bytes must already hold the payload. Returns the segment length.
    pub fn write(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        segment: &mut [u8],
    ) -> Result<usize, PacketError> {
        ensure_out_buf_len(segment, TCP_HEADER_LEN)?;
        let len = segment.len();
        if len > MAX_DATAGRAM_SIZE {
            return Err(PacketError::Malformed("TCP segment > 65535 bytes"));
        }

        segment[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        segment[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        segment[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        segment[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        segment[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
        segment[13] = self.flags.bits();
        segment[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        segment[16..18].copy_from_slice(&0u16.to_be_bytes());
        segment[18..20].copy_from_slice(&0u16.to_be_bytes());

        // Unlike UDP, TCP has no "checksum disabled" sentinel; a computed 0x0000 is written as-is.
        let csum = checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, segment);
        segment[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(len)
    }

    /// Allocates a segment holding this header followed by `payload`.
    pub fn build_vec(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        payload: &[u8],
    ) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; TCP_HEADER_LEN + payload.len()];
        buf[TCP_HEADER_LEN..].copy_from_slice(payload);
        self.write(src_ip, dst_ip, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(flags: TcpFlags) -> TcpHeaderBuilder {
        TcpHeaderBuilder {
            src_port: 80,
            dst_port: 1234,
            seq_number: 7,
            ack_number: 1001,
            flags,
            window_size: 0xffff,
        }
    }

    #[test]
    fn build_and_parse_syn_ack() {
        let src_ip = Ipv4Addr::new(192, 0, 2, 1);
        let dst_ip = Ipv4Addr::new(192, 0, 2, 2);
        let buf = builder(TcpFlags::SYN | TcpFlags::ACK)
            .build_vec(src_ip, dst_ip, &[])
            .unwrap();
        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(seg.src_port(), 80);
        assert_eq!(seg.dst_port(), 1234);
        assert_eq!(seg.seq_number(), 7);
        assert_eq!(seg.ack_number(), 1001);
        assert_eq!(seg.flags(), TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(seg.window_size(), 0xffff);
        assert_eq!(&buf[18..20], &[0, 0]);
        assert!(seg.payload().is_empty());
        assert!(seg.checksum_valid_ipv4(src_ip, dst_ip));
        assert!(!seg.checksum_valid_ipv4(dst_ip, Ipv4Addr::new(192, 0, 2, 3)));
    }

    #[test]
    fn odd_length_payload_checksums() {
        let src_ip = Ipv4Addr::new(10, 0, 0, 1);
        let dst_ip = Ipv4Addr::new(10, 0, 0, 2);
        let buf = builder(TcpFlags::PSH | TcpFlags::ACK)
            .build_vec(src_ip, dst_ip, b"abc")
            .unwrap();
        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(seg.payload(), b"abc");
        assert!(seg.checksum_valid_ipv4(src_ip, dst_ip));
    }

    #[test]
    fn tcp_checksum_can_be_zero() {
        let src_ip = Ipv4Addr::new(10, 0, 0, 1);
        let dst_ip = Ipv4Addr::new(10, 0, 0, 2);

        // Pick a two-byte payload that drives the segment checksum to exactly 0x0000.
        let header = builder(TcpFlags::ACK);
        let base = header.build_vec(src_ip, dst_ip, &[0, 0]).unwrap();
        let mut zeroed = base.clone();
        zeroed[16..18].copy_from_slice(&0u16.to_be_bytes());
        let sum_folded = !checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, &zeroed);
        let payload = 0xffffu16.wrapping_sub(sum_folded).to_be_bytes();

        let buf = header.build_vec(src_ip, dst_ip, &payload).unwrap();
        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(&buf[16..18], &[0, 0]);
        assert!(seg.checksum_valid_ipv4(src_ip, dst_ip));
    }

    #[test]
    fn parse_skips_options() {
        let mut buf = builder(TcpFlags::SYN)
            .build_vec(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &[2, 4, 5, 0xb4, 9])
            .unwrap();
        buf[12] = 6 << 4;
        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(seg.header_len(), 24);
        assert_eq!(seg.payload(), &[9]);
    }

    #[test]
    fn rejects_bad_data_offset() {
        let mut buf = [0u8; 20];
        buf[12] = 4 << 4;
        assert!(matches!(
            TcpSegment::parse(&buf),
            Err(PacketError::Malformed(_))
        ));

        buf[12] = 15 << 4;
        assert_eq!(
            TcpSegment::parse(&buf).unwrap_err(),
            PacketError::Truncated {
                needed: 60,
                available: 20
            }
        );
        assert!(TcpSegment::parse(&buf[..19]).is_err());
    }

    #[test]
    fn flags_round_trip_all_bits() {
        for bits in 0..=u8::MAX {
            let flags = TcpFlags::from_bits_retain(bits);
            let buf = builder(flags)
                .build_vec(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &[])
                .unwrap();
            assert_eq!(TcpSegment::parse(&buf).unwrap().flags(), flags);
        }
    }
}

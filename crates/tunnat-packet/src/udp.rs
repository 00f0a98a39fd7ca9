use std::net::Ipv4Addr;

use crate::ipv4::IPPROTO_UDP;
use crate::{checksum, ensure_len, ensure_out_buf_len, PacketError, MAX_DATAGRAM_SIZE};

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct UdpPacket<'a> {
    data: &'a [u8],
    length: usize,
}

impl<'a> UdpPacket<'a> {
    pub const HEADER_LEN: usize = UDP_HEADER_LEN;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if length < Self::HEADER_LEN {
            return Err(PacketError::Malformed("UDP length < header length"));
        }
        ensure_len(data, length)?;
        Ok(Self { data, length })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn length(&self) -> u16 {
        self.length as u16
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[Self::HEADER_LEN..self.length]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        &self.data[..self.length]
    }

    /// A zero checksum means the sender did not compute one, which IPv4 allows.
    pub fn checksum_valid_ipv4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_UDP, self.as_bytes()) == 0
    }
}

/// Fields of a synthesized UDP header. The checksum is left at zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeaderBuilder {
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpHeaderBuilder {
    /// Writes the header into `out[..8]` for `payload_len` bytes following it. Returns the UDP
    /// length (header plus payload).
    pub fn write(&self, out: &mut [u8], payload_len: usize) -> Result<usize, PacketError> {
        ensure_out_buf_len(out, UDP_HEADER_LEN)?;
        let len = UDP_HEADER_LEN + payload_len;
        if len > MAX_DATAGRAM_SIZE {
            return Err(PacketError::Malformed("UDP length > 65535"));
        }
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&(len as u16).to_be_bytes());
        out[6..8].copy_from_slice(&0u16.to_be_bytes());
        Ok(len)
    }

    pub fn build_vec(&self, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; UDP_HEADER_LEN + payload.len()];
        buf[UDP_HEADER_LEN..].copy_from_slice(payload);
        self.write(&mut buf, payload.len())?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_udp() {
        let payload = *b"hello";
        let builder = UdpHeaderBuilder {
            src_port: 1234,
            dst_port: 53,
        };
        let buf = builder.build_vec(&payload).unwrap();
        let pkt = UdpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.src_port(), 1234);
        assert_eq!(pkt.dst_port(), 53);
        assert_eq!(pkt.length(), 13);
        assert_eq!(pkt.checksum(), 0);
        assert_eq!(pkt.payload(), &payload);
        assert!(pkt.checksum_valid_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn length_field_bounds_payload() {
        let mut buf = UdpHeaderBuilder {
            src_port: 1,
            dst_port: 2,
        }
        .build_vec(b"abcd")
        .unwrap();
        buf.extend_from_slice(b"junk");
        assert_eq!(UdpPacket::parse(&buf).unwrap().payload(), b"abcd");

        buf[4..6].copy_from_slice(&7u16.to_be_bytes());
        assert!(matches!(
            UdpPacket::parse(&buf),
            Err(PacketError::Malformed(_))
        ));

        buf[4..6].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            UdpPacket::parse(&buf),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn verifies_nonzero_checksum() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let mut buf = UdpHeaderBuilder {
            src_port: 5353,
            dst_port: 53,
        }
        .build_vec(b"query")
        .unwrap();
        let csum = checksum::transport_checksum_ipv4(src, dst, IPPROTO_UDP, &buf);
        buf[6..8].copy_from_slice(&csum.to_be_bytes());
        assert!(UdpPacket::parse(&buf).unwrap().checksum_valid_ipv4(src, dst));

        buf[8] ^= 0xff;
        assert!(!UdpPacket::parse(&buf).unwrap().checksum_valid_ipv4(src, dst));
    }
}

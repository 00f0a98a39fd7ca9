use std::net::Ipv4Addr;

use crate::{checksum, ensure_len, ensure_out_buf_len, PacketError, MAX_DATAGRAM_SIZE};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Length of an option-less IPv4 header, the only kind the builder emits.
pub const IPV4_HEADER_LEN: usize = 20;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

#[derive(Clone, Copy, Debug)]
pub struct Ipv4Packet<'a> {
    data: &'a [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4Packet<'a> {
    /// Parses the header at the start of `data`.
    ///
    /// Bytes past the total-length field (link padding) are ignored. Options are validated for
    /// length only and skipped by [`Ipv4Packet::payload`].
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, 1)?;
        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::NotIpv4(version));
        }
        ensure_len(data, IPV4_HEADER_LEN)?;
        let ihl = (data[0] & 0x0f) as usize;
        if ihl < 5 {
            return Err(PacketError::Malformed("IPv4 IHL < 5"));
        }
        let header_len = ihl * 4;
        ensure_len(data, header_len)?;
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(data, total_len)?;
        Ok(Self {
            data,
            header_len,
            total_len,
        })
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn tos(&self) -> u8 {
        self.data[1]
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn flags_fragment(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment() & FLAG_DONT_FRAGMENT != 0
    }

    /// True for any piece of a fragmented datagram, first fragment included.
    pub fn is_fragment(&self) -> bool {
        let ff = self.flags_fragment();
        ff & FLAG_MORE_FRAGMENTS != 0 || ff & FRAGMENT_OFFSET_MASK != 0
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn options(&self) -> &'a [u8] {
        &self.data[IPV4_HEADER_LEN..self.header_len]
    }

    pub fn header(&self) -> &'a [u8] {
        &self.data[..self.header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..self.total_len]
    }

    pub fn checksum_valid(&self) -> bool {
        checksum::ipv4_header_checksum(self.header()) == 0
    }
}

/// Fields of a synthesized IPv4 header. Always option-less.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4HeaderBuilder {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
    pub ttl: u8,
    pub dont_fragment: bool,
}

impl Ipv4HeaderBuilder {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8) -> Self {
        Self {
            src,
            dst,
            protocol,
            identification: 0,
            ttl: 64,
            dont_fragment: true,
        }
    }

    /// Writes the header into `out[..20]` for a datagram carrying `payload_len` bytes after it,
    /// computing the header checksum in place. Returns the total datagram length.
    pub fn write(&self, out: &mut [u8], payload_len: usize) -> Result<usize, PacketError> {
        ensure_out_buf_len(out, IPV4_HEADER_LEN)?;
        let total_len = IPV4_HEADER_LEN + payload_len;
        if total_len > MAX_DATAGRAM_SIZE {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }

        out[0] = (4 << 4) | (IPV4_HEADER_LEN / 4) as u8;
        out[1] = 0;
        out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let flags = if self.dont_fragment { FLAG_DONT_FRAGMENT } else { 0 };
        out[6..8].copy_from_slice(&flags.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&0u16.to_be_bytes());
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let csum = checksum::ipv4_header_checksum(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        Ok(total_len)
    }
}

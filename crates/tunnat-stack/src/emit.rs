use std::mem;

use tracing::error;
use tunnat_packet::{
    Ipv4HeaderBuilder, TcpFlags, TcpHeaderBuilder, UdpHeaderBuilder, IPPROTO_TCP, IPPROTO_UDP,
    IPV4_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN,
};

use crate::config::StackConfig;
use crate::flow::FlowId;

/// Header space reserved in front of TCP payload read from a backing socket.
pub(crate) const TCP_HEADERS_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;
/// Header space reserved in front of UDP payload read from a backing socket.
pub(crate) const UDP_HEADERS_LEN: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Synthesizes packets addressed to the tun side of a flow and queues them until the table
/// hands them to its caller.
#[derive(Debug)]
pub(crate) struct PacketWriter {
    ttl: u8,
    window_size: u16,
    next_ident: u16,
    packets: Vec<Vec<u8>>,
}

impl PacketWriter {
    pub(crate) fn new(config: &StackConfig) -> Self {
        Self {
            ttl: config.ttl,
            window_size: config.window_size,
            next_ident: 0,
            packets: Vec::new(),
        }
    }

    pub(crate) fn take(&mut self) -> Vec<Vec<u8>> {
        mem::take(&mut self.packets)
    }

    fn next_ipv4_ident(&mut self) -> u16 {
        let ident = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);
        ident
    }

    fn ipv4_header(&mut self, flow: &FlowId, protocol: u8) -> Ipv4HeaderBuilder {
        let mut header = Ipv4HeaderBuilder::new(*flow.remote.ip(), *flow.local.ip(), protocol);
        header.identification = self.next_ipv4_ident();
        header.ttl = self.ttl;
        header
    }

    /// Queues a TCP segment with no payload.
    pub(crate) fn push_tcp_control(&mut self, flow: &FlowId, seq: u32, ack: u32, flags: TcpFlags) {
        let mut buf = [0u8; TCP_HEADERS_LEN];
        self.push_tcp(flow, seq, ack, flags, &mut buf);
    }

    /// Queues a TCP segment. `buf` holds [`TCP_HEADERS_LEN`] bytes of header space followed by the
    /// payload.
    pub(crate) fn push_tcp(
        &mut self,
        flow: &FlowId,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        buf: &mut [u8],
    ) {
        // A reset advertises no window.
        let window_size = if flags.contains(TcpFlags::RST) {
            0
        } else {
            self.window_size
        };
        let tcp = TcpHeaderBuilder {
            src_port: flow.remote.port(),
            dst_port: flow.local.port(),
            seq_number: seq,
            ack_number: ack,
            flags,
            window_size,
        };
        let ip = self.ipv4_header(flow, IPPROTO_TCP);
        let result = tcp
            .write(ip.src, ip.dst, &mut buf[IPV4_HEADER_LEN..])
            .and_then(|segment_len| ip.write(buf, segment_len));
        match result {
            Ok(total) => self.packets.push(buf[..total].to_vec()),
            Err(err) => error!(%flow, error = %err, "failed to encode TCP segment"),
        }
    }

    /// Queues a UDP datagram. `buf` holds [`UDP_HEADERS_LEN`] bytes of header space followed by
    /// the payload.
    pub(crate) fn push_udp(&mut self, flow: &FlowId, buf: &mut [u8]) {
        let payload_len = buf.len().saturating_sub(UDP_HEADERS_LEN);
        let udp = UdpHeaderBuilder {
            src_port: flow.remote.port(),
            dst_port: flow.local.port(),
        };
        let ip = self.ipv4_header(flow, IPPROTO_UDP);
        let result = udp
            .write(&mut buf[IPV4_HEADER_LEN..], payload_len)
            .and_then(|udp_len| ip.write(buf, udp_len));
        match result {
            Ok(total) => self.packets.push(buf[..total].to_vec()),
            Err(err) => error!(%flow, error = %err, "failed to encode UDP datagram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tunnat_packet::{Ipv4Packet, TcpSegment, UdpPacket};

    fn flow() -> FlowId {
        FlowId::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000),
            SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443),
        )
    }

    #[test]
    fn tcp_packets_are_addressed_to_the_tun_side() {
        let mut writer = PacketWriter::new(&StackConfig::default());
        let mut buf = vec![0u8; TCP_HEADERS_LEN + 3];
        buf[TCP_HEADERS_LEN..].copy_from_slice(b"abc");
        writer.push_tcp(&flow(), 10, 20, TcpFlags::PSH | TcpFlags::ACK, &mut buf);
        writer.push_tcp_control(&flow(), 13, 20, TcpFlags::RST | TcpFlags::ACK);

        let packets = writer.take();
        assert_eq!(packets.len(), 2);
        assert!(writer.take().is_empty());

        let ip = Ipv4Packet::parse(&packets[0]).unwrap();
        assert!(ip.checksum_valid());
        assert!(ip.dont_fragment());
        assert_eq!(ip.ttl(), 64);
        assert_eq!(ip.src(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(ip.dst(), Ipv4Addr::new(10, 0, 0, 2));
        let seg = TcpSegment::parse(ip.payload()).unwrap();
        assert_eq!((seg.src_port(), seg.dst_port()), (443, 40000));
        assert_eq!((seg.seq_number(), seg.ack_number()), (10, 20));
        assert_eq!(seg.window_size(), u16::MAX);
        assert_eq!(seg.payload(), b"abc");
        assert!(seg.checksum_valid_ipv4(ip.src(), ip.dst()));

        let rst_ip = Ipv4Packet::parse(&packets[1]).unwrap();
        assert_eq!(rst_ip.identification(), ip.identification().wrapping_add(1));
        let rst = TcpSegment::parse(rst_ip.payload()).unwrap();
        assert_eq!(rst.window_size(), 0);
        assert!(rst.payload().is_empty());
    }

    #[test]
    fn udp_packets_carry_zero_checksum() {
        let mut writer = PacketWriter::new(&StackConfig {
            ttl: 100,
            ..StackConfig::default()
        });
        let mut buf = vec![0u8; UDP_HEADERS_LEN + 4];
        buf[UDP_HEADERS_LEN..].copy_from_slice(b"pong");
        writer.push_udp(&flow(), &mut buf);

        let packets = writer.take();
        let ip = Ipv4Packet::parse(&packets[0]).unwrap();
        assert_eq!(ip.ttl(), 100);
        let udp = UdpPacket::parse(ip.payload()).unwrap();
        assert_eq!(udp.checksum(), 0);
        assert_eq!((udp.src_port(), udp.dst_port()), (443, 40000));
        assert_eq!(udp.payload(), b"pong");
    }
}

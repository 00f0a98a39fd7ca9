use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddrV4;

use mio::Token;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, trace, warn};
use tunnat_packet::{
    Ipv4Packet, TcpFlags, TcpSegment, UdpPacket, IPPROTO_TCP, IPPROTO_UDP, MAX_DATAGRAM_SIZE,
};

use crate::backend::{Backend, Readiness, UdpBacking};
use crate::config::StackConfig;
use crate::emit::{PacketWriter, UDP_HEADERS_LEN};
use crate::flow::FlowId;
use crate::stats::StackStats;
use crate::tcp::{Connection, TcpContext, Verdict};

/// Tokens from this value up are never handed to backing sockets; the event loop uses them for
/// its own sources.
pub const RESERVED_TOKEN_BASE: usize = usize::MAX - 15;

/// What a readiness token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Udp(FlowId),
    Tcp(FlowId),
}

#[derive(Debug)]
struct UdpSession<U> {
    token: Token,
    socket: U,
}

/// The NAT core: owns every flow's backing socket and TCP state, keyed by [`FlowId`].
///
/// All mutation happens through [`SessionTable::handle_outbound`] (a packet read from the tun)
/// and [`SessionTable::handle_inbound_readiness`] (a backing socket became ready). Both return
/// the packets to write back to the tun, in order.
pub struct SessionTable<B: Backend> {
    backend: B,
    config: StackConfig,
    writer: PacketWriter,
    rng: StdRng,
    next_token: usize,
    registrations: HashMap<Token, Registration>,
    udp: HashMap<FlowId, UdpSession<B::Udp>>,
    tcp: HashMap<FlowId, Connection<B::Tcp>>,
    scratch: Vec<u8>,
    stats: StackStats,
}

impl<B: Backend> SessionTable<B> {
    pub fn new(backend: B, config: StackConfig) -> Self {
        let rng = match config.isn_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            backend,
            writer: PacketWriter::new(&config),
            config,
            rng,
            next_token: 0,
            registrations: HashMap::new(),
            udp: HashMap::new(),
            tcp: HashMap::new(),
            scratch: vec![0u8; MAX_DATAGRAM_SIZE],
            stats: StackStats::default(),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn stats(&self) -> StackStats {
        self.stats
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn registration(&self, token: Token) -> Option<Registration> {
        self.registrations.get(&token).copied()
    }

    pub fn tcp_connection(&self, flow: &FlowId) -> Option<&Connection<B::Tcp>> {
        self.tcp.get(flow)
    }

    pub fn udp_token(&self, flow: &FlowId) -> Option<Token> {
        self.udp.get(flow).map(|session| session.token)
    }

    pub fn tcp_connection_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_session_count(&self) -> usize {
        self.udp.len()
    }

    /// Routes one IP packet read from the tun.
    pub fn handle_outbound(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        self.stats.packets_outbound += 1;
        match Ipv4Packet::parse(packet) {
            Ok(ip) if ip.is_fragment() => {
                debug!(src = %ip.src(), dst = %ip.dst(), "dropping IP fragment");
                self.stats.dropped_unsupported += 1;
            }
            Ok(ip) => match ip.protocol() {
                IPPROTO_UDP => self.outbound_udp(&ip),
                IPPROTO_TCP => self.outbound_tcp(&ip),
                protocol => {
                    debug!(protocol, src = %ip.src(), dst = %ip.dst(), "dropping unsupported protocol");
                    self.stats.dropped_unsupported += 1;
                }
            },
            Err(err) => {
                debug!(error = %err, len = packet.len(), "dropping malformed packet");
                self.stats.dropped_malformed += 1;
            }
        }
        self.take_emitted()
    }

    /// Services a readiness event for the backing socket registered under `token`.
    pub fn handle_inbound_readiness(&mut self, token: Token, readiness: Readiness) -> Vec<Vec<u8>> {
        match self.registration(token) {
            Some(Registration::Udp(flow)) => self.inbound_udp(flow, readiness),
            Some(Registration::Tcp(flow)) => self.inbound_tcp(flow, readiness),
            None => trace!(token = token.0, "readiness for stale token"),
        }
        self.take_emitted()
    }

    /// Releases every backing socket.
    pub fn shutdown(&mut self) {
        debug!(
            tcp = self.tcp.len(),
            udp = self.udp.len(),
            "closing all sessions"
        );
        for (_, conn) in self.tcp.drain() {
            self.stats.tcp_closed += 1;
            self.backend.close_tcp(conn.into_socket());
        }
        for (_, session) in self.udp.drain() {
            self.stats.udp_closed += 1;
            self.backend.close_udp(session.socket);
        }
        self.registrations.clear();
        self.writer.take();
    }

    fn take_emitted(&mut self) -> Vec<Vec<u8>> {
        let packets = self.writer.take();
        self.stats.packets_emitted += packets.len() as u64;
        packets
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            if self.next_token >= RESERVED_TOKEN_BASE {
                self.next_token = 0;
            }
            let token = Token(self.next_token);
            self.next_token += 1;
            if !self.registrations.contains_key(&token) {
                return token;
            }
        }
    }

    fn outbound_udp(&mut self, ip: &Ipv4Packet<'_>) {
        let udp = match UdpPacket::parse(ip.payload()) {
            Ok(udp) => udp,
            Err(err) => {
                debug!(error = %err, src = %ip.src(), dst = %ip.dst(), "dropping malformed UDP datagram");
                self.stats.dropped_malformed += 1;
                return;
            }
        };
        let flow = FlowId::new(
            SocketAddrV4::new(ip.src(), udp.src_port()),
            SocketAddrV4::new(ip.dst(), udp.dst_port()),
        );

        if !self.udp.contains_key(&flow) {
            let token = self.allocate_token();
            match self.backend.open_udp(token, flow.remote) {
                Ok(socket) => {
                    self.registrations.insert(token, Registration::Udp(flow));
                    self.udp.insert(flow, UdpSession { token, socket });
                    self.stats.udp_opened += 1;
                    debug!(%flow, token = token.0, "opened UDP session");
                }
                Err(err) => {
                    warn!(%flow, error = %err, "failed to open backing UDP socket");
                    self.stats.socket_errors += 1;
                    return;
                }
            }
        }
        let Some(session) = self.udp.get_mut(&flow) else {
            return;
        };

        let payload = udp.payload();
        match session.socket.send(payload) {
            Ok(n) if n == payload.len() => {}
            Ok(n) => {
                error!(%flow, written = n, len = payload.len(), "short write on backing UDP socket");
                self.stats.socket_errors += 1;
                self.close_udp(&flow);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                debug!(%flow, len = payload.len(), "backing UDP socket full, dropping datagram");
                self.stats.dropped_backpressure += 1;
            }
            Err(err) => {
                warn!(%flow, error = %err, "backing UDP send failed, closing session");
                self.stats.socket_errors += 1;
                self.close_udp(&flow);
            }
        }
    }

    fn inbound_udp(&mut self, flow: FlowId, readiness: Readiness) {
        if !readiness.readable {
            return;
        }
        let Some(session) = self.udp.get_mut(&flow) else {
            return;
        };
        let failure = loop {
            match session.socket.recv(&mut self.scratch[UDP_HEADERS_LEN..]) {
                Ok(0) => {
                    error!(%flow, "empty read from backing UDP socket");
                }
                Ok(n) => {
                    self.writer
                        .push_udp(&flow, &mut self.scratch[..UDP_HEADERS_LEN + n]);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break None,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => break Some(err),
            }
        };
        if let Some(err) = failure {
            warn!(%flow, error = %err, "backing UDP receive failed, closing session");
            self.stats.socket_errors += 1;
            self.close_udp(&flow);
        }
    }

    fn outbound_tcp(&mut self, ip: &Ipv4Packet<'_>) {
        let seg = match TcpSegment::parse(ip.payload()) {
            Ok(seg) => seg,
            Err(err) => {
                debug!(error = %err, src = %ip.src(), dst = %ip.dst(), "dropping malformed TCP segment");
                self.stats.dropped_malformed += 1;
                return;
            }
        };
        let flow = FlowId::new(
            SocketAddrV4::new(ip.src(), seg.src_port()),
            SocketAddrV4::new(ip.dst(), seg.dst_port()),
        );

        let verdict = match self.tcp.get_mut(&flow) {
            Some(conn) => {
                let mut cx = TcpContext {
                    writer: &mut self.writer,
                    stats: &mut self.stats,
                    scratch: &mut self.scratch,
                    config: &self.config,
                };
                conn.on_segment(&seg, &mut cx)
            }
            None => {
                let flags = seg.flags();
                if flags.contains(TcpFlags::SYN) && !flags.intersects(TcpFlags::ACK | TcpFlags::RST) {
                    self.open_tcp(flow, &seg);
                } else {
                    self.reject_unmatched(flow, &seg);
                }
                return;
            }
        };
        if verdict == Verdict::Close {
            self.close_tcp(&flow);
        }
    }

    fn open_tcp(&mut self, flow: FlowId, syn: &TcpSegment<'_>) {
        let token = self.allocate_token();
        let socket = match self.backend.open_tcp(token, flow.remote) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%flow, error = %err, "failed to open backing TCP socket");
                self.stats.socket_errors += 1;
                self.writer.push_tcp_control(
                    &flow,
                    0,
                    syn.seq_number().wrapping_add(1),
                    TcpFlags::RST | TcpFlags::ACK,
                );
                self.stats.resets_sent += 1;
                return;
            }
        };

        let isn: u32 = self.rng.gen();
        let mut conn = Connection::new(flow, token, socket, isn, syn);
        self.registrations.insert(token, Registration::Tcp(flow));
        self.stats.tcp_opened += 1;
        debug!(%flow, token = token.0, isn, "opening TCP connection");

        let mut cx = TcpContext {
            writer: &mut self.writer,
            stats: &mut self.stats,
            scratch: &mut self.scratch,
            config: &self.config,
        };
        let verdict = conn.poll_connect(&mut cx);
        self.tcp.insert(flow, conn);
        if verdict == Verdict::Close {
            self.close_tcp(&flow);
        }
    }

    /// Answers a segment for a flow with no connection. Resets are ignored; anything else is
    /// refused with a reset built from the segment's own numbers.
    fn reject_unmatched(&mut self, flow: FlowId, seg: &TcpSegment<'_>) {
        let flags = seg.flags();
        self.stats.tcp_unmatched += 1;
        if flags.contains(TcpFlags::RST) {
            trace!(%flow, "reset for unknown connection ignored");
            return;
        }
        debug!(%flow, flags = ?flags, "segment for unknown connection, resetting");
        if flags.contains(TcpFlags::ACK) {
            self.writer
                .push_tcp_control(&flow, seg.ack_number(), 0, TcpFlags::RST);
        } else {
            let mut len = seg.payload().len() as u32;
            if flags.contains(TcpFlags::SYN) {
                len += 1;
            }
            if flags.contains(TcpFlags::FIN) {
                len += 1;
            }
            self.writer.push_tcp_control(
                &flow,
                0,
                seg.seq_number().wrapping_add(len),
                TcpFlags::RST | TcpFlags::ACK,
            );
        }
        self.stats.resets_sent += 1;
    }

    fn inbound_tcp(&mut self, flow: FlowId, readiness: Readiness) {
        let Some(conn) = self.tcp.get_mut(&flow) else {
            return;
        };
        let mut cx = TcpContext {
            writer: &mut self.writer,
            stats: &mut self.stats,
            scratch: &mut self.scratch,
            config: &self.config,
        };
        if conn.on_readiness(readiness, &mut cx) == Verdict::Close {
            self.close_tcp(&flow);
        }
    }

    fn close_tcp(&mut self, flow: &FlowId) {
        if let Some(conn) = self.tcp.remove(flow) {
            self.registrations.remove(&conn.token());
            self.stats.tcp_closed += 1;
            debug!(%flow, state = ?conn.state(), "closed TCP connection");
            self.backend.close_tcp(conn.into_socket());
        }
    }

    fn close_udp(&mut self, flow: &FlowId) {
        if let Some(session) = self.udp.remove(flow) {
            self.registrations.remove(&session.token);
            self.stats.udp_closed += 1;
            debug!(%flow, "closed UDP session");
            self.backend.close_udp(session.socket);
        }
    }
}

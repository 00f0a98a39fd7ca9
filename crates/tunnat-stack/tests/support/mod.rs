#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use tunnat_stack::packet::{
    Ipv4HeaderBuilder, Ipv4Packet, TcpFlags, TcpHeaderBuilder, TcpSegment, UdpHeaderBuilder,
    UdpPacket, IPPROTO_TCP, IPPROTO_UDP, IPV4_HEADER_LEN,
};
use tunnat_stack::{Backend, FlowId, StackConfig, TcpBacking, Token, UdpBacking};

pub const LOCAL: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1234);
pub const REMOTE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);

pub fn flow() -> FlowId {
    FlowId::new(LOCAL, REMOTE)
}

pub fn config() -> StackConfig {
    StackConfig {
        isn_seed: Some(7),
        write_retry_limit: 4,
        ..StackConfig::default()
    }
}

/// Backend calls in the order they happened, shared by the backend and every socket it created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Protect(Token),
    Register(Token),
    UdpSend { token: Token, len: usize },
    CloseTcp(Token),
    CloseUdp(Token),
}

pub type CallLog = Rc<RefCell<Vec<Call>>>;

#[derive(Debug)]
pub enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Debug, Default)]
pub struct MockTcpState {
    pub connected: bool,
    pub connect_error: Option<io::ErrorKind>,
    pub reads: VecDeque<ReadStep>,
    pub written: Vec<u8>,
    /// Results returned by `write` before it starts accepting bytes.
    pub write_script: VecDeque<io::ErrorKind>,
    pub write_shut: bool,
}

#[derive(Debug, Clone)]
pub struct MockTcp {
    pub token: Token,
    pub remote: SocketAddrV4,
    pub state: Rc<RefCell<MockTcpState>>,
}

impl Read for MockTcp {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        match state.reads.front_mut() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => {
                let kind = *kind;
                state.reads.pop_front();
                Err(kind.into())
            }
            Some(ReadStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                data.drain(..n);
                if data.is_empty() {
                    state.reads.pop_front();
                }
                Ok(n)
            }
        }
    }
}

impl Write for MockTcp {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.write_script.pop_front() {
            return Err(kind.into());
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TcpBacking for MockTcp {
    fn finish_connect(&mut self) -> io::Result<bool> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.connect_error.take() {
            return Err(kind.into());
        }
        Ok(state.connected)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.state.borrow_mut().write_shut = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockUdpState {
    pub sent: Vec<Vec<u8>>,
    pub incoming: VecDeque<io::Result<Vec<u8>>>,
    /// Result of the next `send` instead of accepting the datagram.
    pub send_override: Option<io::Result<usize>>,
}

#[derive(Debug, Clone)]
pub struct MockUdp {
    pub token: Token,
    pub remote: SocketAddrV4,
    pub state: Rc<RefCell<MockUdpState>>,
    log: CallLog,
}

impl UdpBacking for MockUdp {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.send_override.take() {
            return result;
        }
        state.sent.push(buf.to_vec());
        self.log.borrow_mut().push(Call::UdpSend {
            token: self.token,
            len: buf.len(),
        });
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state.borrow_mut().incoming.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Err(err)) => Err(err),
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
        }
    }
}

/// In-memory backend. New TCP sockets connect immediately unless `connect_immediately` is off.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub log: CallLog,
    pub tcp: Rc<RefCell<Vec<MockTcp>>>,
    pub udp: Rc<RefCell<Vec<MockUdp>>>,
    pub connect_immediately: bool,
    pub fail_open: bool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            log: CallLog::default(),
            tcp: Rc::default(),
            udp: Rc::default(),
            connect_immediately: true,
            fail_open: false,
        }
    }
}

impl MockBackend {
    pub fn calls(&self) -> Vec<Call> {
        self.log.borrow().clone()
    }

    pub fn protect_count(&self) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|call| matches!(call, Call::Protect(_)))
            .count()
    }

    pub fn tcp_socket(&self, index: usize) -> MockTcp {
        self.tcp.borrow()[index].clone()
    }

    pub fn udp_socket(&self, index: usize) -> MockUdp {
        self.udp.borrow()[index].clone()
    }

    fn open(&mut self, token: Token) -> io::Result<()> {
        if self.fail_open {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let mut log = self.log.borrow_mut();
        log.push(Call::Protect(token));
        log.push(Call::Register(token));
        Ok(())
    }
}

impl Backend for MockBackend {
    type Tcp = MockTcp;
    type Udp = MockUdp;

    fn open_tcp(&mut self, token: Token, remote: SocketAddrV4) -> io::Result<MockTcp> {
        self.open(token)?;
        let socket = MockTcp {
            token,
            remote,
            state: Rc::new(RefCell::new(MockTcpState {
                connected: self.connect_immediately,
                ..MockTcpState::default()
            })),
        };
        self.tcp.borrow_mut().push(socket.clone());
        Ok(socket)
    }

    fn open_udp(&mut self, token: Token, remote: SocketAddrV4) -> io::Result<MockUdp> {
        self.open(token)?;
        let socket = MockUdp {
            token,
            remote,
            state: Rc::default(),
            log: self.log.clone(),
        };
        self.udp.borrow_mut().push(socket.clone());
        Ok(socket)
    }

    fn close_tcp(&mut self, socket: MockTcp) {
        self.log.borrow_mut().push(Call::CloseTcp(socket.token));
    }

    fn close_udp(&mut self, socket: MockUdp) {
        self.log.borrow_mut().push(Call::CloseUdp(socket.token));
    }
}

pub fn tcp_packet(
    from: SocketAddrV4,
    to: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let segment = TcpHeaderBuilder {
        src_port: from.port(),
        dst_port: to.port(),
        seq_number: seq,
        ack_number: ack,
        flags,
        window_size: 0xffff,
    }
    .build_vec(*from.ip(), *to.ip(), payload)
    .unwrap();
    ip_packet(from, to, IPPROTO_TCP, &segment)
}

pub fn udp_packet(from: SocketAddrV4, to: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let datagram = UdpHeaderBuilder {
        src_port: from.port(),
        dst_port: to.port(),
    }
    .build_vec(payload)
    .unwrap();
    ip_packet(from, to, IPPROTO_UDP, &datagram)
}

fn ip_packet(from: SocketAddrV4, to: SocketAddrV4, protocol: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; IPV4_HEADER_LEN];
    buf.extend_from_slice(body);
    Ipv4HeaderBuilder::new(*from.ip(), *to.ip(), protocol)
        .write(&mut buf, body.len())
        .unwrap();
    buf
}

/// Outbound segment from the tun side of [`flow`].
pub fn outbound(seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
    tcp_packet(LOCAL, REMOTE, seq, ack, flags, payload)
}

/// A TCP segment the engine wrote toward the tun, with its addressing verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

pub fn parse_tcp(packet: &[u8]) -> Emitted {
    let ip = Ipv4Packet::parse(packet).unwrap();
    assert!(ip.checksum_valid(), "bad IPv4 checksum");
    assert_eq!(ip.protocol(), IPPROTO_TCP);
    let seg = TcpSegment::parse(ip.payload()).unwrap();
    assert!(seg.checksum_valid_ipv4(ip.src(), ip.dst()), "bad TCP checksum");
    Emitted {
        src: SocketAddrV4::new(ip.src(), seg.src_port()),
        dst: SocketAddrV4::new(ip.dst(), seg.dst_port()),
        seq: seg.seq_number(),
        ack: seg.ack_number(),
        flags: seg.flags(),
        window: seg.window_size(),
        payload: seg.payload().to_vec(),
    }
}

pub fn parse_udp(packet: &[u8]) -> (SocketAddrV4, SocketAddrV4, Vec<u8>) {
    let ip = Ipv4Packet::parse(packet).unwrap();
    assert!(ip.checksum_valid(), "bad IPv4 checksum");
    assert_eq!(ip.protocol(), IPPROTO_UDP);
    let udp = UdpPacket::parse(ip.payload()).unwrap();
    (
        SocketAddrV4::new(ip.src(), udp.src_port()),
        SocketAddrV4::new(ip.dst(), udp.dst_port()),
        udp.payload().to_vec(),
    )
}

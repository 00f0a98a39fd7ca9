use std::io::{self, ErrorKind};
use std::thread;

use mio::Token;
use tracing::{debug, warn};
use tunnat_packet::{TcpFlags, TcpSegment};

use crate::backend::{Readiness, TcpBacking};
use crate::config::StackConfig;
use crate::emit::{PacketWriter, TCP_HEADERS_LEN};
use crate::flow::FlowId;
use crate::stats::StackStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Tun-side SYN seen; the backing socket is still connecting.
    SynSent,
    /// SYN+ACK sent; waiting for the tun side to acknowledge it.
    SynReceived,
    Established,
    /// FIN+ACK sent; the next ACK from the tun side closes the connection.
    LastAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Keep,
    Close,
}

/// Table state a connection needs while handling one event.
pub(crate) struct TcpContext<'a> {
    pub(crate) writer: &'a mut PacketWriter,
    pub(crate) stats: &'a mut StackStats,
    pub(crate) scratch: &'a mut [u8],
    pub(crate) config: &'a StackConfig,
}

/// The fake TCP endpoint presented to the tun side of one flow, paired with the real socket that
/// carries its payload.
///
/// `local_seq` is the next sequence number sent toward the tun; `local_ack` is the next sequence
/// number expected from it. `remote_seq` and `remote_ack` mirror the last values the tun side
/// sent. All arithmetic wraps modulo 2^32.
#[derive(Debug)]
pub struct Connection<T> {
    flow: FlowId,
    token: Token,
    socket: T,
    state: TcpState,
    local_seq: u32,
    local_ack: u32,
    remote_seq: u32,
    remote_ack: u32,
}

impl<T> Connection<T> {
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn local_ack(&self) -> u32 {
        self.local_ack
    }

    pub fn remote_seq(&self) -> u32 {
        self.remote_seq
    }

    pub fn remote_ack(&self) -> u32 {
        self.remote_ack
    }

    pub(crate) fn into_socket(self) -> T {
        self.socket
    }
}

impl<T: TcpBacking> Connection<T> {
    pub(crate) fn new(flow: FlowId, token: Token, socket: T, isn: u32, syn: &TcpSegment<'_>) -> Self {
        let peer_seq = syn.seq_number();
        Self {
            flow,
            token,
            socket,
            state: TcpState::SynSent,
            local_seq: isn,
            local_ack: peer_seq.wrapping_add(1),
            remote_seq: peer_seq,
            remote_ack: syn.ack_number(),
        }
    }

    /// Checks whether the backing connect finished and answers the tun-side SYN once it has.
    pub(crate) fn poll_connect(&mut self, cx: &mut TcpContext<'_>) -> Verdict {
        match self.socket.finish_connect() {
            Ok(true) => {
                self.send(cx, TcpFlags::SYN | TcpFlags::ACK);
                self.local_seq = self.local_seq.wrapping_add(1);
                self.state = TcpState::SynReceived;
                debug!(flow = %self.flow, "backing connect finished");
                Verdict::Keep
            }
            Ok(false) => Verdict::Keep,
            Err(err) => self.abort(cx, err, "backing connect failed"),
        }
    }

    /// Handles a segment the tun side sent on this flow.
    pub(crate) fn on_segment(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        let flags = seg.flags();
        if flags.contains(TcpFlags::SYN) {
            self.on_syn(seg, cx)
        } else if flags.contains(TcpFlags::RST) {
            debug!(flow = %self.flow, state = ?self.state, "reset by tun side");
            Verdict::Close
        } else if flags.contains(TcpFlags::FIN) {
            self.on_fin(seg, cx)
        } else if flags.contains(TcpFlags::ACK) {
            self.on_ack(seg, cx)
        } else {
            self.unexpected(seg, cx)
        }
    }

    /// Handles readiness of the backing socket.
    pub(crate) fn on_readiness(&mut self, readiness: Readiness, cx: &mut TcpContext<'_>) -> Verdict {
        match self.state {
            TcpState::SynSent if !readiness.is_empty() => self.poll_connect(cx),
            TcpState::Established if readiness.readable => self.drain(cx),
            // Reads that arrive before the handshake completes are picked up on entering
            // ESTABLISHED.
            _ => Verdict::Keep,
        }
    }

    fn on_syn(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        if self.state == TcpState::SynSent {
            self.remote_seq = seg.seq_number();
            self.local_ack = seg.seq_number().wrapping_add(1);
            debug!(flow = %self.flow, "duplicate SYN while connecting");
            return Verdict::Keep;
        }
        debug!(flow = %self.flow, state = ?self.state, "SYN on open connection, resetting");
        self.reset(cx);
        Verdict::Close
    }

    fn on_fin(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        match self.state {
            TcpState::Established => {}
            TcpState::LastAck => return self.on_fin_closing(seg, cx),
            _ => return self.unexpected(seg, cx),
        }
        if seg.seq_number() != self.local_ack {
            return self.reacknowledge(seg, cx);
        }
        if let Some(verdict) = self.consume_fin(seg, cx) {
            return verdict;
        }
        self.send(cx, TcpFlags::FIN | TcpFlags::ACK);
        self.local_seq = self.local_seq.wrapping_add(1);
        self.state = TcpState::LastAck;
        debug!(flow = %self.flow, "tun side closed, entering LAST_ACK");
        Verdict::Keep
    }

    /// A FIN after ours went out: either the tun side closing simultaneously or a retransmission
    /// of a FIN already consumed. Both are answered by repeating our FIN+ACK, whose sequence
    /// number is already spent.
    fn on_fin_closing(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        if seg.seq_number() == self.local_ack {
            if let Some(verdict) = self.consume_fin(seg, cx) {
                return verdict;
            }
            debug!(flow = %self.flow, "simultaneous close");
        }
        cx.writer.push_tcp_control(
            &self.flow,
            self.local_seq.wrapping_sub(1),
            self.local_ack,
            TcpFlags::FIN | TcpFlags::ACK,
        );
        Verdict::Keep
    }

    /// Writes an in-order FIN's payload to the backing socket, acknowledges the FIN and shuts the
    /// backing write half. Returns a verdict only when the write failed.
    fn consume_fin(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Option<Verdict> {
        let payload = seg.payload();
        if !payload.is_empty() {
            if let Err(err) = self.write_backing(payload, cx.config.write_retry_limit) {
                return Some(self.abort(cx, err, "backing write failed"));
            }
        }
        self.remote_seq = seg.seq_number();
        self.remote_ack = seg.ack_number();
        self.local_ack = seg
            .seq_number()
            .wrapping_add(payload.len() as u32)
            .wrapping_add(1);
        if let Err(err) = self.socket.shutdown_write() {
            debug!(flow = %self.flow, error = %err, "failed to shut down backing write half");
        }
        None
    }

    fn on_ack(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        match self.state {
            TcpState::SynSent => self.unexpected(seg, cx),
            TcpState::SynReceived => {
                self.state = TcpState::Established;
                debug!(flow = %self.flow, "connection established");
                match self.accept_payload(seg, cx) {
                    Verdict::Keep => self.drain(cx),
                    Verdict::Close => Verdict::Close,
                }
            }
            TcpState::Established => self.accept_payload(seg, cx),
            TcpState::LastAck => {
                debug!(flow = %self.flow, "final ACK, closing");
                Verdict::Close
            }
        }
    }

    /// Writes an in-order payload to the backing socket and acknowledges it.
    fn accept_payload(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        let payload = seg.payload();
        if payload.is_empty() {
            self.remote_seq = seg.seq_number();
            self.remote_ack = seg.ack_number();
            return Verdict::Keep;
        }
        if seg.seq_number() != self.local_ack {
            return self.reacknowledge(seg, cx);
        }
        if let Err(err) = self.write_backing(payload, cx.config.write_retry_limit) {
            return self.abort(cx, err, "backing write failed");
        }
        self.remote_seq = seg.seq_number();
        self.remote_ack = seg.ack_number();
        self.local_ack = seg.seq_number().wrapping_add(payload.len() as u32);
        self.send(cx, TcpFlags::ACK);
        Verdict::Keep
    }

    /// Answers a retransmitted or out-of-order segment with the current acknowledgment and
    /// discards its payload.
    fn reacknowledge(&mut self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        debug!(
            flow = %self.flow,
            seq = seg.seq_number(),
            expected = self.local_ack,
            len = seg.payload().len(),
            "segment out of order, re-acknowledging"
        );
        self.send(cx, TcpFlags::ACK);
        Verdict::Keep
    }

    /// Reads everything the backing socket has buffered and forwards it as PSH+ACK segments.
    fn drain(&mut self, cx: &mut TcpContext<'_>) -> Verdict {
        let chunk = cx.config.max_segment_payload();
        loop {
            let buf = &mut cx.scratch[..TCP_HEADERS_LEN + chunk];
            match self.socket.read(&mut buf[TCP_HEADERS_LEN..]) {
                Ok(0) => {
                    self.send(cx, TcpFlags::FIN | TcpFlags::ACK);
                    self.local_seq = self.local_seq.wrapping_add(1);
                    self.state = TcpState::LastAck;
                    debug!(flow = %self.flow, "backing socket closed, entering LAST_ACK");
                    return Verdict::Keep;
                }
                Ok(n) => {
                    cx.writer.push_tcp(
                        &self.flow,
                        self.local_seq,
                        self.local_ack,
                        TcpFlags::PSH | TcpFlags::ACK,
                        &mut buf[..TCP_HEADERS_LEN + n],
                    );
                    self.local_seq = self.local_seq.wrapping_add(n as u32);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Verdict::Keep,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return self.abort(cx, err, "backing read failed"),
            }
        }
    }

    /// Drains `payload` into the backing socket, yielding between `WouldBlock` results.
    fn write_backing(&mut self, mut payload: &[u8], retry_limit: u32) -> io::Result<()> {
        let mut retries = 0u32;
        while !payload.is_empty() {
            match self.socket.write(payload) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => payload = &payload[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > retry_limit {
                        return Err(io::Error::new(
                            ErrorKind::TimedOut,
                            "backing socket stayed full",
                        ));
                    }
                    thread::yield_now();
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn unexpected(&self, seg: &TcpSegment<'_>, cx: &mut TcpContext<'_>) -> Verdict {
        debug!(
            flow = %self.flow,
            state = ?self.state,
            flags = ?seg.flags(),
            "unexpected segment dropped"
        );
        cx.stats.dropped_unexpected += 1;
        Verdict::Keep
    }

    fn abort(&mut self, cx: &mut TcpContext<'_>, err: io::Error, what: &str) -> Verdict {
        warn!(flow = %self.flow, state = ?self.state, error = %err, "{what}, resetting");
        cx.stats.socket_errors += 1;
        self.reset(cx);
        Verdict::Close
    }

    fn reset(&self, cx: &mut TcpContext<'_>) {
        self.send(cx, TcpFlags::RST | TcpFlags::ACK);
        cx.stats.resets_sent += 1;
    }

    fn send(&self, cx: &mut TcpContext<'_>, flags: TcpFlags) {
        cx.writer
            .push_tcp_control(&self.flow, self.local_seq, self.local_ack, flags);
    }
}

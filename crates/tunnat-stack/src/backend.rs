use std::io::{self, Read, Write};
use std::net::SocketAddrV4;
use std::os::fd::BorrowedFd;

use mio::event::Event;
use mio::Token;

/// Marks a freshly created backing socket so its traffic bypasses the tun route.
///
/// Invoked exactly once per socket, before it connects or is registered for readiness.
pub trait Protect {
    fn protect(&mut self, socket: BorrowedFd<'_>) -> io::Result<()>;
}

impl<F> Protect for F
where
    F: FnMut(BorrowedFd<'_>) -> io::Result<()>,
{
    fn protect(&mut self, socket: BorrowedFd<'_>) -> io::Result<()> {
        self(socket)
    }
}

/// Leaves sockets untouched. For hosts where the tun route already excludes the engine's own
/// traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtect;

impl Protect for NoProtect {
    fn protect(&mut self, _socket: BorrowedFd<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Non-blocking stream socket carrying one TCP flow.
pub trait TcpBacking: Read + Write {
    /// Reports progress of the non-blocking connect: `Ok(true)` once connected, `Ok(false)` while
    /// still pending, `Err` when the connect failed.
    fn finish_connect(&mut self) -> io::Result<bool>;

    fn shutdown_write(&mut self) -> io::Result<()>;
}

/// Non-blocking datagram socket connected to one UDP flow's remote endpoint.
pub trait UdpBacking {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Source of backing sockets for the session table.
///
/// Implementations create a protected socket, start connecting it to `remote` and register it
/// for readiness under `token` before returning it.
pub trait Backend {
    type Tcp: TcpBacking;
    type Udp: UdpBacking;

    fn open_tcp(&mut self, token: Token, remote: SocketAddrV4) -> io::Result<Self::Tcp>;

    fn open_udp(&mut self, token: Token, remote: SocketAddrV4) -> io::Result<Self::Udp>;

    /// Deregisters and releases a socket whose session ended.
    fn close_tcp(&mut self, socket: Self::Tcp);

    fn close_udp(&mut self, socket: Self::Udp);
}

/// Readiness reported for one backing socket. Error and hang-up conditions are folded into both
/// directions so the next read or write surfaces them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
    pub const ALL: Readiness = Readiness {
        readable: true,
        writable: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }

    pub fn merge(self, other: Readiness) -> Readiness {
        Readiness {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        let error = event.is_error();
        Self {
            readable: event.is_readable() || event.is_read_closed() || error,
            writable: event.is_writable() || event.is_write_closed() || error,
        }
    }
}

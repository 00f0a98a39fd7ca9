use std::io;
use std::net::{Shutdown, SocketAddr, SocketAddrV4};
use std::os::fd::AsFd;

use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::backend::{Backend, Protect, TcpBacking, UdpBacking};

/// Backend that opens real host sockets and registers them with a `mio` registry.
pub struct MioBackend<P> {
    registry: Registry,
    protector: P,
}

impl<P: Protect> MioBackend<P> {
    pub fn new(registry: Registry, protector: P) -> Self {
        Self {
            registry,
            protector,
        }
    }

    pub fn protector(&self) -> &P {
        &self.protector
    }

    fn new_socket(&mut self, ty: Type, protocol: Protocol) -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, ty, Some(protocol))?;
        socket.set_nonblocking(true)?;
        self.protector.protect(socket.as_fd())?;
        Ok(socket)
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

impl<P: Protect> Backend for MioBackend<P> {
    type Tcp = TcpStream;
    type Udp = UdpSocket;

    fn open_tcp(&mut self, token: Token, remote: SocketAddrV4) -> io::Result<TcpStream> {
        let socket = self.new_socket(Type::STREAM, Protocol::TCP)?;
        socket.set_nodelay(true)?;
        match socket.connect(&SocketAddr::V4(remote).into()) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => return Err(err),
        }
        let mut stream = TcpStream::from_std(socket.into());
        // Writable interest from the start so connect completion is reported.
        self.registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        trace!(token = token.0, %remote, "registered backing TCP socket");
        Ok(stream)
    }

    fn open_udp(&mut self, token: Token, remote: SocketAddrV4) -> io::Result<UdpSocket> {
        let socket = self.new_socket(Type::DGRAM, Protocol::UDP)?;
        socket.connect(&SocketAddr::V4(remote).into())?;
        let mut udp = UdpSocket::from_std(socket.into());
        self.registry.register(&mut udp, token, Interest::READABLE)?;
        trace!(token = token.0, %remote, "registered backing UDP socket");
        Ok(udp)
    }

    fn close_tcp(&mut self, mut socket: TcpStream) {
        if let Err(err) = self.registry.deregister(&mut socket) {
            debug!(error = %err, "failed to deregister TCP socket");
        }
    }

    fn close_udp(&mut self, mut socket: UdpSocket) {
        if let Err(err) = self.registry.deregister(&mut socket) {
            debug!(error = %err, "failed to deregister UDP socket");
        }
    }
}

impl TcpBacking for TcpStream {
    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(err) = self.take_error()? {
            return Err(err);
        }
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) if connect_in_progress(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl UdpBacking for UdpSocket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf)
    }
}

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};

use mio::event::Source;
use mio::net::UnixDatagram;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

/// A packet-oriented device carrying one whole IPv4 datagram per read or write.
///
/// Implementations must be non-blocking. `recv` returning `Ok(0)` is an empty datagram; a
/// device that has hung up reports `ErrorKind::UnexpectedEof` instead.
pub trait TunDevice: Source {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// A tun interface descriptor set up by the host. The descriptor must already be in
/// non-blocking mode.
#[derive(Debug)]
pub struct TunFile {
    file: File,
}

impl TunFile {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }
}

impl Source for TunFile {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).deregister(registry)
    }
}

impl TunDevice for TunFile {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf)? {
            // A tun descriptor never yields empty packets; zero means end of file.
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tun descriptor reached end of file",
            )),
            n => Ok(n),
        }
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.file.write(packet)
    }
}

/// One end of a datagram socket pair standing in for a tun device.
impl TunDevice for UnixDatagram {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        UnixDatagram::recv(self, buf)
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        UnixDatagram::send(self, packet)
    }
}

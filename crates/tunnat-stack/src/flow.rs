use core::fmt;
use std::net::SocketAddrV4;

/// Identity of a NAT flow: the tun-side endpoint and the remote endpoint it addresses.
///
/// Built from an outbound packet's (source, destination). Packets synthesized toward the tun use
/// the swapped pair: source `remote`, destination `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl FlowId {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

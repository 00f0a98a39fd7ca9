#![forbid(unsafe_code)]

//! Userspace NAT relaying IPv4 TCP and UDP flows read from a tun device onto host sockets.
//!
//! [`SessionTable`] is the NAT core and is independent of any I/O mechanism: it consumes tun
//! packets and socket readiness and produces tun packets, talking to sockets through a
//! [`Backend`]. [`Engine`] drives it with a `mio` poll loop, a [`TunDevice`] and the
//! [`MioBackend`].

mod backend;
mod config;
mod emit;
mod engine;
mod error;
mod flow;
mod mio_backend;
mod stats;
mod table;
mod tcp;
mod tun;

pub use backend::{Backend, NoProtect, Protect, Readiness, TcpBacking, UdpBacking};
pub use config::{EngineConfig, StackConfig};
pub use engine::{Engine, StopHandle};
pub use error::EngineError;
pub use flow::FlowId;
pub use mio_backend::MioBackend;
pub use stats::{EngineStats, StackStats};
pub use table::{Registration, SessionTable, RESERVED_TOKEN_BASE};
pub use tcp::{Connection, TcpState};
pub use tun::{TunDevice, TunFile};

pub use mio::Token;
pub use tunnat_packet as packet;

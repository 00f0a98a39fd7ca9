use std::time::Duration;

use tunnat_packet::{IPV4_HEADER_LEN, TCP_HEADER_LEN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// TTL written into every synthesized IPv4 header.
    pub ttl: u8,

    /// Receive window advertised to the tun side. Fixed; the stack does no flow control.
    pub window_size: u16,

    /// MTU of the tun interface. Bounds the payload of each synthesized TCP segment to
    /// `mtu - 40` bytes.
    pub mtu: u16,

    /// Number of `WouldBlock` results tolerated while draining one tun-side TCP payload into a
    /// backing socket before the connection is reset.
    pub write_retry_limit: u32,

    /// Seed for initial sequence numbers. `None` draws from OS entropy.
    pub isn_seed: Option<u64>,
}

impl StackConfig {
    /// Largest TCP payload carried by one synthesized segment.
    pub fn max_segment_payload(&self) -> usize {
        (self.mtu as usize)
            .saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN)
            .max(1)
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            ttl: 64,
            window_size: u16::MAX,
            mtu: 1500,
            write_retry_limit: 10_000,
            isn_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub stack: StackConfig,

    /// Upper bound on one readiness wait.
    pub poll_timeout: Duration,

    /// Capacity of the readiness event buffer.
    pub events_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stack: StackConfig::default(),
            poll_timeout: Duration::from_millis(10),
            events_capacity: 1024,
        }
    }
}

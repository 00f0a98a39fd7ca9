/// Counters kept by [`crate::SessionTable`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackStats {
    /// Packets handed to `handle_outbound`.
    pub packets_outbound: u64,
    /// Packets synthesized for the tun.
    pub packets_emitted: u64,

    pub dropped_malformed: u64,
    /// Non-TCP/UDP protocols and IP fragments.
    pub dropped_unsupported: u64,
    /// TCP segments whose flags have no transition in the connection's current state.
    pub dropped_unexpected: u64,
    /// Non-SYN TCP segments that matched no connection.
    pub tcp_unmatched: u64,
    /// Outbound datagrams dropped because the backing socket buffer was full.
    pub dropped_backpressure: u64,

    pub tcp_opened: u64,
    pub tcp_closed: u64,
    pub udp_opened: u64,
    pub udp_closed: u64,
    pub resets_sent: u64,
    /// Backing socket open, connect, read or write failures.
    pub socket_errors: u64,
}

/// Counters kept by [`crate::Engine`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub stack: StackStats,
    pub tun_packets_read: u64,
    pub tun_packets_written: u64,
    /// Packets that found the tun device full and waited in the backlog.
    pub tun_write_queued: u64,
}

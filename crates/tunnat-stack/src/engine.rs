use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};
use tunnat_packet::MAX_DATAGRAM_SIZE;

use crate::backend::{Protect, Readiness};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mio_backend::MioBackend;
use crate::stats::EngineStats;
use crate::table::SessionTable;
use crate::tun::TunDevice;

const TUN_TOKEN: Token = Token(usize::MAX - 1);
const WAKER_TOKEN: Token = Token(usize::MAX - 2);

/// Stops a running [`Engine`] from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            warn!(error = %err, "failed to wake engine");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Single-threaded readiness loop relaying packets between a tun device and the session table.
///
/// Packets the tun cannot take yet wait in a backlog, in order. While the backlog is non-empty,
/// backing socket readiness is parked instead of serviced, so no further backing data is read
/// until the tun catches up.
pub struct Engine<T: TunDevice, P: Protect> {
    poll: Poll,
    events: Events,
    tun: T,
    table: SessionTable<MioBackend<P>>,
    config: EngineConfig,
    stop: StopHandle,
    tun_buf: Vec<u8>,
    backlog: VecDeque<Vec<u8>>,
    parked: HashMap<Token, Readiness>,
    parked_order: VecDeque<Token>,
    stats: EngineStats,
}

impl<T: TunDevice, P: Protect> Engine<T, P> {
    pub fn new(mut tun: T, protector: P, config: EngineConfig) -> Result<Self, EngineError> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut tun,
            TUN_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let backend = MioBackend::new(poll.registry().try_clone()?, protector);
        let table = SessionTable::new(backend, config.stack.clone());
        Ok(Self {
            events: Events::with_capacity(config.events_capacity),
            poll,
            tun,
            table,
            config,
            stop: StopHandle {
                stop: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            tun_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            backlog: VecDeque::new(),
            parked: HashMap::new(),
            parked_order: VecDeque::new(),
            stats: EngineStats::default(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            stack: self.table.stats(),
            ..self.stats
        }
    }

    pub fn table(&self) -> &SessionTable<MioBackend<P>> {
        &self.table
    }

    /// Runs until stopped or a fatal error. Every backing socket and the tun registration are
    /// released on return.
    pub fn run(mut self) -> Result<EngineStats, EngineError> {
        info!(
            mtu = self.config.stack.mtu,
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            "engine started"
        );
        let result = self.run_loop();
        self.table.shutdown();
        if let Err(err) = self.poll.registry().deregister(&mut self.tun) {
            debug!(error = %err, "failed to deregister tun");
        }
        if !self.backlog.is_empty() {
            debug!(packets = self.backlog.len(), "discarding tun backlog");
        }
        let stats = self.stats();
        match &result {
            Ok(()) => info!(?stats, "engine stopped"),
            Err(err) => error!(error = %err, ?stats, "engine failed"),
        }
        result.map(|()| stats)
    }

    fn run_loop(&mut self) -> Result<(), EngineError> {
        let mut tun_pending = false;
        while !self.stop.is_stopped() {
            // A packet was just read; the tun may hold more, which edge-triggered readiness
            // will not report again.
            let timeout = if tun_pending {
                Duration::ZERO
            } else {
                self.config.poll_timeout
            };
            tun_pending = self.turn(timeout)?;
        }
        Ok(())
    }

    /// One loop iteration. Returns whether a tun packet was read.
    fn turn(&mut self, timeout: Duration) -> Result<bool, EngineError> {
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err.into());
        }

        self.flush_backlog()?;

        let read_tun = match self.tun.recv(&mut self.tun_buf) {
            Ok(n) => {
                self.stats.tun_packets_read += 1;
                trace!(len = n, "packet from tun");
                let packets = self.table.handle_outbound(&self.tun_buf[..n]);
                self.write_packets(packets)?;
                true
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(EngineError::TunClosed)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => false,
            Err(err) if err.kind() == ErrorKind::Interrupted => true,
            Err(err) => return Err(err.into()),
        };

        for event in self.events.iter() {
            match event.token() {
                TUN_TOKEN | WAKER_TOKEN => {}
                token => match self.parked.entry(token) {
                    Entry::Occupied(mut parked) => {
                        let readiness = parked.get_mut();
                        *readiness = readiness.merge(Readiness::from(event));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Readiness::from(event));
                        self.parked_order.push_back(token);
                    }
                },
            }
        }
        self.service_parked()?;
        Ok(read_tun)
    }

    /// Services parked backing readiness in arrival order until the tun pushes back.
    fn service_parked(&mut self) -> Result<(), EngineError> {
        while self.backlog.is_empty() {
            let Some(token) = self.parked_order.pop_front() else {
                break;
            };
            let Some(readiness) = self.parked.remove(&token) else {
                continue;
            };
            let packets = self.table.handle_inbound_readiness(token, readiness);
            self.write_packets(packets)?;
        }
        if !self.parked_order.is_empty() {
            trace!(
                parked = self.parked_order.len(),
                backlog = self.backlog.len(),
                "tun backlogged, backing sockets parked"
            );
        }
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<Vec<u8>>) -> Result<(), EngineError> {
        for packet in packets {
            if self.backlog.is_empty() && self.write_tun(&packet)? {
                continue;
            }
            self.stats.tun_write_queued += 1;
            self.backlog.push_back(packet);
        }
        Ok(())
    }

    fn flush_backlog(&mut self) -> Result<(), EngineError> {
        if self.backlog.is_empty() {
            return Ok(());
        }
        while let Some(packet) = self.backlog.pop_front() {
            if !self.write_tun(&packet)? {
                self.backlog.push_front(packet);
                return Ok(());
            }
        }
        debug!("tun backlog flushed");
        Ok(())
    }

    /// Writes one packet. Returns `false` when the tun would block and the packet was not
    /// written.
    fn write_tun(&mut self, packet: &[u8]) -> Result<bool, EngineError> {
        loop {
            match self.tun.send(packet) {
                Ok(n) if n == packet.len() => {
                    self.stats.tun_packets_written += 1;
                    return Ok(true);
                }
                Ok(n) => {
                    error!(written = n, len = packet.len(), "short write to tun");
                    return Err(EngineError::ShortTunWrite {
                        written: n,
                        len: packet.len(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

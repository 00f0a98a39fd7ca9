use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tunnat_stack::{Engine, EngineConfig, Protect, StackConfig, TunFile};

#[derive(Parser, Debug)]
#[command(
    name = "tunnat",
    about = "Relay the IPv4 TCP/UDP flows of an already configured tun device onto host sockets."
)]
struct Args {
    /// Inherited descriptor of the tun device (IFF_TUN | IFF_NO_PI)
    #[arg(long, env = "TUNNAT_TUN_FD", value_name = "FD")]
    tun_fd: RawFd,

    /// SO_MARK applied to every outbound socket so policy routing keeps it off the tun
    #[arg(long, env = "TUNNAT_FWMARK", value_name = "MARK")]
    fwmark: Option<u32>,

    /// MTU of the tun interface
    #[arg(long, env = "TUNNAT_MTU", default_value_t = 1500)]
    mtu: u16,

    /// Upper bound on one readiness wait, in milliseconds
    #[arg(long, env = "TUNNAT_POLL_TIMEOUT_MS", default_value_t = 10)]
    poll_timeout_ms: u64,

    /// TTL of packets written to the tun
    #[arg(long, env = "TUNNAT_TTL", default_value_t = 64)]
    ttl: u8,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            stack: StackConfig {
                ttl: self.ttl,
                mtu: self.mtu,
                ..StackConfig::default()
            },
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            ..EngineConfig::default()
        }
    }
}

/// Marks outbound sockets with a firewall mark.
struct FwmarkProtector {
    mark: Option<u32>,
}

impl Protect for FwmarkProtector {
    fn protect(&mut self, socket: BorrowedFd<'_>) -> io::Result<()> {
        let Some(mark) = self.mark else {
            return Ok(());
        };
        set_mark(socket, mark)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_mark(socket: BorrowedFd<'_>, mark: u32) -> io::Result<()> {
    socket2::SockRef::from(&socket).set_mark(mark)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_mark(_socket: BorrowedFd<'_>, _mark: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_MARK is only available on Linux",
    ))
}

fn take_tun_fd(raw: RawFd) -> anyhow::Result<OwnedFd> {
    if raw < 0 {
        bail!("invalid tun descriptor {raw}");
    }
    // SAFETY: `raw` is a descriptor inherited from the parent for this process to own; nothing
    // else in the process refers to it.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: `fd` is a valid open descriptor for the duration of both calls.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("failed to read tun descriptor flags");
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error()).context("failed to make tun descriptor non-blocking");
    }
    Ok(fd)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let tun = TunFile::new(take_tun_fd(args.tun_fd)?);
    let protector = FwmarkProtector { mark: args.fwmark };
    let engine = Engine::new(tun, protector, args.engine_config())
        .context("failed to start engine")?;
    let stop = engine.stop_handle();
    tracing::info!(tun_fd = args.tun_fd, fwmark = ?args.fwmark, "tunnat running");

    let mut run = tokio::task::spawn_blocking(move || engine.run());
    let result = tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            stop.stop();
            run.await
        }
    };

    let stats = result
        .context("engine thread panicked")?
        .context("engine stopped with an error")?;
    tracing::info!(
        tcp_opened = stats.stack.tcp_opened,
        udp_opened = stats.stack.udp_opened,
        tun_packets_read = stats.tun_packets_read,
        tun_packets_written = stats.tun_packets_written,
        "tunnat exited"
    );
    Ok(())
}

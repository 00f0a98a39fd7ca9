use std::io;

/// Failures that stop the engine. Per-flow failures are handled inside the session table and
/// never surface here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("tun device closed")]
    TunClosed,
    #[error("short write to tun device: wrote {written} of {len} bytes")]
    ShortTunWrite { written: usize, len: usize },
}

use thiserror::Error;

use crate::device::DeviceError;

/// Reason why chunk finalization failed. Fatal: surfaced to the caller as an
/// initialization failure before any frame begins.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Failed to realize chunk {chunk} on the device ({vertex_bytes} vertex bytes, {index_bytes} index bytes)")]
    RealizationFailed {
        chunk: u32,
        vertex_bytes: u32,
        index_bytes: u32,
        #[source]
        inner: DeviceError,
    },
}

/// Reason why the worker pool failed to initialize.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool requires at least one worker")]
    NoWorkers,
    #[error("Frame pipelining requires at least two frame slots, got {got}")]
    TooFewFrameSlots { got: usize },
    #[error("Working set size must be non-zero")]
    EmptyWorkingSet,
    #[error("Failed to spawn worker thread")]
    WorkerSpawnFailed(#[source] std::io::Error),
}

/// Per-frame failure. All variants indicate either a device problem or a
/// coordination bug; none are retried. A failed frame poisons the pool.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Device did not release frame slot {slot} of worker {worker} in time")]
    DeviceStall { worker: usize, slot: usize },
    #[error("Device rejected a command sequence")]
    Submit(#[source] DeviceError),
    #[error("A previous frame failed; the worker pool refuses further frames")]
    Poisoned,
}

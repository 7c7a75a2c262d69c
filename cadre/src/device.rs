//! The opaque device backend the core renders against.
//!
//! The core never issues graphics-API calls itself. It hands the device
//! finalized chunk payloads for upload and ordered command sequences for
//! execution, and synchronizes frame-slot reuse through [`Fence`] objects the
//! device signals once it has finished consuming a slot's submissions.

use std::{
    sync::Arc,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::exec::CommandSequence;

/// Failure reported by a device implementation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device is out of memory")]
    OutOfMemory,
    #[error("Device was lost")]
    Lost,
    #[error("Device rejected the submission as malformed")]
    InvalidSubmission,
}

/// A fence wait ran out of time. Treated as a device stall by the pool.
#[derive(Debug, Error)]
#[error("Fence wait timed out")]
pub struct FenceTimeout;

/// Completion sync primitive for one frame slot.
///
/// The device signals the fence once every sequence submitted from the slot's
/// last frame has been consumed. A successful wait consumes the signal.
pub trait Fence: Send + Sync {
    fn wait(&self, timeout: Duration) -> Result<(), FenceTimeout>;
}

/// An ordered consumer of chunk uploads and command sequences.
///
/// Implementations wrap a concrete graphics backend. Sequences arrive in
/// submission order; ordering across workers carries no meaning beyond it.
pub trait Device: Send + Sync + 'static {
    /// Creates the backing storage for a sealed chunk at its final
    /// accumulated size and uploads the staged payload bytes. Called once per
    /// chunk; a chunk's capacity is never revisited.
    fn realize_chunk(&self, chunk: u32, vertex_data: &[u8], index_data: &[u8]) -> Result<(), DeviceError>;

    /// Executes one worker-encoded command sequence.
    fn submit(&self, sequence: &CommandSequence) -> Result<(), DeviceError>;

    /// Creates a fence for one frame slot. Called once per (worker, slot)
    /// at pool startup.
    fn create_fence(&self) -> Arc<dyn Fence>;

    /// All sequences for `frame` have been submitted. The device signals the
    /// affected slot fences once it has consumed them.
    fn frame_complete(&self, frame: u64);
}

struct SignalFence {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl SignalFence {
    fn signal(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_all();
    }
}

impl Fence for SignalFence {
    fn wait(&self, timeout: Duration) -> Result<(), FenceTimeout> {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.condvar.wait_for(&mut signaled, timeout).timed_out() && !*signaled {
                return Err(FenceTimeout);
            }
        }
        *signaled = false;
        Ok(())
    }
}

/// Device that accepts everything and consumes submissions instantly.
///
/// Every fence it hands out is signaled at `frame_complete`, so slot reuse
/// never blocks. Used by headless runs and tests.
#[derive(Default)]
pub struct NullDevice {
    fences: Mutex<Vec<Arc<SignalFence>>>,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for NullDevice {
    fn realize_chunk(&self, _chunk: u32, _vertex_data: &[u8], _index_data: &[u8]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn submit(&self, _sequence: &CommandSequence) -> Result<(), DeviceError> {
        Ok(())
    }

    fn create_fence(&self) -> Arc<dyn Fence> {
        let fence = Arc::new(SignalFence {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        });
        self.fences.lock().push(fence.clone());
        fence
    }

    fn frame_complete(&self, _frame: u64) {
        for fence in self.fences.lock().iter() {
            fence.signal();
        }
    }
}

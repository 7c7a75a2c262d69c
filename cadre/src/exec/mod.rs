//! Concurrent command generation: encoding and the worker pool.

mod encode;
mod pool;

pub use encode::*;
pub use pool::*;

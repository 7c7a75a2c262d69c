//! Stateful owners of scene-lifetime resources.

mod chunk;
mod scene;

pub use chunk::*;
pub use scene::*;

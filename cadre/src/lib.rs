//! Batching and concurrent draw-command generation core for large replicated
//! CAD scenes.
//!
//! The crate turns a static object/geometry/material graph into an ordered
//! sequence of backend-agnostic draw commands while minimizing per-draw state
//! changes, and generates those commands in parallel on a persistent worker
//! pool with frame-pipelined buffering.
//!
//! The pipeline, leaves first:
//!
//! - [`managers::ChunkManager`] packs geometry payloads into bounded backing
//!   chunks and hands each geometry a (chunk, offset) address.
//! - [`batch::BatchCache`] sorts and run-length-merges one object's drawable
//!   parts into minimal (state, range-list) groups.
//! - [`batch::assemble`] flattens the visible objects into one ordered
//!   [`types::DrawItem`] list under a [`types::BatchStrategy`].
//! - [`exec::WorkerPool`] partitions that list dynamically across persistent
//!   worker threads, each encoding its share into [`exec::CommandSequence`]s
//!   the coordinator submits to the [`device::Device`] in arrival order.
//!
//! Scene loading, windowing, shader compilation, and the graphics backend
//! itself are external collaborators; the backend is reached only through the
//! [`device::Device`] trait.

pub mod batch;
pub mod device;
mod error;
pub mod exec;
pub mod managers;
pub mod util;

pub use cadre_types as types;
pub use error::*;

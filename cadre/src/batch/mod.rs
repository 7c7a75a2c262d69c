//! Batching: per-object caches and whole-scene draw list assembly.

mod cache;
mod list;

pub use cache::*;
pub use list::*;

//! Small utilities used across the crate.

pub mod math;
pub mod typedefs;

//! Type declarations for the cadre batching renderer core.
//!
//! This is reexported in the cadre crate proper and includes all the "surface"
//! api arguments: the scene data model (geometries, materials, transform
//! nodes, objects), the draw items that batching produces, and the
//! configuration surface consumed by the assembler and the worker pool.

use std::{fmt::Debug, hash::Hash, marker::PhantomData, time::Duration};

use bytemuck::{Pod, Zeroable};
/// Reexport of the glam version cadre is using.
pub use glam;
use glam::{Mat4, Vec3A, Vec4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of one index. All index payloads are 32-bit indices.
pub const INDEX_SIZE: u32 = 4;

/// Alignment every vertex payload allocation is rounded up to.
pub const VERTEX_ALIGNMENT: u32 = 16;

/// Typed index into one of the scene's append-only tables.
///
/// Tables never shrink and never reuse slots, so an index stays valid for the
/// lifetime of the scene. Aliasing (clone geometries) is expressed as a second
/// index plus a back-reference, never a second owning handle.
pub struct TableIndex<T> {
    idx: usize,
    _phantom: PhantomData<T>,
}

impl<T> TableIndex<T> {
    /// Creates a new index with the given value.
    pub const fn new(idx: usize) -> Self {
        Self {
            idx,
            _phantom: PhantomData,
        }
    }

    /// Underlying value of the index.
    pub const fn idx(self) -> usize {
        self.idx
    }
}

// Need Debug/Copy/Clone/etc impls that don't require T: Trait.
impl<T> Debug for TableIndex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIndex").field("idx", &self.idx).finish()
    }
}

impl<T> Copy for TableIndex<T> {}

impl<T> Clone for TableIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for TableIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
    }
}

impl<T> Eq for TableIndex<T> {}

impl<T> PartialOrd for TableIndex<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TableIndex<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.idx.cmp(&other.idx)
    }
}

impl<T> Hash for TableIndex<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.idx.hash(state);
    }
}

pub type GeometryIndex = TableIndex<GeometryDescriptor>;
pub type MaterialIndex = TableIndex<Material>;
pub type TransformIndex = TableIndex<TransformNode>;
pub type ObjectIndex = TableIndex<ObjectDescriptor>;

/// A sub-range of an index payload, in bytes plus index count.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IndexRange {
    /// Byte offset of the first index.
    pub byte_offset: u32,
    /// Number of indices in the range.
    pub count: u32,
}

impl IndexRange {
    pub const fn new(byte_offset: u32, count: u32) -> Self {
        Self { byte_offset, count }
    }

    pub const fn is_empty(self) -> bool {
        self.count == 0
    }

    /// Byte offset one past the last index. Two ranges are contiguous when
    /// one's `end_byte_offset` equals the other's `byte_offset`.
    pub const fn end_byte_offset(self) -> u32 {
        self.byte_offset + self.count * INDEX_SIZE
    }
}

/// One drawable piece of a geometry: a solid index range and a wireframe
/// index range, both within the geometry's own index payload.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GeometryPart {
    pub solid: IndexRange,
    pub wire: IndexRange,
}

/// Error returned when a geometry's parts don't describe its payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryValidationError {
    #[error("Part {part} {kind} range ends at byte {end}, past the end of the {len} byte index payload")]
    RangeOutOfBounds {
        part: usize,
        kind: &'static str,
        end: u64,
        len: usize,
    },
    #[error("{kind} payload is {len} bytes, over the 4 GiB addressing limit")]
    PayloadTooLarge { kind: &'static str, len: usize },
}

/// Payload offsets and sizes are `u32` throughout; a longer payload would
/// silently truncate at allocation.
fn check_payload_len(kind: &'static str, len: usize) -> Result<(), GeometryValidationError> {
    if len > u32::MAX as usize {
        return Err(GeometryValidationError::PayloadTooLarge { kind, len });
    }
    Ok(())
}

/// Immutable-after-load description of a geometry's payloads and parts.
#[derive(Debug, Default, Clone)]
pub struct GeometryDescriptor {
    pub vertex_data: Vec<u8>,
    pub index_data: Vec<u8>,
    pub parts: Vec<GeometryPart>,
}

impl GeometryDescriptor {
    /// Validates that both payloads are addressable and that every part range
    /// lies within the index payload.
    pub fn validate(&self) -> Result<(), GeometryValidationError> {
        check_payload_len("vertex", self.vertex_data.len())?;
        check_payload_len("index", self.index_data.len())?;
        for (index, part) in self.parts.iter().enumerate() {
            for (kind, range) in [("solid", part.solid), ("wire", part.wire)] {
                let end = range.byte_offset as u64 + range.count as u64 * INDEX_SIZE as u64;
                if end > self.index_data.len() as u64 {
                    return Err(GeometryValidationError::RangeOutOfBounds {
                        part: index,
                        kind,
                        end,
                        len: self.index_data.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Fixed-size shading parameters, addressed by index. Immutable.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub albedo: Vec4,
    pub emissive: Vec4,
    pub roughness: f32,
    pub metallic: f32,
    pub _padding: [f32; 2],
}

impl Material {
    pub fn new(albedo: Vec4, emissive: Vec4, roughness: f32, metallic: f32) -> Self {
        Self {
            albedo,
            emissive,
            roughness,
            metallic,
            _padding: [0.0; 2],
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new(Vec4::ONE, Vec4::ZERO, 1.0, 0.0)
    }
}

/// World/object matrices plus their precomputed inverse-transposes.
///
/// Mutable only through `Scene::set_transform` (the external animation step);
/// read-only during batching and command generation.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TransformNode {
    pub world: Mat4,
    pub object: Mat4,
    pub inv_trans_world: Mat4,
    pub inv_trans_object: Mat4,
}

impl TransformNode {
    pub fn new(world: Mat4, object: Mat4) -> Self {
        Self {
            world,
            object,
            inv_trans_world: world.inverse().transpose(),
            inv_trans_object: object.inverse().transpose(),
        }
    }

    pub fn from_world(world: Mat4) -> Self {
        Self::new(world, Mat4::IDENTITY)
    }
}

impl Default for TransformNode {
    fn default() -> Self {
        Self::from_world(Mat4::IDENTITY)
    }
}

/// Per-object counterpart of a geometry part.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectPart {
    pub active: bool,
    pub material: MaterialIndex,
    /// Overrides the object's base transform for sub-assemblies when present.
    pub matrix: Option<TransformIndex>,
}

impl ObjectPart {
    pub fn new(material: MaterialIndex) -> Self {
        Self {
            active: true,
            material,
            matrix: None,
        }
    }

    pub fn with_matrix(material: MaterialIndex, matrix: TransformIndex) -> Self {
        Self {
            active: true,
            material,
            matrix: Some(matrix),
        }
    }
}

/// Error returned when an object doesn't match its geometry or references
/// out-of-bounds table entries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectValidationError {
    #[error("Object has {object_parts} parts but its geometry has {geometry_parts}")]
    PartCountMismatch {
        object_parts: usize,
        geometry_parts: usize,
    },
    #[error("Object references geometry {geometry} but the scene has {geometries} geometries")]
    GeometryOutOfBounds { geometry: usize, geometries: usize },
    #[error("Part {part} references material {material} but the scene has {materials} materials")]
    MaterialOutOfBounds {
        part: usize,
        material: usize,
        materials: usize,
    },
    #[error("Transform {transform} is out of bounds of the scene's {transforms} transforms")]
    TransformOutOfBounds { transform: usize, transforms: usize },
}

/// Description of an object: one geometry, one base transform, and one
/// object part per geometry part. Objects are the unit of instancing.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub geometry: GeometryIndex,
    pub transform: TransformIndex,
    pub parts: Vec<ObjectPart>,
}

/// The (material, transform) pair that determines which bind operations
/// precede a draw. The derived ordering (material first, then matrix) is the
/// batch builder's sort key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey {
    pub material: MaterialIndex,
    pub matrix: TransformIndex,
}

/// One atomic (geometry, transform, material, index-range) unit to be
/// rendered. Transient: rebuilt whenever the scene, strategy, or visible
/// fraction changes. The range is relative to the geometry's index payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DrawItem {
    pub geometry: GeometryIndex,
    pub matrix: TransformIndex,
    pub material: MaterialIndex,
    pub object: ObjectIndex,
    pub solid: bool,
    pub range: IndexRange,
}

/// Where a geometry's payloads landed: which chunk, and the byte offsets of
/// its vertex and index data within that chunk's buffers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub chunk: u32,
    pub vbo_offset: u32,
    pub ibo_offset: u32,
}

/// Scene-wide axis-aligned bound published by the scene provider.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Aabb {
    pub min: Vec3A,
    pub max: Vec3A,
}

impl Aabb {
    pub const ZERO: Self = Self {
        min: Vec3A::ZERO,
        max: Vec3A::ZERO,
    };

    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::ZERO
    }
}

/// How the draw list assembler turns objects into draw items.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStrategy {
    /// One draw item per (state, range) entry of each object's batch cache.
    /// State-minimal within an object; never reorders across objects.
    Grouped,
    /// One draw item per active object part, straight from the geometry.
    /// Maximum item count, no merging.
    Individual,
    /// Single linear pass in part storage order, merging consecutive
    /// same-state parts by raw count. No sort, no byte-contiguity check.
    Joined,
}

/// Configuration of the draw list assembler.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblerOptions {
    pub strategy: BatchStrategy,
    /// Globally sort the flat list by (solid-before-wire, material, geometry,
    /// matrix). Costs a whole-scene sort and destroys per-object Joined-range
    /// contiguity, so it is opt-in per run.
    pub sorted: bool,
    /// Only the first `floor(N * visible_fraction)` objects, by original
    /// index order, are considered.
    pub visible_fraction: f32,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            strategy: BatchStrategy::Grouped,
            sorted: false,
            visible_fraction: 1.0,
        }
    }
}

/// Configuration of the worker pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Number of persistent worker threads.
    pub workers: usize,
    /// Frame slots per worker. Bounds how far the CPU can race the device.
    pub frames_in_flight: usize,
    /// Draw items claimed per trip to the shared work cursor.
    pub working_set: usize,
    /// How long a worker waits for a frame slot's fence before the frame is
    /// abandoned as a device stall.
    pub slot_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            frames_in_flight: 2,
            working_set: 256,
            slot_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of the chunked buffer allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOptions {
    /// Maximum vertex bytes a single chunk may accumulate.
    pub vertex_chunk_bytes: u32,
    /// Maximum index bytes a single chunk may accumulate.
    pub index_chunk_bytes: u32,
    /// Backend minimum alignment for index data. Must be a power of two.
    pub index_alignment: u32,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            vertex_chunk_bytes: 1 << 25,
            index_chunk_bytes: 1 << 24,
            index_alignment: INDEX_SIZE,
        }
    }
}

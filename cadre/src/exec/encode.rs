//! Backend-agnostic command encoding.
//!
//! A command sequence is a flat array of fixed-size records, castable to raw
//! bytes for backends that want to copy it straight into a command stream.
//! Bind records are emitted only when the tracked state actually changes;
//! draw records follow one per item.

use bytemuck::{Pod, Zeroable};
use cadre_types::{Allocation, DrawItem, GeometryIndex, MaterialIndex, TransformIndex};

/// Bind the chunk buffers and base vertex offset of a geometry.
/// args: [chunk, vbo_offset, geometry].
pub const OP_BIND_GEOMETRY: u32 = 0;
/// Bind a material. args: [material, 0, 0].
pub const OP_BIND_MATERIAL: u32 = 1;
/// Bind a transform node. args: [matrix, 0, 0].
pub const OP_BIND_MATRIX: u32 = 2;
/// Select the solid or wireframe pipeline. args: [topology, 0, 0].
pub const OP_SET_TOPOLOGY: u32 = 3;
/// Draw indexed. args: [chunk-absolute index byte offset, index count, 0].
pub const OP_DRAW: u32 = 4;

pub const TOPOLOGY_SOLID: u32 = 0;
pub const TOPOLOGY_WIRE: u32 = 1;

/// Upper bound on records a single draw item can produce: four binds plus the
/// draw itself. Every output buffer is pre-sized from this bound; exceeding
/// it is a programming error, not a runtime condition.
pub const MAX_COMMANDS_PER_ITEM: usize = 5;

/// One fixed-size record of the encoded stream.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct EncodedCommand {
    pub op: u32,
    pub args: [u32; 3],
}

impl EncodedCommand {
    const fn new(op: u32, args: [u32; 3]) -> Self {
        Self { op, args }
    }
}

/// Tracks the last bound geometry/material/matrix/topology while encoding one
/// claimed chunk of draw items.
///
/// An encoder starts with no assumed state, so the first item of every chunk
/// re-emits its full bind set. That redundancy is what makes sequences from
/// different workers independently replayable: the coordinator may submit
/// them in any arrival order.
pub struct CommandEncoder<'a> {
    locations: &'a [Allocation],
    geometry: Option<GeometryIndex>,
    material: Option<MaterialIndex>,
    matrix: Option<TransformIndex>,
    solid: Option<bool>,
    state_changes: u32,
}

impl<'a> CommandEncoder<'a> {
    /// `locations` maps geometry index to its chunk allocation; draw offsets
    /// are resolved through it into chunk-absolute byte offsets.
    pub fn new(locations: &'a [Allocation]) -> Self {
        Self {
            locations,
            geometry: None,
            material: None,
            matrix: None,
            solid: None,
            state_changes: 0,
        }
    }

    pub fn encode(&mut self, item: &DrawItem, output: &mut Vec<EncodedCommand>) {
        let location = self.locations[item.geometry.idx()];

        if self.geometry != Some(item.geometry) {
            output.push(EncodedCommand::new(
                OP_BIND_GEOMETRY,
                [location.chunk, location.vbo_offset, item.geometry.idx() as u32],
            ));
            self.geometry = Some(item.geometry);
            self.state_changes += 1;
        }
        if self.material != Some(item.material) {
            output.push(EncodedCommand::new(OP_BIND_MATERIAL, [item.material.idx() as u32, 0, 0]));
            self.material = Some(item.material);
            self.state_changes += 1;
        }
        if self.matrix != Some(item.matrix) {
            output.push(EncodedCommand::new(OP_BIND_MATRIX, [item.matrix.idx() as u32, 0, 0]));
            self.matrix = Some(item.matrix);
            self.state_changes += 1;
        }
        if self.solid != Some(item.solid) {
            let topology = if item.solid { TOPOLOGY_SOLID } else { TOPOLOGY_WIRE };
            output.push(EncodedCommand::new(OP_SET_TOPOLOGY, [topology, 0, 0]));
            self.solid = Some(item.solid);
            self.state_changes += 1;
        }

        output.push(EncodedCommand::new(
            OP_DRAW,
            [location.ibo_offset + item.range.byte_offset, item.range.count, 0],
        ));
    }

    /// Number of bind records emitted so far.
    pub fn state_changes(&self) -> u32 {
        self.state_changes
    }
}

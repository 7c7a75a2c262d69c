//! Chunked buffer allocator.
//!
//! Packs many variable-size geometry payloads into a small number of
//! bounded backing buffer pairs ("chunks"). Allocation is append-only:
//! once a chunk would overflow either of its caps it is sealed, its capacity
//! fixed forever, and a fresh chunk becomes the active one. Sealed chunks are
//! realized on the device at their final accumulated size.

use cadre_types::{Allocation, ChunkOptions, VERTEX_ALIGNMENT};

use crate::{device::Device, error::ChunkError, util::math::round_up_pot};

struct Chunk {
    vertex_bytes: u32,
    index_bytes: u32,
    vertex_staging: Vec<u8>,
    index_staging: Vec<u8>,
    sealed: bool,
    realized: bool,
}

impl Chunk {
    fn empty() -> Self {
        Self {
            vertex_bytes: 0,
            index_bytes: 0,
            vertex_staging: Vec::new(),
            index_staging: Vec::new(),
            sealed: false,
            realized: false,
        }
    }

    fn is_unused(&self) -> bool {
        self.vertex_bytes == 0 && self.index_bytes == 0
    }
}

/// Owns the chunk list and the staged payload bytes awaiting upload.
pub struct ChunkManager {
    options: ChunkOptions,
    chunks: Vec<Chunk>,
}

impl ChunkManager {
    pub fn new(options: ChunkOptions) -> Self {
        assert!(
            options.vertex_chunk_bytes > 0 && options.index_chunk_bytes > 0,
            "chunk capacities must be non-zero"
        );
        assert!(
            options.index_alignment.is_power_of_two(),
            "index alignment must be a power of two"
        );

        Self {
            options,
            chunks: vec![Chunk::empty()],
        }
    }

    /// Reserves space for one geometry's payloads. Sizes are rounded up to
    /// the vertex and index alignments. Rolls over to a fresh chunk when the
    /// active chunk's running totals would exceed either cap.
    ///
    /// Clone geometries never call this; they copy the original's
    /// [`Allocation`].
    pub fn allocate(&mut self, vbo_size: u32, ibo_size: u32) -> Allocation {
        let vbo_size = round_up_pot(vbo_size, VERTEX_ALIGNMENT);
        let ibo_size = round_up_pot(ibo_size, self.options.index_alignment);

        let active = self.chunks.last().expect("chunk list is never empty");
        let overflows = active.vertex_bytes as u64 + vbo_size as u64 > self.options.vertex_chunk_bytes as u64
            || active.index_bytes as u64 + ibo_size as u64 > self.options.index_chunk_bytes as u64;
        // An allocation bigger than a whole chunk can't be split; it gets an
        // empty chunk to itself.
        if active.sealed || (overflows && !active.is_unused()) {
            self.seal_active();
            self.chunks.push(Chunk::empty());
        }

        if vbo_size > self.options.vertex_chunk_bytes || ibo_size > self.options.index_chunk_bytes {
            log::warn!(
                "geometry payload ({vbo_size} vertex bytes, {ibo_size} index bytes) exceeds the configured chunk caps"
            );
        }

        let chunk_index = self.chunks.len() - 1;
        let active = self.chunks.last_mut().expect("chunk list is never empty");
        let allocation = Allocation {
            chunk: chunk_index as u32,
            vbo_offset: active.vertex_bytes,
            ibo_offset: active.index_bytes,
        };
        active.vertex_bytes += vbo_size;
        active.index_bytes += ibo_size;

        allocation
    }

    /// Copies payload bytes into the staging storage at the allocated
    /// offsets. Aliased (clone) geometries share the original's bytes and
    /// must not be written twice.
    pub fn write_geometry(&mut self, allocation: Allocation, vertex_data: &[u8], index_data: &[u8]) {
        let chunk = &mut self.chunks[allocation.chunk as usize];
        debug_assert!(!chunk.realized, "cannot stage into a realized chunk");

        stage(&mut chunk.vertex_staging, allocation.vbo_offset, vertex_data);
        stage(&mut chunk.index_staging, allocation.ibo_offset, index_data);
    }

    /// Seals the active chunk and realizes every sealed-but-unrealized chunk
    /// on the device. Device failure is fatal: the scene cannot start
    /// rendering.
    pub fn finalize(&mut self, device: &dyn Device) -> Result<(), ChunkError> {
        profiling::scope!("ChunkManager::finalize");

        self.seal_active();

        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            if chunk.realized || chunk.is_unused() {
                continue;
            }
            chunk.vertex_staging.resize(chunk.vertex_bytes as usize, 0);
            chunk.index_staging.resize(chunk.index_bytes as usize, 0);

            device
                .realize_chunk(index as u32, &chunk.vertex_staging, &chunk.index_staging)
                .map_err(|inner| ChunkError::RealizationFailed {
                    chunk: index as u32,
                    vertex_bytes: chunk.vertex_bytes,
                    index_bytes: chunk.index_bytes,
                    inner,
                })?;
            chunk.realized = true;

            // The device owns the bytes now.
            chunk.vertex_staging = Vec::new();
            chunk.index_staging = Vec::new();
        }

        Ok(())
    }

    fn seal_active(&mut self) {
        let index = self.chunks.len() - 1;
        let active = self.chunks.last_mut().expect("chunk list is never empty");
        if !active.sealed {
            active.sealed = true;
            log::debug!(
                "sealed chunk {index} at {} vertex bytes, {} index bytes",
                active.vertex_bytes,
                active.index_bytes,
            );
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Accumulated (vertex, index) byte totals of a chunk.
    pub fn chunk_sizes(&self, chunk: u32) -> (u32, u32) {
        let chunk = &self.chunks[chunk as usize];
        (chunk.vertex_bytes, chunk.index_bytes)
    }
}

impl Default for ChunkManager {
    fn default() -> Self {
        Self::new(ChunkOptions::default())
    }
}

fn stage(staging: &mut Vec<u8>, offset: u32, data: &[u8]) {
    let end = offset as usize + data.len();
    if staging.len() < end {
        staging.resize(end, 0);
    }
    staging[offset as usize..end].copy_from_slice(data);
}

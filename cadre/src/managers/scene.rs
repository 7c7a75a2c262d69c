//! Scene registry.
//!
//! An explicit registry object holding the four append-only tables the
//! batching core reads: geometries, materials, transform nodes, and objects.
//! Constructed at startup and passed by reference; there are no global
//! registries. All tables are immutable for the duration of a frame, except
//! transforms, which the host's animation step may rewrite between frames.

use cadre_types::{
    Aabb, Allocation, GeometryDescriptor, GeometryIndex, GeometryPart, GeometryValidationError,
    Material, MaterialIndex, ObjectDescriptor, ObjectIndex, ObjectPart, ObjectValidationError,
    TransformIndex, TransformNode, glam::Mat4,
};

use crate::{
    batch::BatchCache,
    managers::ChunkManager,
    util::typedefs::FastHashMap,
};

/// Internal representation of a geometry.
pub struct InternalGeometry {
    /// Where this geometry's payloads live. Clones carry a copy of the
    /// original's allocation.
    pub allocation: Allocation,
    pub parts: Vec<GeometryPart>,
    pub vertex_bytes: u32,
    pub index_bytes: u32,
    /// Set on clones: the geometry whose storage this one aliases. Clones
    /// never own payload bytes.
    pub clone_of: Option<GeometryIndex>,
}

/// Internal representation of an object, with both batch caches attached.
pub struct InternalObject {
    pub geometry: GeometryIndex,
    pub transform: TransformIndex,
    pub parts: Vec<ObjectPart>,
    pub solid_cache: BatchCache,
    pub wire_cache: BatchCache,
}

/// The scene provider: four append-only tables plus a scene-wide bound.
#[derive(Default)]
pub struct Scene {
    geometries: Vec<InternalGeometry>,
    materials: Vec<Material>,
    transforms: Vec<TransformNode>,
    objects: Vec<InternalObject>,
    bounds: Aabb,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the descriptor, reserves chunk space for its payloads, and
    /// stages the bytes for upload.
    pub fn add_geometry(
        &mut self,
        chunks: &mut ChunkManager,
        descriptor: GeometryDescriptor,
    ) -> Result<GeometryIndex, GeometryValidationError> {
        profiling::scope!("Scene::add_geometry");

        descriptor.validate()?;

        let allocation = chunks.allocate(descriptor.vertex_data.len() as u32, descriptor.index_data.len() as u32);
        chunks.write_geometry(allocation, &descriptor.vertex_data, &descriptor.index_data);

        let index = GeometryIndex::new(self.geometries.len());
        self.geometries.push(InternalGeometry {
            allocation,
            vertex_bytes: descriptor.vertex_data.len() as u32,
            index_bytes: descriptor.index_data.len() as u32,
            parts: descriptor.parts,
            clone_of: None,
        });

        Ok(index)
    }

    /// Adds a clone geometry aliasing `original`'s storage. No chunk space is
    /// consumed. Clones of clones point back at the root original.
    pub fn clone_geometry(&mut self, original: GeometryIndex) -> GeometryIndex {
        let root = self.geometries[original.idx()].clone_of.unwrap_or(original);
        let source = &self.geometries[root.idx()];

        let index = GeometryIndex::new(self.geometries.len());
        self.geometries.push(InternalGeometry {
            allocation: source.allocation,
            parts: source.parts.clone(),
            vertex_bytes: source.vertex_bytes,
            index_bytes: source.index_bytes,
            clone_of: Some(root),
        });

        index
    }

    pub fn add_material(&mut self, material: Material) -> MaterialIndex {
        let index = MaterialIndex::new(self.materials.len());
        self.materials.push(material);
        index
    }

    pub fn add_transform(&mut self, node: TransformNode) -> TransformIndex {
        let index = TransformIndex::new(self.transforms.len());
        self.transforms.push(node);
        index
    }

    /// The external animation step. Does not invalidate batch caches: caches
    /// key on transform indices, not matrix values.
    pub fn set_transform(&mut self, index: TransformIndex, node: TransformNode) {
        self.transforms[index.idx()] = node;
    }

    /// Validates the descriptor against the tables and inserts the object,
    /// building both of its batch caches.
    pub fn add_object(&mut self, descriptor: ObjectDescriptor) -> Result<ObjectIndex, ObjectValidationError> {
        profiling::scope!("Scene::add_object");

        if descriptor.geometry.idx() >= self.geometries.len() {
            return Err(ObjectValidationError::GeometryOutOfBounds {
                geometry: descriptor.geometry.idx(),
                geometries: self.geometries.len(),
            });
        }
        let geometry = &self.geometries[descriptor.geometry.idx()];
        if descriptor.parts.len() != geometry.parts.len() {
            return Err(ObjectValidationError::PartCountMismatch {
                object_parts: descriptor.parts.len(),
                geometry_parts: geometry.parts.len(),
            });
        }
        self.validate_transform(descriptor.transform)?;
        for (index, part) in descriptor.parts.iter().enumerate() {
            if part.material.idx() >= self.materials.len() {
                return Err(ObjectValidationError::MaterialOutOfBounds {
                    part: index,
                    material: part.material.idx(),
                    materials: self.materials.len(),
                });
            }
            if let Some(matrix) = part.matrix {
                self.validate_transform(matrix)?;
            }
        }

        let index = ObjectIndex::new(self.objects.len());
        let (solid_cache, wire_cache) = build_caches(&geometry.parts, &descriptor.parts, descriptor.transform);
        self.objects.push(InternalObject {
            geometry: descriptor.geometry,
            transform: descriptor.transform,
            parts: descriptor.parts,
            solid_cache,
            wire_cache,
        });

        Ok(index)
    }

    fn validate_transform(&self, transform: TransformIndex) -> Result<(), ObjectValidationError> {
        if transform.idx() >= self.transforms.len() {
            return Err(ObjectValidationError::TransformOutOfBounds {
                transform: transform.idx(),
                transforms: self.transforms.len(),
            });
        }
        Ok(())
    }

    pub fn set_part_active(&mut self, object: ObjectIndex, part: usize, active: bool) {
        self.objects[object.idx()].parts[part].active = active;
        self.rebuild_caches(object);
    }

    pub fn set_part_material(&mut self, object: ObjectIndex, part: usize, material: MaterialIndex) {
        debug_assert!(material.idx() < self.materials.len());
        self.objects[object.idx()].parts[part].material = material;
        self.rebuild_caches(object);
    }

    pub fn set_part_matrix(&mut self, object: ObjectIndex, part: usize, matrix: Option<TransformIndex>) {
        self.objects[object.idx()].parts[part].matrix = matrix;
        self.rebuild_caches(object);
    }

    fn rebuild_caches(&mut self, object: ObjectIndex) {
        let object = &mut self.objects[object.idx()];
        let geometry = &self.geometries[object.geometry.idx()];
        let (solid_cache, wire_cache) = build_caches(&geometry.parts, &object.parts, object.transform);
        object.solid_cache = solid_cache;
        object.wire_cache = wire_cache;
    }

    /// Replicates every object currently in the scene `copies` times.
    ///
    /// Each copy shares geometry storage through clone geometries and gets
    /// fresh transform nodes: `placement(copy)` is applied on top of each
    /// source node's world matrix. Transform overrides are remapped
    /// consistently, so a sub-assembly override in the original stays a
    /// distinct node in every copy. Material and active state are inherited
    /// unchanged, which keeps the copies' batch caches structurally identical
    /// to their sources (only matrix indices shift).
    pub fn replicate(&mut self, copies: usize, mut placement: impl FnMut(usize) -> Mat4) -> Vec<ObjectIndex> {
        profiling::scope!("Scene::replicate");

        let source_objects = self.objects.len();
        let mut added = Vec::with_capacity(source_objects * copies);

        for copy in 0..copies {
            let offset = placement(copy);
            let mut geometry_remap: FastHashMap<usize, GeometryIndex> = FastHashMap::default();
            let mut transform_remap: FastHashMap<usize, TransformIndex> = FastHashMap::default();

            for object_index in 0..source_objects {
                let (geometry, base, parts) = {
                    let object = &self.objects[object_index];
                    (object.geometry, object.transform, object.parts.clone())
                };

                let geometry = match geometry_remap.get(&geometry.idx()) {
                    Some(&clone) => clone,
                    None => {
                        let clone = self.clone_geometry(geometry);
                        geometry_remap.insert(geometry.idx(), clone);
                        clone
                    }
                };

                let base = self.remap_transform(&mut transform_remap, base, offset);
                let parts = parts
                    .into_iter()
                    .map(|mut part| {
                        part.matrix = part
                            .matrix
                            .map(|matrix| self.remap_transform(&mut transform_remap, matrix, offset));
                        part
                    })
                    .collect();

                let index = self
                    .add_object(ObjectDescriptor {
                        geometry,
                        transform: base,
                        parts,
                    })
                    .expect("replicated object mirrors an already-validated source");
                added.push(index);
            }
        }

        log::debug!(
            "replicated {source_objects} objects {copies} times: {} objects total",
            self.objects.len()
        );

        added
    }

    fn remap_transform(
        &mut self,
        remap: &mut FastHashMap<usize, TransformIndex>,
        source: TransformIndex,
        offset: Mat4,
    ) -> TransformIndex {
        match remap.get(&source.idx()) {
            Some(&mapped) => mapped,
            None => {
                let node = self.transforms[source.idx()];
                let mapped = self.add_transform(TransformNode::new(offset * node.world, node.object));
                remap.insert(source.idx(), mapped);
                mapped
            }
        }
    }

    pub fn geometries(&self) -> &[InternalGeometry] {
        &self.geometries
    }

    pub fn geometry(&self, index: GeometryIndex) -> &InternalGeometry {
        &self.geometries[index.idx()]
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn transforms(&self) -> &[TransformNode] {
        &self.transforms
    }

    pub fn objects(&self) -> &[InternalObject] {
        &self.objects
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Allocation of every geometry, indexed by geometry index. This is the
    /// table command encoding resolves draw offsets against.
    pub fn geometry_locations(&self) -> Vec<Allocation> {
        self.geometries.iter().map(|geometry| geometry.allocation).collect()
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: Aabb) {
        self.bounds = bounds;
    }
}

fn build_caches(
    geometry_parts: &[GeometryPart],
    object_parts: &[ObjectPart],
    base: TransformIndex,
) -> (BatchCache, BatchCache) {
    (
        BatchCache::build(geometry_parts, object_parts, base, true),
        BatchCache::build(geometry_parts, object_parts, base, false),
    )
}

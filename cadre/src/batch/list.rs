//! Draw list assembly.
//!
//! Flattens the visible objects into one ordered `Vec<DrawItem>` under the
//! chosen batching strategy. The list is transient: it is rebuilt whenever
//! the scene, the strategy, or the visible fraction changes, and is shared
//! read-only with the worker pool for the duration of a frame.

use cadre_types::{
    AssemblerOptions, BatchStrategy, DrawItem, IndexRange, ObjectIndex, StateKey,
};

use crate::managers::{InternalObject, Scene};

/// Builds the frame's flat draw item list.
pub fn assemble(scene: &Scene, options: &AssemblerOptions) -> Vec<DrawItem> {
    profiling::scope!("assemble");

    let visible = visible_count(scene.object_count(), options.visible_fraction);
    let mut items = Vec::new();

    for (index, object) in scene.objects()[..visible].iter().enumerate() {
        let object_index = ObjectIndex::new(index);
        match options.strategy {
            BatchStrategy::Grouped => {
                emit_grouped(&mut items, object, object_index, true);
                emit_grouped(&mut items, object, object_index, false);
            }
            BatchStrategy::Individual => {
                emit_individual(scene, &mut items, object, object_index, true);
                emit_individual(scene, &mut items, object, object_index, false);
            }
            BatchStrategy::Joined => {
                emit_joined(scene, &mut items, object, object_index, true);
                emit_joined(scene, &mut items, object, object_index, false);
            }
        }
    }

    if options.sorted {
        // Minimizes state changes across object boundaries at the cost of a
        // whole-scene sort, and of any contiguity Joined accumulated.
        items.sort_by_key(|item| (!item.solid, item.material, item.geometry, item.matrix));
    }

    log::trace!(
        "assembled {} draw items from {visible} visible objects ({:?})",
        items.len(),
        options.strategy
    );

    items
}

/// Deterministic visibility truncation: the first `floor(N * fraction)`
/// objects by original index order, not a random sample.
fn visible_count(objects: usize, fraction: f32) -> usize {
    ((objects as f64 * fraction.clamp(0.0, 1.0) as f64).floor() as usize).min(objects)
}

fn emit_grouped(items: &mut Vec<DrawItem>, object: &InternalObject, object_index: ObjectIndex, solid: bool) {
    let cache = if solid { &object.solid_cache } else { &object.wire_cache };
    for (key, ranges) in cache.iter() {
        for &range in ranges {
            items.push(item(object, object_index, key, solid, range));
        }
    }
}

fn emit_individual(
    scene: &Scene,
    items: &mut Vec<DrawItem>,
    object: &InternalObject,
    object_index: ObjectIndex,
    solid: bool,
) {
    let geometry_parts = &scene.geometry(object.geometry).parts;
    for (geometry_part, object_part) in geometry_parts.iter().zip(&object.parts) {
        if !object_part.active {
            continue;
        }
        let range = if solid { geometry_part.solid } else { geometry_part.wire };
        if range.is_empty() {
            continue;
        }
        let key = StateKey {
            material: object_part.material,
            matrix: object_part.matrix.unwrap_or(object.transform),
        };
        items.push(item(object, object_index, key, solid, range));
    }
}

/// Single linear pass in part storage order: consecutive active parts sharing
/// a state key accumulate into one running range, extended by raw count.
/// Unlike the batch cache, no byte-contiguity check is made; parts are merged
/// on the assumption that authoring order lays them out back to back. An
/// inactive part is a discontinuity and flushes the run.
fn emit_joined(
    scene: &Scene,
    items: &mut Vec<DrawItem>,
    object: &InternalObject,
    object_index: ObjectIndex,
    solid: bool,
) {
    let geometry_parts = &scene.geometry(object.geometry).parts;
    let mut current: Option<(StateKey, IndexRange)> = None;

    for (geometry_part, object_part) in geometry_parts.iter().zip(&object.parts) {
        if !object_part.active {
            if let Some((key, range)) = current.take() {
                items.push(item(object, object_index, key, solid, range));
            }
            continue;
        }
        let range = if solid { geometry_part.solid } else { geometry_part.wire };
        if range.is_empty() {
            continue;
        }
        let key = StateKey {
            material: object_part.material,
            matrix: object_part.matrix.unwrap_or(object.transform),
        };

        current = Some(match current {
            Some((current_key, mut running)) if current_key == key => {
                running.count += range.count;
                (current_key, running)
            }
            Some((current_key, running)) => {
                items.push(item(object, object_index, current_key, solid, running));
                (key, range)
            }
            None => (key, range),
        });
    }

    if let Some((key, range)) = current {
        items.push(item(object, object_index, key, solid, range));
    }
}

fn item(
    object: &InternalObject,
    object_index: ObjectIndex,
    key: StateKey,
    solid: bool,
    range: IndexRange,
) -> DrawItem {
    DrawItem {
        geometry: object.geometry,
        matrix: key.matrix,
        material: key.material,
        object: object_index,
        solid,
        range,
    }
}

#[cfg(test)]
mod tests {
    use cadre_types::{
        AssemblerOptions, BatchStrategy, ChunkOptions, DrawItem, GeometryDescriptor, GeometryPart,
        IndexRange, Material, ObjectDescriptor, ObjectPart, TransformNode,
    };

    use super::assemble;
    use crate::managers::{ChunkManager, Scene};

    /// Three objects sharing one geometry. The geometry's parts are laid out
    /// back to back in the index payload; object A assigns states
    /// [(m0, x0), (m0, x0), (m1, x0)], objects B and C use one material each.
    fn build_scene() -> Scene {
        let mut scene = Scene::new();
        let mut chunks = ChunkManager::new(ChunkOptions::default());

        let geometry = scene
            .add_geometry(
                &mut chunks,
                GeometryDescriptor {
                    vertex_data: vec![0; 144],
                    index_data: vec![0; 72],
                    parts: vec![
                        GeometryPart {
                            solid: IndexRange::new(0, 6),
                            wire: IndexRange::new(60, 1),
                        },
                        GeometryPart {
                            solid: IndexRange::new(24, 6),
                            wire: IndexRange::new(64, 1),
                        },
                        GeometryPart {
                            solid: IndexRange::new(48, 3),
                            wire: IndexRange::new(68, 1),
                        },
                    ],
                },
            )
            .unwrap();
        let m0 = scene.add_material(Material::default());
        let m1 = scene.add_material(Material::default());
        let transform = scene.add_transform(TransformNode::default());

        scene
            .add_object(ObjectDescriptor {
                geometry,
                transform,
                parts: vec![ObjectPart::new(m0), ObjectPart::new(m0), ObjectPart::new(m1)],
            })
            .unwrap();
        scene
            .add_object(ObjectDescriptor {
                geometry,
                transform,
                parts: vec![ObjectPart::new(m0); 3],
            })
            .unwrap();
        scene
            .add_object(ObjectDescriptor {
                geometry,
                transform,
                parts: vec![ObjectPart::new(m1); 3],
            })
            .unwrap();

        scene
    }

    fn options(strategy: BatchStrategy) -> AssemblerOptions {
        AssemblerOptions {
            strategy,
            sorted: false,
            visible_fraction: 1.0,
        }
    }

    fn solid_items_of_object(items: &[DrawItem], object: usize) -> Vec<DrawItem> {
        items
            .iter()
            .filter(|item| item.object.idx() == object && item.solid)
            .copied()
            .collect()
    }

    #[test]
    fn grouped_merges_individual_does_not() {
        let scene = build_scene();

        let grouped = assemble(&scene, &options(BatchStrategy::Grouped));
        let individual = assemble(&scene, &options(BatchStrategy::Individual));

        // Object A: the two contiguous m0 parts merge under Grouped.
        assert_eq!(solid_items_of_object(&grouped, 0).len(), 2);
        assert_eq!(solid_items_of_object(&individual, 0).len(), 3);

        let merged = solid_items_of_object(&grouped, 0);
        assert_eq!(merged[0].range, IndexRange::new(0, 12));
        assert_eq!(merged[1].range, IndexRange::new(48, 3));
    }

    #[test]
    fn joined_merges_adjacent_same_state_parts() {
        let scene = build_scene();

        let joined = assemble(&scene, &options(BatchStrategy::Joined));

        // Object A: parts 0 and 1 share (m0, x0) and are adjacent in storage
        // order, so they merge; part 2 flushes. Object B merges all three.
        assert_eq!(solid_items_of_object(&joined, 0).len(), 2);
        let object_b = solid_items_of_object(&joined, 1);
        assert_eq!(object_b.len(), 1);
        assert_eq!(object_b[0].range, IndexRange::new(0, 15));
    }

    #[test]
    fn joined_merges_by_raw_count_without_contiguity() {
        // Two same-state parts with a byte gap between their ranges. The
        // batch cache keeps them separate; Joined still folds them into one
        // running range. This asymmetry is deliberate: Joined trades the
        // contiguity check for a cheaper single pass.
        let mut scene = Scene::new();
        let mut chunks = ChunkManager::new(ChunkOptions::default());
        let geometry = scene
            .add_geometry(
                &mut chunks,
                GeometryDescriptor {
                    vertex_data: vec![0; 16],
                    index_data: vec![0; 96],
                    parts: vec![
                        GeometryPart {
                            solid: IndexRange::new(0, 6),
                            wire: IndexRange::default(),
                        },
                        GeometryPart {
                            solid: IndexRange::new(48, 6),
                            wire: IndexRange::default(),
                        },
                    ],
                },
            )
            .unwrap();
        let material = scene.add_material(Material::default());
        let transform = scene.add_transform(TransformNode::default());
        scene
            .add_object(ObjectDescriptor {
                geometry,
                transform,
                parts: vec![ObjectPart::new(material); 2],
            })
            .unwrap();

        let joined = assemble(&scene, &options(BatchStrategy::Joined));
        let grouped = assemble(&scene, &options(BatchStrategy::Grouped));

        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].range, IndexRange::new(0, 12));
        assert_eq!(grouped.len(), 2);
    }

    #[test]
    fn strategies_cover_the_same_index_bytes() {
        let scene = build_scene();

        let coverage = |strategy| {
            let mut bytes: Vec<(usize, bool, u32)> = assemble(&scene, &options(strategy))
                .iter()
                .flat_map(|item| {
                    let geometry = item.geometry.idx();
                    let solid = item.solid;
                    (0..item.range.count).map(move |i| (geometry, solid, item.range.byte_offset + i * 4))
                })
                .collect();
            bytes.sort_unstable();
            bytes
        };

        let grouped = coverage(BatchStrategy::Grouped);
        assert_eq!(grouped, coverage(BatchStrategy::Individual));
        assert_eq!(grouped, coverage(BatchStrategy::Joined));
    }

    #[test]
    fn visible_fraction_is_a_prefix() {
        let scene = build_scene();

        let all = assemble(&scene, &options(BatchStrategy::Grouped));
        let two_thirds = assemble(
            &scene,
            &AssemblerOptions {
                visible_fraction: 0.67,
                ..options(BatchStrategy::Grouped)
            },
        );
        let none = assemble(
            &scene,
            &AssemblerOptions {
                visible_fraction: 0.0,
                ..options(BatchStrategy::Grouped)
            },
        );

        // floor(3 * 0.67) = 2 objects.
        assert!(two_thirds.iter().all(|item| item.object.idx() < 2));
        assert_eq!(two_thirds[..], all[..two_thirds.len()]);
        assert!(none.is_empty());
    }

    #[test]
    fn global_sort_orders_solid_then_state() {
        let scene = build_scene();

        let items = assemble(
            &scene,
            &AssemblerOptions {
                sorted: true,
                ..options(BatchStrategy::Individual)
            },
        );

        let keys: Vec<_> = items
            .iter()
            .map(|item| (!item.solid, item.material, item.geometry, item.matrix))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        // All solid items precede all wire items.
        let first_wire = items.iter().position(|item| !item.solid).unwrap();
        assert!(items[first_wire..].iter().all(|item| !item.solid));
    }

    #[test]
    fn inactive_part_breaks_a_joined_run() {
        let mut scene = build_scene();
        // Deactivate the middle part of object B; its single merged run must
        // split in two rather than silently drawing the inactive bytes.
        scene.set_part_active(cadre_types::ObjectIndex::new(1), 1, false);

        let joined = assemble(&scene, &options(BatchStrategy::Joined));
        let object_b = solid_items_of_object(&joined, 1);

        assert_eq!(object_b.len(), 2);
        assert_eq!(object_b[0].range, IndexRange::new(0, 6));
        assert_eq!(object_b[1].range, IndexRange::new(48, 3));
    }

    #[test]
    fn empty_scene_assembles_empty() {
        let scene = Scene::new();
        assert!(assemble(&scene, &AssemblerOptions::default()).is_empty());
    }
}

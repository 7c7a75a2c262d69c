//! Per-object batch caches.
//!
//! A batch cache groups an object's active parts by their (material, matrix)
//! state key and merges byte-contiguous ranges, so the Grouped strategy can
//! emit the minimal per-object draw sequence without touching part data
//! again. Caches are rebuilt whenever an object's active-part set, material
//! assignment, or transform-override assignment changes.

use cadre_types::{GeometryPart, IndexRange, ObjectPart, StateKey, TransformIndex};
use smallvec::SmallVec;

/// One unique state in a cache and the number of contiguous ranges that were
/// folded under it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BatchState {
    pub key: StateKey,
    pub range_count: u32,
}

/// Ordered, state-grouped, contiguity-merged range list for one object and
/// one topology (solid or wire).
///
/// `ranges` is parallel to `states`: the first `states[0].range_count`
/// entries belong to the first state, and so on. Ranges within one state are
/// in ascending byte-offset order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchCache {
    states: Vec<BatchState>,
    ranges: Vec<IndexRange>,
}

impl BatchCache {
    /// Builds the cache for one object.
    ///
    /// `geometry_parts` and `object_parts` are parallel; `base` is the
    /// object's base transform, overridden per part where a part carries its
    /// own matrix index. `solid` selects which of each part's two ranges is
    /// cached.
    pub fn build(
        geometry_parts: &[GeometryPart],
        object_parts: &[ObjectPart],
        base: TransformIndex,
        solid: bool,
    ) -> Self {
        profiling::scope!("BatchCache::build");
        debug_assert_eq!(geometry_parts.len(), object_parts.len());

        let mut draws: SmallVec<[(StateKey, IndexRange); 16]> = geometry_parts
            .iter()
            .zip(object_parts)
            .filter(|(_, object_part)| object_part.active)
            .filter_map(|(geometry_part, object_part)| {
                let range = if solid { geometry_part.solid } else { geometry_part.wire };
                if range.is_empty() {
                    return None;
                }
                let key = StateKey {
                    material: object_part.material,
                    matrix: object_part.matrix.unwrap_or(base),
                };
                Some((key, range))
            })
            .collect();

        // (material, matrix, offset) ascending. This ordering is load-bearing:
        // it brings same-state parts together and orders them by address, so
        // the single merge pass below sees contiguous ranges back to back.
        draws.sort_unstable_by_key(|&(key, range)| (key, range.byte_offset));

        let mut cache = BatchCache::default();
        let mut current: Option<(StateKey, IndexRange, u32)> = None;

        for (key, range) in draws {
            current = Some(match current {
                None => (key, range, 0),
                Some((current_key, mut current_range, flushed)) => {
                    if key == current_key && range.byte_offset == current_range.end_byte_offset() {
                        current_range.count += range.count;
                        (current_key, current_range, flushed)
                    } else if key == current_key {
                        cache.ranges.push(current_range);
                        (current_key, range, flushed + 1)
                    } else {
                        cache.ranges.push(current_range);
                        cache.states.push(BatchState {
                            key: current_key,
                            range_count: flushed + 1,
                        });
                        (key, range, 0)
                    }
                }
            });
        }

        if let Some((key, range, flushed)) = current {
            cache.ranges.push(range);
            cache.states.push(BatchState {
                key,
                range_count: flushed + 1,
            });
        }

        cache
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[BatchState] {
        &self.states
    }

    pub fn ranges(&self) -> &[IndexRange] {
        &self.ranges
    }

    /// Walks the cache state by state, yielding each state key with its slice
    /// of merged ranges.
    pub fn iter(&self) -> impl Iterator<Item = (StateKey, &[IndexRange])> {
        self.states.iter().scan(0usize, move |offset, state| {
            let ranges = &self.ranges[*offset..*offset + state.range_count as usize];
            *offset += state.range_count as usize;
            Some((state.key, ranges))
        })
    }
}

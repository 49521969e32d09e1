//! Parallel extraction with a deterministic merge.
//!
//! Entities are split into contiguous chunks, one per worker. Each worker
//! fills local arrays with indices relative to its own vertices; the merge
//! concatenates the parts in chunk order and rebases indices by the vertex
//! count already merged, so the result does not depend on scheduling.

use rayon::prelude::*;
use tracing::trace;

use super::GeometryArrays;

/// Run `extract` over `entities` on up to `workers` rayon tasks and merge.
pub fn extract_parallel<E, F>(entities: &[E], workers: usize, extract: F) -> GeometryArrays
where
    E: Sync,
    F: Fn(&E, &mut GeometryArrays) + Sync,
{
    if entities.is_empty() {
        return GeometryArrays::new();
    }
    let chunk = entities.len().div_ceil(workers.max(1));
    let parts: Vec<GeometryArrays> = entities
        .par_chunks(chunk)
        .map(|chunk| {
            let mut local = GeometryArrays::new();
            for entity in chunk {
                extract(entity, &mut local);
            }
            local
        })
        .collect();
    trace!(entities = entities.len(), parts = parts.len(), "extracted");
    merge_parts(&parts)
}

/// Concatenate worker-local arrays in order, rebasing indices.
pub fn merge_parts(parts: &[GeometryArrays]) -> GeometryArrays {
    let mut merged = GeometryArrays {
        positions: Vec::with_capacity(parts.iter().map(|p| p.positions.len()).sum()),
        prev_positions: Vec::with_capacity(parts.iter().map(|p| p.prev_positions.len()).sum()),
        indices: Vec::with_capacity(parts.iter().map(|p| p.indices.len()).sum()),
        attributes: Vec::with_capacity(parts.iter().map(|p| p.attributes.len()).sum()),
    };
    for part in parts {
        merged.append(part);
    }
    merged
}

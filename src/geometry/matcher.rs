//! Nearest-fit reuse of previous dynamic geometry groups.

use std::collections::BTreeMap;

use super::GeometryGroup;
use crate::backend::RtBackend;

/// Pool of a slot's previous dynamic groups keyed by `(vertex_count, primitive_count)`.
///
/// Groups not taken are dropped with the pool, releasing their buffers.
pub struct GeometrySlotMatcher<B: RtBackend> {
    pool: BTreeMap<(u32, u32), Vec<GeometryGroup<B>>>,
    len: usize,
}

impl<B: RtBackend> Default for GeometrySlotMatcher<B> {
    fn default() -> Self {
        Self { pool: BTreeMap::new(), len: 0 }
    }
}

impl<B: RtBackend> GeometrySlotMatcher<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: GeometryGroup<B>) {
        self.pool.entry(group.counts()).or_default().push(group);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove the smallest group with at least `vertices` vertices and
    /// `primitives` primitives. Never returns a smaller group.
    pub fn take_best(&mut self, vertices: u32, primitives: u32) -> Option<GeometryGroup<B>> {
        // Linear in the keys at or above `vertices`; a slot holds a handful of groups
        let key = self
            .pool
            .range((vertices, primitives)..)
            .map(|(key, _)| *key)
            .find(|&(v, p)| v >= vertices && p >= primitives)?;
        let bucket = self.pool.get_mut(&key)?;
        let group = bucket.pop();
        if bucket.is_empty() {
            self.pool.remove(&key);
        }
        if group.is_some() {
            self.len -= 1;
        }
        group
    }
}

impl<B: RtBackend> FromIterator<GeometryGroup<B>> for GeometrySlotMatcher<B> {
    fn from_iter<I: IntoIterator<Item = GeometryGroup<B>>>(iter: I) -> Self {
        let mut matcher = Self::new();
        for group in iter {
            matcher.insert(group);
        }
        matcher
    }
}

//! Software BVH behind the host backend.
//!
//! Linear BVH: primitives are sorted along a 30-bit Morton curve of their
//! centroids and each range is split at the highest bit where its first and
//! last codes differ. Nodes are allocated in pairs right after their parent
//! is visited, so every child index is larger than its parent's and a
//! reverse sweep refits bottom-up.
//!
//! The wgpu backend hands trees to the driver and never uses this module.

use glam::{Mat4, Vec3};

/// Leaves hold at most this many primitives.
const LEAF_SIZE: usize = 4;

/// Quantization steps per axis (10 bits).
const MORTON_SCALE: f32 = 1023.0;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self { min: Vec3::INFINITY, max: Vec3::NEG_INFINITY };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    #[inline]
    pub fn grow_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    pub fn union(self, other: Aabb) -> Aabb {
        Aabb { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    #[inline]
    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    /// Bounds of the eight transformed corners.
    pub fn transformed(&self, m: &Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        (0..8).fold(Aabb::EMPTY, |mut out, corner| {
            let p = Vec3::select(
                glam::BVec3::new(corner & 1 != 0, corner & 2 != 0, corner & 4 != 0),
                self.max,
                self.min,
            );
            out.grow_point(m.transform_point3(p));
            out
        })
    }
}

/// Internal node: `count == 0`, children at `left_or_first` and the next
/// index. Leaf: `count` primitives starting at `left_or_first` in
/// [`Bvh::prim_indices`].
#[derive(Debug, Clone, Copy)]
pub struct BvhNode {
    pub bounds: Aabb,
    pub left_or_first: u32,
    pub count: u32,
}

impl BvhNode {
    const UNSET: Self = Self { bounds: Aabb::EMPTY, left_or_first: 0, count: 0 };

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

#[derive(Debug, Clone)]
pub struct Bvh {
    /// Root at index 0.
    pub nodes: Vec<BvhNode>,
    pub prim_indices: Vec<u32>,
}

impl Bvh {
    /// Root bounds, `Aabb::EMPTY` for an empty tree.
    pub fn bounds(&self) -> Aabb {
        match self.nodes.first() {
            Some(root) if !self.prim_indices.is_empty() => root.bounds,
            _ => Aabb::EMPTY,
        }
    }
}

/// Per-triangle bounds of an indexed mesh (positions as packed xyz floats).
///
/// Out-of-range indices contribute nothing; arrays are validated before they
/// reach a backend.
pub fn triangle_bounds(positions: &[f32], indices: &[u32]) -> Vec<Aabb> {
    let vertex_count = positions.len() / 3;
    indices
        .chunks_exact(3)
        .map(|tri| {
            let mut b = Aabb::EMPTY;
            for &i in tri.iter().filter(|&&i| (i as usize) < vertex_count) {
                let i = 3 * i as usize;
                b.grow_point(Vec3::new(positions[i], positions[i + 1], positions[i + 2]));
            }
            b
        })
        .collect()
}

/// Spread the low 10 bits of `v` to every third bit.
#[inline]
fn spread_bits(v: u32) -> u32 {
    let mut v = v & 0x3FF;
    v = (v | (v << 16)) & 0x0300_00FF;
    v = (v | (v << 8)) & 0x0300_F00F;
    v = (v | (v << 4)) & 0x030C_30C3;
    (v | (v << 2)) & 0x0924_9249
}

fn morton_code(p: Vec3, frame: &Aabb) -> u32 {
    let extent = (frame.max - frame.min).max(Vec3::splat(f32::MIN_POSITIVE));
    // NaN centroids of empty boxes saturate to 0
    let q = ((p - frame.min) / extent).clamp(Vec3::ZERO, Vec3::ONE) * MORTON_SCALE;
    (spread_bits(q.x as u32) << 2) | (spread_bits(q.y as u32) << 1) | spread_bits(q.z as u32)
}

/// Split index inside a sorted code range of at least two elements.
fn split_point(codes: &[u32]) -> usize {
    let (first, last) = (codes[0], codes[codes.len() - 1]);
    if first == last {
        return codes.len() / 2;
    }
    let bit = 1u32 << (31 - (first ^ last).leading_zeros());
    codes.partition_point(|c| c & bit == 0)
}

/// Build a tree over primitive bounds.
#[tracing::instrument(skip_all, fields(prims = bounds.len()))]
pub fn build_bvh(bounds: &[Aabb]) -> Bvh {
    if bounds.is_empty() {
        return Bvh { nodes: vec![BvhNode::UNSET], prim_indices: Vec::new() };
    }

    let frame = bounds
        .iter()
        .filter(|b| !b.is_empty())
        .fold(Aabb::EMPTY, |mut f, b| {
            f.grow_point(b.centroid());
            f
        });
    let mut keyed: Vec<(u32, u32)> = bounds
        .iter()
        .enumerate()
        .map(|(i, b)| (morton_code(b.centroid(), &frame), i as u32))
        .collect();
    keyed.sort_unstable();
    let (codes, prim_indices): (Vec<u32>, Vec<u32>) = keyed.into_iter().unzip();

    let mut nodes = Vec::with_capacity(2 * bounds.len().div_ceil(LEAF_SIZE));
    nodes.push(BvhNode::UNSET);
    let mut stack = vec![(0usize, 0usize, bounds.len())];
    while let Some((node, start, end)) = stack.pop() {
        let range = &prim_indices[start..end];
        let node_bounds = range.iter().fold(Aabb::EMPTY, |b, &p| b.union(bounds[p as usize]));
        if range.len() <= LEAF_SIZE {
            nodes[node] = BvhNode { bounds: node_bounds, left_or_first: start as u32, count: range.len() as u32 };
            continue;
        }
        let mid = start + split_point(&codes[start..end]);
        let left = nodes.len();
        nodes.extend([BvhNode::UNSET; 2]);
        nodes[node] = BvhNode { bounds: node_bounds, left_or_first: left as u32, count: 0 };
        stack.push((left + 1, mid, end));
        stack.push((left, start, mid));
    }
    Bvh { nodes, prim_indices }
}

/// Recompute node bounds from moved primitives, keeping the topology.
/// `bounds` must be indexed like the ones the tree was built from.
#[tracing::instrument(skip_all, fields(nodes = bvh.nodes.len()))]
pub fn refit_bvh(bvh: &mut Bvh, bounds: &[Aabb]) {
    if bvh.prim_indices.is_empty() {
        return;
    }
    for i in (0..bvh.nodes.len()).rev() {
        let node = bvh.nodes[i];
        let first = node.left_or_first as usize;
        bvh.nodes[i].bounds = if node.is_leaf() {
            bvh.prim_indices[first..first + node.count as usize]
                .iter()
                .filter_map(|&p| bounds.get(p as usize))
                .fold(Aabb::EMPTY, |b, pb| b.union(*pb))
        } else {
            bvh.nodes[first].bounds.union(bvh.nodes[first + 1].bounds)
        };
    }
}

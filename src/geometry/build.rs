//! Build, update or rebuild decision for one geometry group.

use tracing::{debug, trace};

use super::{GeometryArrays, GeometryClass, GeometryGroup};
use crate::backend::{BlasGeometry, BufferUsage, BuildFlags, BuildMode, InstanceFlags, RtBackend, Stage};
use crate::buffer_cache::DeviceBufferCache;
use crate::util::Result;

/// What to do with a group's bottom-level BVH this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDecision {
    /// Fresh BVH object, built with the caller's flags.
    Build,
    /// Refit the previous BVH to moved vertices.
    Update,
    /// Full rebuild into the previous BVH object.
    Rebuild,
}

impl BuildDecision {
    /// Topology is unchanged iff the `(vertex, primitive)` counts match.
    pub fn decide(previous: Option<(u32, u32)>, current: (u32, u32), force_rebuild: bool) -> Self {
        match previous {
            Some(counts) if counts == current => {
                if force_rebuild {
                    BuildDecision::Rebuild
                } else {
                    BuildDecision::Update
                }
            }
            _ => BuildDecision::Build,
        }
    }

    pub fn mode(self) -> BuildMode {
        match self {
            BuildDecision::Build => BuildMode::Build,
            BuildDecision::Update => BuildMode::Update,
            BuildDecision::Rebuild => BuildMode::Rebuild,
        }
    }
}

/// Per-call inputs of [`build_or_update`] besides the arrays.
#[derive(Debug, Clone, Copy)]
pub struct BuildParams {
    pub class: GeometryClass,
    pub force_rebuild: bool,
    /// Flags of a fresh build. Updates and rebuilds keep the previous flags.
    pub build_flags: BuildFlags,
    pub instance_flags: InstanceFlags,
    pub iteration: u64,
}

impl BuildParams {
    /// Class defaults.
    pub fn for_class(class: GeometryClass, iteration: u64) -> Self {
        Self {
            class,
            force_rebuild: false,
            build_flags: class.build_flags(),
            instance_flags: class.instance_flags(),
            iteration,
        }
    }

    pub fn force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }
}

/// Upload `arrays` and build, update or rebuild the group's BVH.
///
/// The previous group's buffers are reused as upload targets. Returns `None`
/// for zero primitives: no BVH is built and the caller emits no instance.
/// Arrays must already be validated.
pub fn build_or_update<B: RtBackend>(
    backend: &mut B,
    cache: &mut DeviceBufferCache,
    arrays: &GeometryArrays,
    previous: Option<GeometryGroup<B>>,
    params: BuildParams,
) -> Result<Option<GeometryGroup<B>>> {
    let counts = (arrays.vertex_count(), arrays.primitive_count());
    if counts.1 == 0 {
        trace!(class = params.class.label(), "empty group skipped");
        return Ok(None);
    }

    let previous_counts = previous.as_ref().map(GeometryGroup::counts);
    let decision = BuildDecision::decide(previous_counts, counts, params.force_rebuild);
    let label = params.class.label();

    let (hints, reused) = match previous {
        Some(prev) => {
            let hints = [Some(prev.vertices), Some(prev.prev_vertices), Some(prev.indices), Some(prev.attributes)];
            let reused = match decision {
                BuildDecision::Build => None,
                _ => Some((prev.blas, prev.build_flags, prev.last_rebuild_iteration)),
            };
            (hints, reused)
        }
        None => ([None, None, None, None], None),
    };
    let [vtx_hint, prev_hint, idx_hint, attr_hint] = hints;

    let build_input = BufferUsage::ACCEL_INPUT | BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS;
    let vertices = cache.ensure(backend, vtx_hint, &arrays.positions, build_input, Stage::AccelBuild, label)?;
    let prev_vertices =
        cache.ensure(backend, prev_hint, &arrays.prev_positions, BufferUsage::STORAGE, Stage::Shader, label)?;
    let indices = cache.ensure(backend, idx_hint, &arrays.indices, build_input, Stage::AccelBuild, label)?;
    let attributes =
        cache.ensure(backend, attr_hint, &arrays.attributes, BufferUsage::STORAGE, Stage::Shader, label)?;

    let (mut blas, build_flags, last_rebuild_iteration) = match reused {
        Some((blas, flags, last)) => {
            let last = if decision == BuildDecision::Rebuild { params.iteration } else { last };
            (blas, flags, last)
        }
        None => (backend.create_blas(label)?, params.build_flags, params.iteration),
    };

    let geometry = BlasGeometry::<B> {
        vertices: vertices.raw(),
        vertex_count: counts.0,
        indices: indices.raw(),
        primitive_count: counts.1,
    };
    backend.build_blas(&mut blas, &geometry, build_flags, decision.mode())?;
    debug!(class = label, ?decision, vertices = counts.0, primitives = counts.1, "blas");

    Ok(Some(GeometryGroup {
        class: params.class,
        vertex_count: counts.0,
        primitive_count: counts.1,
        vertices,
        prev_vertices,
        indices,
        attributes,
        blas,
        build_flags,
        last_rebuild_iteration,
        instance_flags: params.instance_flags,
    }))
}

//! Top-level BVH assembly for one frame slot.
//!
//! One instance per live geometry group, identity transform, custom index
//! equal to the group's binding index. The TLAS is refitted when the slot's
//! previous instance count matches, rebuilt otherwise.

use tracing::{debug, instrument};

use crate::backend::{AccelInstance, BufferUsage, GeometryBinding, RtBackend, Stage, TlasMode};
use crate::buffer_cache::DeviceBufferCache;
use crate::frame::FrameSlot;
use crate::util::{Error, Result, IDENTITY_ROWS};

/// Visibility mask of every instance.
pub const INSTANCE_MASK: u8 = 0xFF;

/// What happened to a slot's top-level BVH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasDecision {
    /// Same instance count as the slot's previous frame: refit in place.
    Refit,
    /// Fresh TLAS replacing the previous one.
    Rebuild,
    /// No instances: TLAS released and unbound.
    Empty,
}

impl TlasDecision {
    pub fn decide(instance_count: u32, previous_count: u32, has_tlas: bool) -> Self {
        if instance_count == 0 {
            TlasDecision::Empty
        } else if has_tlas && instance_count == previous_count {
            TlasDecision::Refit
        } else {
            TlasDecision::Rebuild
        }
    }
}

/// Builds instance records and the top-level BVH, then publishes the slot's
/// geometry bindings.
#[derive(Debug, Clone, Copy)]
pub struct TopLevelAssembler {
    max_instances: u32,
}

impl TopLevelAssembler {
    pub fn new(max_instances: u32) -> Self {
        Self { max_instances }
    }

    pub fn max_instances(&self) -> u32 {
        self.max_instances
    }

    /// Fail with [`Error::CapacityExceeded`] if `live` groups do not fit.
    pub fn check_capacity(&self, live: usize) -> Result<()> {
        if live > self.max_instances as usize {
            return Err(Error::CapacityExceeded { live, max: self.max_instances });
        }
        Ok(())
    }

    /// Assemble the slot's TLAS from its current groups.
    ///
    /// The slot must have been acquired: its previous submission is complete.
    #[instrument(skip_all, fields(slot = slot.index()))]
    pub fn assemble<B: RtBackend>(
        &self,
        backend: &mut B,
        cache: &mut DeviceBufferCache,
        slot: &mut FrameSlot<B>,
    ) -> Result<TlasDecision> {
        let live = slot.live_groups();
        self.check_capacity(live)?;

        let instances: Vec<AccelInstance> = slot
            .groups()
            .enumerate()
            .map(|(i, group)| {
                AccelInstance::new(
                    IDENTITY_ROWS,
                    i as u32,
                    INSTANCE_MASK,
                    group.instance_flags,
                    backend.blas_address(&group.blas),
                )
            })
            .collect();
        let count = instances.len() as u32;
        let decision = TlasDecision::decide(count, slot.last_instance_count, slot.tlas.is_some());

        match decision {
            TlasDecision::Empty => {
                if slot.tlas.take().is_some() {
                    debug!("tlas released");
                }
                backend.write_tlas_binding(&mut slot.binding_table, None)?;
            }
            TlasDecision::Refit | TlasDecision::Rebuild => {
                let usage = BufferUsage::INSTANCE_INPUT | BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS;
                let buffer = cache.ensure(
                    backend,
                    slot.instance_buffer.take(),
                    &instances,
                    usage,
                    Stage::AccelBuild,
                    "instances",
                )?;
                match (decision, slot.tlas.as_mut()) {
                    (TlasDecision::Refit, Some(tlas)) => {
                        backend.build_tlas(tlas, buffer.raw(), count, TlasMode::Refit)?;
                    }
                    _ => {
                        let mut tlas = backend.create_tlas("tlas")?;
                        backend.build_tlas(&mut tlas, buffer.raw(), count, TlasMode::Build)?;
                        backend.write_tlas_binding(&mut slot.binding_table, Some(&tlas))?;
                        slot.tlas = Some(tlas);
                    }
                }
                slot.instance_buffer = Some(buffer);
                slot.tlas_builder.queue();
            }
        }
        slot.last_instance_count = count;
        slot.tlas_builder.flush(backend);

        self.bind_geometries(backend, slot)?;
        debug!(?decision, instances = count, "tlas");
        Ok(decision)
    }

    /// Live groups at their instance index, the dummy at indices that held a
    /// group last time and no longer do.
    fn bind_geometries<B: RtBackend>(&self, backend: &mut B, slot: &mut FrameSlot<B>) -> Result<()> {
        let FrameSlot {
            binding_table,
            static_groups,
            dynamic_groups,
            bound_geometries,
            dummy,
            ..
        } = slot;
        let mut live = 0u32;
        for group in static_groups.iter().flatten().chain(dynamic_groups.iter()) {
            backend.write_geometry_binding(binding_table, live, &group.binding())?;
            live += 1;
        }
        let placeholder = GeometryBinding::<B>::dummy(dummy.raw());
        for index in live..*bound_geometries {
            backend.write_geometry_binding(binding_table, index, &placeholder)?;
        }
        *bound_geometries = live;
        Ok(())
    }
}

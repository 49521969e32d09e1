//! Reuse-or-grow strategy for device buffers backing per-frame arrays.
//!
//! A buffer is reused while it is large enough; otherwise it is replaced by
//! one with 25% headroom so small frame-to-frame fluctuations do not
//! reallocate. Replaced buffers are dropped by value and released once the
//! last group referencing them goes away.

use std::fmt;

use bytemuck::Pod;
use tracing::trace;

use crate::backend::{BufferUsage, RtBackend, Stage};
use crate::util::Result;

/// Smallest buffer ever allocated.
pub const MIN_BUFFER_SIZE: u64 = 16;

/// Copy alignment of uploads and clears.
pub const COPY_ALIGNMENT: u64 = 4;

/// Capacity of a new allocation for `bytes`: `ceil(bytes * 1.25)` rounded up
/// to the copy alignment, at least [`MIN_BUFFER_SIZE`].
#[inline]
pub fn grown_capacity(bytes: u64) -> u64 {
    let headroom = (bytes * 5).div_ceil(4);
    headroom.next_multiple_of(COPY_ALIGNMENT).max(MIN_BUFFER_SIZE)
}

/// Backend buffer with the capacity it was allocated with.
pub struct DeviceBuffer<B: RtBackend> {
    raw: B::Buffer,
    capacity: u64,
    usage: BufferUsage,
}

impl<B: RtBackend> DeviceBuffer<B> {
    /// Wrap a buffer allocated outside the cache.
    pub fn new(raw: B::Buffer, capacity: u64, usage: BufferUsage) -> Self {
        Self { raw, capacity, usage }
    }

    pub fn raw(&self) -> &B::Buffer {
        &self.raw
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn fits(&self, bytes: u64, usage: BufferUsage) -> bool {
        self.capacity >= bytes && self.usage.contains(usage)
    }
}

impl<B: RtBackend> Clone for DeviceBuffer<B> {
    fn clone(&self) -> Self {
        Self { raw: self.raw.clone(), capacity: self.capacity, usage: self.usage }
    }
}

impl<B: RtBackend> fmt::Debug for DeviceBuffer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("raw", &self.raw)
            .field("capacity", &self.capacity)
            .field("usage", &self.usage)
            .finish()
    }
}

/// Counters of [`DeviceBufferCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCacheStats {
    pub allocations: u64,
    pub reuses: u64,
    pub bytes_allocated: u64,
    pub bytes_uploaded: u64,
}

impl std::ops::AddAssign for BufferCacheStats {
    fn add_assign(&mut self, rhs: Self) {
        self.allocations += rhs.allocations;
        self.reuses += rhs.reuses;
        self.bytes_allocated += rhs.bytes_allocated;
        self.bytes_uploaded += rhs.bytes_uploaded;
    }
}

/// Upload path for every per-frame array.
#[derive(Debug, Default)]
pub struct DeviceBufferCache {
    stats: BufferCacheStats,
}

impl DeviceBufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BufferCacheStats {
        self.stats
    }

    /// Return and reset the counters.
    pub fn take_stats(&mut self) -> BufferCacheStats {
        std::mem::take(&mut self.stats)
    }

    /// Upload `data` into `existing` if it fits, otherwise into a new buffer.
    ///
    /// The upload is bracketed by a barrier from any previous consumer to the
    /// transfer and one from the transfer to `consumer`. Never blocks.
    pub fn ensure<B: RtBackend, T: Pod>(
        &mut self,
        backend: &mut B,
        existing: Option<DeviceBuffer<B>>,
        data: &[T],
        usage: BufferUsage,
        consumer: Stage,
        label: &str,
    ) -> Result<DeviceBuffer<B>> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as u64;
        let usage = usage | BufferUsage::TRANSFER_DST;

        let buffer = match existing {
            Some(buf) if buf.fits(size, usage) => {
                self.stats.reuses += 1;
                buf
            }
            previous => {
                let capacity = grown_capacity(size);
                trace!(
                    label,
                    size,
                    capacity,
                    previous = previous.as_ref().map(DeviceBuffer::capacity),
                    "allocate"
                );
                let raw = backend.create_buffer(capacity, usage, label)?;
                self.stats.allocations += 1;
                self.stats.bytes_allocated += capacity;
                DeviceBuffer { raw, capacity, usage }
            }
        };

        if !bytes.is_empty() {
            backend.buffer_barrier(&buffer.raw, Stage::All, Stage::Transfer);
            backend.write_buffer(&buffer.raw, 0, bytes)?;
            backend.buffer_barrier(&buffer.raw, Stage::Transfer, consumer);
            self.stats.bytes_uploaded += size;
        }
        Ok(buffer)
    }
}

//! Interfaces the engine consumes from a graphics backend.
//!
//! A backend bundles three capabilities:
//! - [`AllocationFactory`] creates and releases physical buffer resources
//! - [`RecordingContext`] records device-side updates, copies and maps inline
//!   into the current command stream
//! - [`SerialTracker`] reports submission progress

use std::ptr::NonNull;

use stratum_core::ExecutionSerial;

use crate::capabilities::DeviceCapabilities;
use crate::error::{GpuError, Result};
use crate::memory::AccessClass;

/// Opaque handle of a physical allocation owned by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// Opaque handle of a GPU-side boolean (occlusion query, compare result).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PredicateId(pub u64);

/// Parameters of a physical allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationDesc<'a> {
    /// Debug label.
    pub label: &'a str,
    /// Size in bytes, already aligned for `access`.
    pub size: u64,
    /// Access class the resource is created for.
    pub access: AccessClass,
}

/// CPU access requested from the device map primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapType {
    /// Read only. Only valid when the device reports read-only map support.
    Read,
    /// Combined read/write.
    ReadWrite,
    /// Write; previous contents may be discarded.
    WriteDiscard,
    /// Write to regions the GPU is not using; previous contents are preserved.
    WriteNoOverwrite,
}

impl MapType {
    /// Whether the mapping exposes existing contents to the CPU.
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }
}

/// How a device update treats bytes outside the updated range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateHint {
    /// Keep the existing contents.
    Preserve,
    /// The update covers everything that matters; old contents may be dropped.
    Discard,
}

/// CPU-visible memory of a mapped allocation.
///
/// Valid until the allocation is unmapped.
#[derive(Debug)]
pub struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the pointer is only dereferenced by the owner of the mapping, and the
// engine requires external mutual exclusion around every buffer access.
unsafe impl Send for MappedMemory {}

impl MappedMemory {
    /// Wrap a mapped pointer.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// backend's `unmap` is called for the allocation it came from.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the mapped bytes.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `MappedMemory::new`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the mapped bytes mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the contract of `MappedMemory::new`; `&mut self`
        // makes the view exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| range_error(offset, data.len()))?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= self.len)
            .ok_or_else(|| range_error(offset, data.len()))?;
        self.bytes_mut()[start..end].copy_from_slice(data);
        Ok(())
    }
}

fn range_error(offset: u64, len: usize) -> GpuError {
    GpuError::InvalidState(format!(
        "Mapped write of {len} bytes at offset {offset} exceeds the mapping"
    ))
}

/// Creates backing resources for storages.
pub trait AllocationFactory {
    /// Create a resource. Fails with `GpuError::OutOfMemory` when the device
    /// cannot allocate it.
    fn create_allocation(&mut self, desc: &AllocationDesc<'_>) -> Result<AllocationId>;

    /// Release a resource. Commands already recorded against it stay valid.
    fn destroy_allocation(&mut self, allocation: AllocationId);
}

/// Records device work into the current command stream.
pub trait RecordingContext {
    /// Write `data` into `dst` at `offset` (`UpdateSubresource`).
    fn update_subresource(
        &mut self,
        dst: AllocationId,
        offset: u64,
        data: &[u8],
        hint: UpdateHint,
    ) -> Result<()>;

    /// Device-to-device copy (`CopySubresourceRegion`).
    fn copy_region(
        &mut self,
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;

    /// Map an allocation for CPU access.
    fn map(&mut self, allocation: AllocationId, map_type: MapType) -> Result<MappedMemory>;

    /// Release a mapping returned by [`RecordingContext::map`].
    fn unmap(&mut self, allocation: AllocationId);

    /// Write `data` into `dst` at `offset`, skipped at execution time when
    /// `predicate` evaluates to false.
    fn update_predicated(
        &mut self,
        predicate: PredicateId,
        dst: AllocationId,
        offset: u64,
        data: &[u8],
    ) -> Result<()>;

    /// Submit everything recorded so far and return its serial.
    fn submit(&mut self) -> Result<ExecutionSerial>;
}

/// Reports submission progress.
pub trait SerialTracker {
    /// Serial of the most recent submission.
    fn last_submitted_serial(&self) -> ExecutionSerial;

    /// Serial of the most recent submission the GPU finished. Reports device
    /// loss as `GpuError::DeviceLost`.
    fn completed_serial(&mut self) -> Result<ExecutionSerial>;

    /// Block until `serial` has completed. `serial` must have been submitted.
    fn wait_for_serial(&mut self, serial: ExecutionSerial) -> Result<()>;

    /// Serial that commands recorded now will carry once submitted.
    fn pending_serial(&self) -> ExecutionSerial {
        self.last_submitted_serial().next()
    }
}

/// Everything the engine needs from a device.
pub trait GpuBackend: AllocationFactory + RecordingContext + SerialTracker {
    /// Capabilities of the device.
    fn capabilities(&self) -> &DeviceCapabilities;
}

//! Logical buffers and the routing of operations onto their storages.
//!
//! A [`LogicalBuffer`] is what the application sees. Behind it sit up to five
//! physical storages (see [`AccessClass`]); every operation first picks the
//! storage that can serve it, brings that storage up to date with
//! [`LogicalBuffer::sync_storage`], performs the access, and records the new
//! revision.

use std::fmt;

use stratum_core::constants::COPY_BUFFER_ALIGNMENT;
use stratum_core::{align_up, is_aligned, BindingRole, BufferUsage, ExecutionSerial, MapMode};

use crate::backend::{
    AllocationId, GpuBackend, MapType, MappedMemory, PredicateId, UpdateHint,
};
use crate::error::{GpuError, Result};
use crate::memory::{AccessClass, PhysicalAllocation};
use crate::storage::{self, StorageSet};

/// Handle of a logical buffer owned by a [`crate::BufferManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Parameters of a logical buffer.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    /// Debug label.
    pub label: String,
    /// Size in bytes as requested by the application.
    pub size: u64,
    /// Everything the buffer will be used for.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// Create a descriptor.
    pub fn new(label: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
        }
    }
}

/// CPU mapping state of a logical buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapState {
    /// No CPU access.
    Unmapped,
    /// A map was requested and waits for `serial` to retire.
    MapRequested { mode: MapMode, serial: ExecutionSerial },
    /// The CPU has access through the storage of class `storage`.
    Mapped { mode: MapMode, storage: AccessClass },
}

/// Converts a byte count bounded by `MAX_BUFFER_SIZE` to `usize`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn byte_len(size: u64) -> usize {
    size as usize
}

/// One application-visible buffer and its set of physical storages.
#[derive(Debug)]
pub struct LogicalBuffer {
    pub(crate) id: BufferId,
    pub(crate) label: String,
    pub(crate) size: u64,
    pub(crate) allocated_size: u64,
    pub(crate) usage: BufferUsage,
    pub(crate) storages: StorageSet,
    /// Pending serial of the last GPU command touching the buffer. CPU
    /// access is stall-free once it has retired.
    pub(crate) last_usage_serial: ExecutionSerial,
    pub(crate) data_initialized: bool,
    pub(crate) map_state: MapState,
    pub(crate) mapped: Option<MappedMemory>,
}

impl LogicalBuffer {
    /// Create a buffer and the storages its usage needs up front.
    ///
    /// On allocation failure every storage created so far is released.
    pub(crate) fn new<B: GpuBackend>(
        backend: &mut B,
        id: BufferId,
        label: String,
        desc: &BufferDescriptor,
        lazy_zero_init: bool,
    ) -> Result<Self> {
        let alignment = if desc.usage.contains(BufferUsage::CONSTANT) {
            AccessClass::CpuWritableConstant.alignment()
        } else {
            AccessClass::CpuWritableGeneral.alignment()
        };

        let mut buffer = Self {
            id,
            label,
            size: desc.size,
            allocated_size: align_up(desc.size.max(1), alignment),
            usage: desc.usage,
            storages: StorageSet::new(),
            last_usage_serial: ExecutionSerial::ZERO,
            data_initialized: !lazy_zero_init,
            map_state: MapState::Unmapped,
            mapped: None,
        };

        for class in storage::initial_storage_classes(desc.usage) {
            if let Err(err) = buffer.ensure_storage(backend, class) {
                buffer.release(backend);
                return Err(err);
            }
        }

        Ok(buffer)
    }

    /// Buffer handle.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Debug label, including the configured prefix.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size of every storage allocation.
    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    /// Requested usage.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// The storage table.
    pub fn storages(&self) -> &StorageSet {
        &self.storages
    }

    /// Pending serial of the last GPU command touching the buffer.
    pub fn last_usage_serial(&self) -> ExecutionSerial {
        self.last_usage_serial
    }

    /// Whether the logical contents are defined.
    pub fn is_data_initialized(&self) -> bool {
        self.data_initialized
    }

    /// CPU mapping state.
    pub fn map_state(&self) -> MapState {
        self.map_state
    }

    /// Whether `[offset, offset + size)` covers the whole logical buffer.
    pub(crate) fn covers_whole(&self, offset: u64, size: u64) -> bool {
        offset == 0 && size >= self.size
    }

    pub(crate) fn track_usage(&mut self, serial: ExecutionSerial) {
        self.last_usage_serial = self.last_usage_serial.max(serial);
    }

    pub(crate) fn storage_allocation(&self, class: AccessClass) -> Result<AllocationId> {
        self.storages.allocation_id(class).ok_or_else(|| {
            GpuError::InvalidState(format!("{} has no {class} storage", self.id))
        })
    }

    /// Create the storage of `class` if it does not exist yet.
    pub(crate) fn ensure_storage<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        class: AccessClass,
    ) -> Result<()> {
        if self.storages.contains(class) {
            return Ok(());
        }

        let label = format!("{}/{}", self.label, class.label_suffix());
        let allocation = PhysicalAllocation::create(backend, &label, self.allocated_size, class)?;
        tracing::debug!(
            buffer = %self.id,
            %class,
            size = self.allocated_size,
            "Created storage"
        );
        self.storages.insert(allocation);
        Ok(())
    }

    /// Make sure some storage holds the buffer contents.
    pub(crate) fn ensure_any_storage<B: GpuBackend>(&mut self, backend: &mut B) -> Result<()> {
        if self.storages.is_empty() {
            self.ensure_storage(backend, storage::copy_dst_class(self.usage))?;
        }
        Ok(())
    }

    /// Release every storage, unmapping first if needed.
    pub(crate) fn release<B: GpuBackend>(&mut self, backend: &mut B) {
        if let MapState::Mapped { storage, .. } = self.map_state {
            if let Some(allocation) = self.storages.allocation_id(storage) {
                backend.unmap(allocation);
            }
        }
        self.mapped = None;
        self.map_state = MapState::Unmapped;

        for allocation in self.storages.take_all() {
            allocation.destroy(backend);
        }
    }

    // ===== ROUTING =====

    /// CPU-writable storage serving writes, if it exists.
    pub(crate) fn cpu_writable_class(&self) -> Option<AccessClass> {
        storage::primary_cpu_writable_class(self.usage).filter(|class| self.storages.contains(*class))
    }

    /// Storage a map of `mode` goes through.
    pub(crate) fn map_class(&self, mode: MapMode) -> AccessClass {
        match mode {
            MapMode::Read => AccessClass::Staging,
            MapMode::Write => self.cpu_writable_class().unwrap_or(AccessClass::Staging),
        }
    }

    /// Storage a binding in `role` goes through.
    pub(crate) fn bind_class(&self, role: BindingRole) -> AccessClass {
        match role {
            BindingRole::Constant => {
                if self.storages.contains(AccessClass::CpuWritableConstant) {
                    AccessClass::CpuWritableConstant
                } else {
                    AccessClass::GpuWritableConstant
                }
            }
            BindingRole::ShaderResource => match self.storages.last_updated() {
                Some(class @ (AccessClass::CpuWritableGeneral | AccessClass::GpuWritableGeneral)) => {
                    class
                }
                _ if self.storages.contains(AccessClass::GpuWritableGeneral) => {
                    AccessClass::GpuWritableGeneral
                }
                // A stale dynamic buffer would need a CPU bounce; a GPU copy is cheaper
                _ if self.storages.is_current(AccessClass::CpuWritableGeneral) => {
                    AccessClass::CpuWritableGeneral
                }
                _ => AccessClass::GpuWritableGeneral,
            },
            BindingRole::UnorderedAccess => AccessClass::GpuWritableGeneral,
        }
    }

    /// Whether a GPU-side write into `class` leaves the staging storage stale
    /// in a way worth fixing before the next submission.
    pub(crate) fn wants_staging_refresh(&self, class: AccessClass) -> bool {
        class.is_gpu_writable() && self.storages.contains(AccessClass::Staging)
    }

    // ===== INITIALIZATION =====

    /// Clear the buffer to zero if its contents were never defined.
    pub(crate) fn ensure_initialized<B: GpuBackend>(&mut self, backend: &mut B) -> Result<()> {
        if self.data_initialized {
            return Ok(());
        }

        tracing::trace!(buffer = %self.id, "Lazy zero-initialization");
        let zeros = vec![0u8; byte_len(self.allocated_size)];
        self.write_internal(backend, 0, &zeros)?;
        self.data_initialized = true;
        Ok(())
    }

    /// Like [`Self::ensure_initialized`], but skips the clear when the
    /// upcoming write of `[offset, offset + size)` overwrites everything.
    ///
    /// The buffer stays uninitialized until that write succeeds and the
    /// caller invokes [`Self::mark_initialized`].
    pub(crate) fn ensure_initialized_as_destination<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if !self.data_initialized && self.covers_whole(offset, size) {
            return Ok(());
        }
        self.ensure_initialized(backend)
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.data_initialized = true;
    }

    // ===== WRITE PATH =====

    /// Write `data` at `offset` through the cheapest available path.
    ///
    /// Returns the storage that received the data.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub(crate) fn write_internal<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        offset: u64,
        data: &[u8],
    ) -> Result<AccessClass> {
        let full = self.covers_whole(offset, data.len() as u64);

        // Full writes also define the alignment padding
        let padded;
        let data = if full && (data.len() as u64) < self.allocated_size {
            let mut expanded = vec![0u8; byte_len(self.allocated_size)];
            expanded[..data.len()].copy_from_slice(data);
            padded = expanded;
            padded.as_slice()
        } else {
            data
        };

        let completed = backend.completed_serial()?;
        if let Some(class) = self.cpu_writable_class() {
            if self.last_usage_serial.is_retired(completed) {
                self.write_mapped(backend, class, offset, data, full)?;
                return Ok(class);
            }
            tracing::trace!(
                buffer = %self.id,
                serial = %self.last_usage_serial,
                "CPU-writable storage still in use, updating on the device"
            );
        }

        let class = storage::copy_dst_class(self.usage);
        self.write_device(backend, class, offset, data, full)?;
        Ok(class)
    }

    /// CPU fast path: map the CPU-writable storage and copy.
    fn write_mapped<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        class: AccessClass,
        offset: u64,
        data: &[u8],
        full: bool,
    ) -> Result<()> {
        if !full {
            self.sync_storage(backend, class)?;
        }

        let allocation = self.storage_allocation(class)?;
        let map_type = if full {
            MapType::WriteDiscard
        } else {
            MapType::WriteNoOverwrite
        };
        let mut memory = backend.map(allocation, map_type)?;
        let written = memory.write_bytes(offset, data);
        backend.unmap(allocation);
        written?;

        self.storages.bump(class);
        Ok(())
    }

    /// Device path: inline update of a GPU storage, or an upload through a
    /// temporary staging allocation when the update cannot be expressed inline.
    fn write_device<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        class: AccessClass,
        offset: u64,
        data: &[u8],
        full: bool,
    ) -> Result<()> {
        self.ensure_storage(backend, class)?;
        if !full {
            self.sync_storage(backend, class)?;
        }

        let dst = self.storage_allocation(class)?;
        let len = data.len() as u64;
        let capabilities = backend.capabilities();
        let granularity = capabilities.constant_buffer_update_granularity;
        let partial_constant_ok = capabilities.supports_partial_constant_buffer_update
            && is_aligned(offset, granularity)
            && is_aligned(len, granularity);
        let inline = class.supports_device_update()
            && len <= capabilities.max_inline_update_size
            && (!class.is_constant_buffer() || full || partial_constant_ok);

        if inline {
            let hint = if full {
                UpdateHint::Discard
            } else {
                UpdateHint::Preserve
            };
            backend.update_subresource(dst, offset, data, hint)?;
        } else {
            tracing::debug!(
                buffer = %self.id,
                %class,
                offset,
                len,
                "Update not expressible inline, uploading through staging"
            );
            self.upload_via_staging(backend, dst, offset, data)?;
        }

        self.storages.bump(class);
        self.track_usage(backend.pending_serial());
        Ok(())
    }

    fn upload_via_staging<B: GpuBackend>(
        &self,
        backend: &mut B,
        dst: AllocationId,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let size = align_up(data.len() as u64, COPY_BUFFER_ALIGNMENT);
        let label = format!("{}/upload", self.label);
        let upload = PhysicalAllocation::create(backend, &label, size, AccessClass::Staging)?;

        let result = fill_and_copy(backend, &upload, dst, offset, data);
        // The recorded copy keeps the resource alive on the device side
        upload.destroy(backend);
        result
    }

    // ===== GPU-SIDE OPERATIONS =====

    /// Copy into this buffer from another buffer's storage.
    ///
    /// Returns the storage that received the data.
    pub(crate) fn copy_from<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        src: AllocationId,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<AccessClass> {
        let class = storage::copy_dst_class(self.usage);
        self.ensure_storage(backend, class)?;
        if !self.covers_whole(dst_offset, size) {
            self.sync_storage(backend, class)?;
        }

        let dst = self.storage_allocation(class)?;
        backend.copy_region(src, src_offset, dst, dst_offset, size)?;
        self.storages.bump(class);
        self.track_usage(backend.pending_serial());
        Ok(class)
    }

    /// Storage holding the newest data, for use as a copy source.
    pub(crate) fn copy_source<B: GpuBackend>(&mut self, backend: &mut B) -> Result<AllocationId> {
        self.ensure_any_storage(backend)?;
        let class = self.storages.last_updated().ok_or_else(|| {
            GpuError::InvalidState(format!("{} has no storage to copy from", self.id))
        })?;
        let allocation = self.storage_allocation(class)?;
        self.track_usage(backend.pending_serial());
        Ok(allocation)
    }

    /// Current allocation to bind in `role`.
    pub(crate) fn bind<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        role: BindingRole,
    ) -> Result<(AccessClass, AllocationId)> {
        let class = self.bind_class(role);
        self.ensure_storage(backend, class)?;
        self.sync_storage(backend, class)?;

        // The GPU may write through an unordered-access binding
        if role == BindingRole::UnorderedAccess {
            self.storages.bump(class);
        }

        self.track_usage(backend.pending_serial());
        Ok((class, self.storage_allocation(class)?))
    }

    /// Fill `[offset, offset + size)` with `value` unless `predicate` is false
    /// when the GPU executes the command.
    ///
    /// The revision is bumped either way: the logical contents are whatever
    /// the predicate decides. The clear targets the general GPU-writable
    /// storage: constant storages only take whole or granularity-aligned
    /// updates.
    pub(crate) fn predicated_clear<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        predicate: PredicateId,
        offset: u64,
        size: u64,
        value: u8,
    ) -> Result<AccessClass> {
        let class = AccessClass::GpuWritableGeneral;
        self.ensure_storage(backend, class)?;
        self.sync_storage(backend, class)?;

        let dst = self.storage_allocation(class)?;
        let fill = vec![value; byte_len(size)];
        backend.update_predicated(predicate, dst, offset, &fill)?;

        self.storages.bump(class);
        self.track_usage(backend.pending_serial());
        Ok(class)
    }
}

fn fill_and_copy<B: GpuBackend>(
    backend: &mut B,
    upload: &PhysicalAllocation,
    dst: AllocationId,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let mut memory = backend.map(upload.id(), MapType::WriteDiscard)?;
    let written = memory.write_bytes(0, data);
    backend.unmap(upload.id());
    written?;

    backend.copy_region(upload.id(), 0, dst, offset, data.len() as u64)
}

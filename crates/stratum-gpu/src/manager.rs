//! Buffer manager: the public entry point of the engine.
//!
//! Owns the backend, every logical buffer, the map request queue and the
//! deferred sync worklist. All methods take `&mut self`; share a manager
//! across threads through [`SharedBufferManager`].

use std::collections::VecDeque;
use std::sync::Arc;

use bytemuck::Pod;
use hashbrown::HashMap;
use parking_lot::Mutex;
use stratum_core::constants::{COPY_BUFFER_ALIGNMENT, MAX_BUFFER_SIZE};
use stratum_core::{is_aligned, BindingRole, BufferUsage, ExecutionSerial, MapMode};

use crate::backend::{AllocationId, GpuBackend, PredicateId};
use crate::buffer::{byte_len, BufferDescriptor, BufferId, LogicalBuffer, MapState};
use crate::config::EngineConfig;
use crate::deferred::DeferredSyncQueue;
use crate::error::{GpuError, Result};
use crate::map::{MapSession, MapStatus};
use crate::memory::AccessClass;
use crate::sync::SyncOutcome;

/// A buffer manager behind a mutex, for use from several threads.
pub type SharedBufferManager<B> = Arc<Mutex<BufferManager<B>>>;

/// Owner of all logical buffers of one device.
pub struct BufferManager<B: GpuBackend> {
    backend: B,
    config: EngineConfig,
    buffers: HashMap<BufferId, LogicalBuffer>,
    next_buffer_id: u64,
    /// Buffers whose staging storage is refreshed at the next flush.
    pending_sync: DeferredSyncQueue,
    /// Pending map requests in request order.
    map_requests: VecDeque<BufferId>,
}

impl<B: GpuBackend> BufferManager<B> {
    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get the backend mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Look up a buffer.
    pub fn buffer(&self, id: BufferId) -> Option<&LogicalBuffer> {
        self.buffers.get(&id)
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of buffers queued for staging reconciliation.
    pub fn pending_sync_count(&self) -> usize {
        self.pending_sync.pending_count()
    }

    /// Check if a buffer is queued for staging reconciliation.
    pub fn is_sync_pending(&self, id: BufferId) -> bool {
        self.pending_sync.contains(id)
    }

    /// Number of map requests waiting for the GPU.
    pub fn pending_map_count(&self) -> usize {
        self.map_requests.len()
    }

    /// Wrap the manager for shared use.
    pub fn into_shared(self) -> SharedBufferManager<B> {
        Arc::new(Mutex::new(self))
    }

    // ===== LIFETIME =====

    /// Create a logical buffer.
    pub fn create_buffer(&mut self, desc: &BufferDescriptor) -> Result<BufferId> {
        self.create_buffer_impl(desc).inspect_err(log_fatal)
    }

    fn create_buffer_impl(&mut self, desc: &BufferDescriptor) -> Result<BufferId> {
        if desc.usage.is_empty() {
            return Err(GpuError::Validation(format!(
                "Buffer '{}' has no usage",
                desc.label
            )));
        }
        if desc.size > MAX_BUFFER_SIZE {
            return Err(GpuError::Validation(format!(
                "Buffer '{}' of {} bytes exceeds the {MAX_BUFFER_SIZE} byte limit",
                desc.label, desc.size
            )));
        }

        let id = BufferId(self.next_buffer_id);
        let label = format!("{}{}", self.config.label_prefix, desc.label);
        let buffer =
            LogicalBuffer::new(&mut self.backend, id, label, desc, self.config.lazy_zero_init)?;
        self.next_buffer_id += 1;

        tracing::debug!(
            buffer = %id,
            label = %desc.label,
            size = desc.size,
            usage = ?desc.usage,
            "Created buffer"
        );
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    /// Destroy a buffer, releasing its mapping, pending requests and storages.
    pub fn destroy_buffer(&mut self, id: BufferId) -> Result<()> {
        let mut buffer = self.buffers.remove(&id).ok_or_else(|| unknown_buffer(id))?;
        self.map_requests.retain(|queued| *queued != id);
        self.pending_sync.remove(id);
        buffer.release(&mut self.backend);
        tracing::debug!(buffer = %id, "Destroyed buffer");
        Ok(())
    }

    // ===== WRITES =====

    /// Write `data` into the buffer at `offset`.
    pub fn write(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        self.write_impl(id, offset, data).inspect_err(log_fatal)
    }

    /// Write a slice of plain-old-data values into the buffer at `offset`.
    pub fn write_typed<T: Pod>(&mut self, id: BufferId, offset: u64, data: &[T]) -> Result<()> {
        self.write(id, offset, bytemuck::cast_slice(data))
    }

    /// Fill `[offset, offset + size)` with `value`.
    pub fn clear(&mut self, id: BufferId, offset: u64, size: u64, value: u8) -> Result<()> {
        if size == 0 {
            return Err(GpuError::Validation(format!("Zero-size clear of {id}")));
        }
        check_aligned(offset, size, "clear")?;
        check_range(lookup(&self.buffers, id)?, offset, size, "clear")?;
        let fill = vec![value; byte_len(size)];
        self.write(id, offset, &fill)
    }

    fn write_impl(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = lookup_mut(&mut self.buffers, id)?;
        let size = data.len() as u64;

        if size == 0 {
            return Err(GpuError::Validation(format!("Zero-size write to {id}")));
        }
        check_aligned(offset, size, "write")?;
        check_range(buffer, offset, size, "write")?;
        check_unmapped(buffer, "write")?;
        if !buffer
            .usage()
            .intersects(BufferUsage::CPU_WRITE | BufferUsage::COPY_DST)
        {
            return Err(GpuError::Validation(format!(
                "{id} cannot be written: usage {:?} lacks CPU_WRITE and COPY_DST",
                buffer.usage()
            )));
        }

        buffer.ensure_initialized_as_destination(&mut self.backend, offset, size)?;
        let class = buffer.write_internal(&mut self.backend, offset, data)?;
        buffer.mark_initialized();
        if buffer.wants_staging_refresh(class) {
            self.pending_sync.enqueue(id);
        }
        Ok(())
    }

    /// Fill `[offset, offset + size)` with `value` on the GPU, unless
    /// `predicate` evaluates to false when the command executes.
    pub fn predicated_clear(
        &mut self,
        id: BufferId,
        predicate: PredicateId,
        offset: u64,
        size: u64,
        value: u8,
    ) -> Result<()> {
        self.predicated_clear_impl(id, predicate, offset, size, value)
            .inspect_err(log_fatal)
    }

    fn predicated_clear_impl(
        &mut self,
        id: BufferId,
        predicate: PredicateId,
        offset: u64,
        size: u64,
        value: u8,
    ) -> Result<()> {
        let buffer = lookup_mut(&mut self.buffers, id)?;
        if size == 0 {
            return Err(GpuError::Validation(format!(
                "Zero-size predicated clear of {id}"
            )));
        }
        check_aligned(offset, size, "predicated clear")?;
        check_range(buffer, offset, size, "predicated clear")?;
        check_unmapped(buffer, "predicated clear")?;
        if !buffer.usage().intersects(BufferUsage::GPU_WRITES) {
            return Err(GpuError::Validation(format!(
                "{id} cannot be written by the GPU: usage {:?}",
                buffer.usage()
            )));
        }

        // The predicate may skip the fill, so the rest must already be defined
        buffer.ensure_initialized(&mut self.backend)?;
        let class = buffer.predicated_clear(&mut self.backend, predicate, offset, size, value)?;
        if buffer.wants_staging_refresh(class) {
            self.pending_sync.enqueue(id);
        }
        Ok(())
    }

    /// Record a device copy of `size` bytes between two buffers.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.copy_impl(src, src_offset, dst, dst_offset, size)
            .inspect_err(log_fatal)
    }

    fn copy_impl(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        if src == dst {
            return Err(GpuError::Validation(format!(
                "Copy source and destination are both {src}"
            )));
        }
        {
            let source = lookup(&self.buffers, src)?;
            let destination = lookup(&self.buffers, dst)?;
            if !source.usage().contains(BufferUsage::COPY_SRC) {
                return Err(GpuError::Validation(format!("{src} lacks COPY_SRC usage")));
            }
            if !destination.usage().contains(BufferUsage::COPY_DST) {
                return Err(GpuError::Validation(format!("{dst} lacks COPY_DST usage")));
            }
            check_aligned(src_offset, size, "copy source")?;
            check_aligned(dst_offset, size, "copy destination")?;
            check_range(source, src_offset, size, "copy source")?;
            check_range(destination, dst_offset, size, "copy destination")?;
            check_unmapped(source, "copy")?;
            check_unmapped(destination, "copy")?;
        }
        if size == 0 {
            return Ok(());
        }

        let source = lookup_mut(&mut self.buffers, src)?;
        source.ensure_initialized(&mut self.backend)?;
        let src_allocation = source.copy_source(&mut self.backend)?;

        let destination = lookup_mut(&mut self.buffers, dst)?;
        destination.ensure_initialized_as_destination(&mut self.backend, dst_offset, size)?;
        let class = destination.copy_from(
            &mut self.backend,
            src_allocation,
            src_offset,
            dst_offset,
            size,
        )?;
        destination.mark_initialized();
        if destination.wants_staging_refresh(class) {
            self.pending_sync.enqueue(dst);
        }
        Ok(())
    }

    // ===== BINDING =====

    /// Prepare the buffer for a GPU binding in `role` and return the
    /// allocation to bind.
    ///
    /// Usage is recorded at the pending serial, so CPU access afterwards waits
    /// for the submission containing the draw or dispatch.
    pub fn bind_as(&mut self, id: BufferId, role: BindingRole) -> Result<AllocationId> {
        self.bind_impl(id, role).inspect_err(log_fatal)
    }

    fn bind_impl(&mut self, id: BufferId, role: BindingRole) -> Result<AllocationId> {
        let buffer = lookup_mut(&mut self.buffers, id)?;
        if !buffer.usage().supports_role(role) {
            return Err(GpuError::Validation(format!(
                "{id} with usage {:?} cannot be bound as {role:?}",
                buffer.usage()
            )));
        }
        check_unmapped(buffer, "bind")?;

        buffer.ensure_initialized(&mut self.backend)?;
        let (class, allocation) = buffer.bind(&mut self.backend, role)?;
        if role == BindingRole::UnorderedAccess && buffer.wants_staging_refresh(class) {
            self.pending_sync.enqueue(id);
        }
        Ok(allocation)
    }

    /// Bring one storage of a buffer up to date right away.
    pub fn sync_storage(&mut self, id: BufferId, class: AccessClass) -> Result<SyncOutcome> {
        let buffer = lookup_mut(&mut self.buffers, id)?;
        check_unmapped(buffer, "sync")?;
        if !buffer.storages().contains(class) {
            return Err(GpuError::Validation(format!("{id} has no {class} storage")));
        }
        buffer
            .sync_storage(&mut self.backend, class)
            .inspect_err(log_fatal)
    }

    // ===== MAPPING =====

    /// Request CPU access to the buffer.
    ///
    /// Completes immediately when the GPU no longer uses the buffer;
    /// otherwise the request is queued and completed by
    /// [`Self::poll_map_requests`] once its serial retires.
    pub fn map_async(&mut self, id: BufferId, mode: MapMode) -> Result<MapStatus> {
        self.map_async_impl(id, mode).inspect_err(log_fatal)
    }

    fn map_async_impl(&mut self, id: BufferId, mode: MapMode) -> Result<MapStatus> {
        let completed = self.backend.completed_serial()?;
        let buffer = lookup_mut(&mut self.buffers, id)?;
        if !buffer.usage().supports_map_mode(mode) {
            return Err(GpuError::Validation(format!(
                "{id} with usage {:?} cannot be mapped for {mode}",
                buffer.usage()
            )));
        }

        if buffer.request_map(mode, completed)? {
            buffer.complete_map(&mut self.backend, mode)?;
            return Ok(MapStatus::Mapped);
        }

        tracing::debug!(
            buffer = %id,
            %mode,
            serial = %buffer.last_usage_serial(),
            "Map request waits for the GPU"
        );
        self.map_requests.push_back(id);
        Ok(MapStatus::Pending)
    }

    /// Complete every pending map request whose serial has retired, in
    /// request order. Returns the buffers that became mapped.
    pub fn poll_map_requests(&mut self) -> Result<Vec<BufferId>> {
        self.poll_map_requests_impl().inspect_err(log_fatal)
    }

    fn poll_map_requests_impl(&mut self) -> Result<Vec<BufferId>> {
        let completed = self.backend.completed_serial()?;
        let mut mapped = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.map_requests.len());

        while let Some(id) = self.map_requests.pop_front() {
            let Some(buffer) = self.buffers.get_mut(&id) else {
                continue;
            };
            let MapState::MapRequested { mode, serial } = buffer.map_state() else {
                continue;
            };
            if !serial.is_retired(completed) {
                waiting.push_back(id);
                continue;
            }

            if let Err(err) = buffer.complete_map(&mut self.backend, mode) {
                waiting.extend(self.map_requests.drain(..));
                self.map_requests = waiting;
                return Err(err);
            }
            mapped.push(id);
        }

        self.map_requests = waiting;
        Ok(mapped)
    }

    /// The mapped bytes of a mapped buffer.
    pub fn mapped_range(&self, id: BufferId) -> Result<&[u8]> {
        let buffer = lookup(&self.buffers, id)?;
        buffer
            .mapped_bytes()
            .ok_or_else(|| GpuError::Validation(format!("{id} is not mapped")))
    }

    /// The mapped bytes of a buffer mapped for writing.
    pub fn mapped_range_mut(&mut self, id: BufferId) -> Result<&mut [u8]> {
        let buffer = lookup_mut(&mut self.buffers, id)?;
        buffer
            .mapped_bytes_mut()
            .ok_or_else(|| GpuError::Validation(format!("{id} is not mapped for writing")))
    }

    /// Release a mapping, or cancel a pending map request.
    pub fn unmap(&mut self, id: BufferId) -> Result<()> {
        let buffer = lookup_mut(&mut self.buffers, id)?;
        match buffer.finish_unmap(&mut self.backend)? {
            None => self.map_requests.retain(|queued| *queued != id),
            Some((MapMode::Write, storage)) => {
                if self.config.refresh_staging_after_write_map
                    && storage != AccessClass::Staging
                    && buffer.storages().contains(AccessClass::Staging)
                {
                    self.pending_sync.enqueue(id);
                }
            }
            Some((MapMode::Read, _)) => {}
        }
        Ok(())
    }

    /// Map the buffer for reading, blocking until the GPU is done with it.
    ///
    /// Returns `Ok(None)` when the buffer does not support read mapping.
    pub fn map_for_read(&mut self, id: BufferId) -> Result<Option<MapSession<'_, B>>> {
        self.map_scoped(id, MapMode::Read).inspect_err(log_fatal)
    }

    /// Map the buffer for writing, blocking until the GPU is done with it.
    ///
    /// Returns `Ok(None)` when the buffer does not support write mapping.
    pub fn map_for_write(&mut self, id: BufferId) -> Result<Option<MapSession<'_, B>>> {
        self.map_scoped(id, MapMode::Write).inspect_err(log_fatal)
    }

    fn map_scoped(&mut self, id: BufferId, mode: MapMode) -> Result<Option<MapSession<'_, B>>> {
        let (usage, state) = {
            let buffer = lookup(&self.buffers, id)?;
            (buffer.usage(), buffer.map_state())
        };
        if !usage.supports_map_mode(mode) {
            return Ok(None);
        }

        match state {
            MapState::Mapped { mode: current, .. } if current == mode => {
                return Ok(Some(MapSession::new(self, id, mode, false)));
            }
            MapState::MapRequested { mode: current, .. } if current == mode => {
                self.wait_for_map(id)?;
                return Ok(Some(MapSession::new(self, id, mode, false)));
            }
            MapState::Unmapped => {}
            MapState::Mapped { mode: current, .. } | MapState::MapRequested { mode: current, .. } => {
                return Err(GpuError::Validation(format!(
                    "{id} is already mapped for {current}"
                )));
            }
        }

        if self.map_async_impl(id, mode)? == MapStatus::Pending {
            self.wait_for_map(id)?;
        }
        Ok(Some(MapSession::new(self, id, mode, true)))
    }

    /// Block until a pending map request can complete, then complete it.
    fn wait_for_map(&mut self, id: BufferId) -> Result<()> {
        let MapState::MapRequested { mode, serial } = lookup(&self.buffers, id)?.map_state() else {
            return Ok(());
        };

        if serial > self.backend.last_submitted_serial() {
            self.submit()?;
        }
        tracing::debug!(buffer = %id, %serial, "Blocking until the GPU reaches the map serial");
        self.backend.wait_for_serial(serial)?;

        self.map_requests.retain(|queued| *queued != id);
        lookup_mut(&mut self.buffers, id)?.complete_map(&mut self.backend, mode)
    }

    // ===== SUBMISSION =====

    /// Reconcile the staging storages of every queued buffer.
    ///
    /// Called right before the recording is submitted. Buffers that are
    /// currently mapped stay queued. Returns the number of device copies
    /// recorded.
    pub fn on_submission_flush(&mut self) -> Result<usize> {
        self.flush_impl().inspect_err(log_fatal)
    }

    fn flush_impl(&mut self) -> Result<usize> {
        let mut synced = 0;
        let mut still_mapped = Vec::new();

        let mut queued = self.pending_sync.drain().into_iter();
        while let Some(id) = queued.next() {
            let Some(buffer) = self.buffers.get_mut(&id) else {
                continue;
            };
            if matches!(buffer.map_state(), MapState::Mapped { .. }) {
                still_mapped.push(id);
                continue;
            }
            match buffer.sync_staging(&mut self.backend) {
                Ok(Some(SyncOutcome::DeviceCopy)) => synced += 1,
                Ok(_) => {}
                Err(err) => {
                    // Keep the failed buffer and everything after it queued
                    for id in still_mapped.into_iter().chain([id]).chain(queued) {
                        self.pending_sync.enqueue(id);
                    }
                    return Err(err);
                }
            }
        }

        for id in still_mapped {
            self.pending_sync.enqueue(id);
        }
        if synced > 0 {
            tracing::debug!(synced, "Reconciled staging storages");
        }
        Ok(synced)
    }

    /// Flush deferred work and submit the recording.
    pub fn submit(&mut self) -> Result<ExecutionSerial> {
        self.on_submission_flush()?;
        let serial = self.backend.submit().inspect_err(log_fatal)?;
        tracing::trace!(%serial, "Submitted");
        Ok(serial)
    }
}

impl<B: GpuBackend> Drop for BufferManager<B> {
    fn drop(&mut self) {
        for (_, mut buffer) in self.buffers.drain() {
            buffer.release(&mut self.backend);
        }
    }
}

/// Builder for creating a buffer manager.
#[derive(Debug, Clone, Default)]
pub struct BufferManagerBuilder {
    config: EngineConfig,
}

impl BufferManagerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable or disable lazy zero-initialization.
    #[must_use]
    pub fn lazy_zero_init(mut self, enable: bool) -> Self {
        self.config.lazy_zero_init = enable;
        self
    }

    /// Set the allocation label prefix.
    #[must_use]
    pub fn label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.label_prefix = prefix.into();
        self
    }

    /// Enable or disable staging refresh after write maps.
    #[must_use]
    pub fn refresh_staging_after_write_map(mut self, enable: bool) -> Self {
        self.config.refresh_staging_after_write_map = enable;
        self
    }

    /// Build the manager on top of `backend`.
    pub fn build<B: GpuBackend>(self, backend: B) -> Result<BufferManager<B>> {
        let capabilities = backend.capabilities();
        if !capabilities.meets_requirements() {
            return Err(GpuError::Validation(format!(
                "Device does not meet requirements: {}",
                capabilities.summary()
            )));
        }
        tracing::info!("Buffer engine on {}", capabilities.summary());

        Ok(BufferManager {
            backend,
            config: self.config,
            buffers: HashMap::new(),
            next_buffer_id: 1,
            pending_sync: DeferredSyncQueue::new(),
            map_requests: VecDeque::new(),
        })
    }
}

fn log_fatal(err: &GpuError) {
    if err.is_fatal() {
        tracing::error!("{err}");
    }
}

fn unknown_buffer(id: BufferId) -> GpuError {
    GpuError::Validation(format!("Unknown {id}"))
}

fn lookup(buffers: &HashMap<BufferId, LogicalBuffer>, id: BufferId) -> Result<&LogicalBuffer> {
    buffers.get(&id).ok_or_else(|| unknown_buffer(id))
}

fn lookup_mut(
    buffers: &mut HashMap<BufferId, LogicalBuffer>,
    id: BufferId,
) -> Result<&mut LogicalBuffer> {
    buffers.get_mut(&id).ok_or_else(|| unknown_buffer(id))
}

fn check_aligned(offset: u64, size: u64, op: &str) -> Result<()> {
    if is_aligned(offset, COPY_BUFFER_ALIGNMENT) && is_aligned(size, COPY_BUFFER_ALIGNMENT) {
        return Ok(());
    }
    Err(GpuError::Validation(format!(
        "{op}: offset {offset} and size {size} must be multiples of {COPY_BUFFER_ALIGNMENT}"
    )))
}

fn check_range(buffer: &LogicalBuffer, offset: u64, size: u64, op: &str) -> Result<()> {
    let end = offset.checked_add(size);
    if end.is_some_and(|end| end <= buffer.size()) {
        return Ok(());
    }
    Err(GpuError::Validation(format!(
        "{op}: range {offset}+{size} is outside {} of {} bytes",
        buffer.id(),
        buffer.size()
    )))
}

fn check_unmapped(buffer: &LogicalBuffer, op: &str) -> Result<()> {
    match buffer.map_state() {
        MapState::Unmapped => Ok(()),
        _ => Err(GpuError::Validation(format!(
            "{op}: {} is mapped or has a pending map",
            buffer.id()
        ))),
    }
}

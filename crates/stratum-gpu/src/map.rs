//! CPU mapping of logical buffers.
//!
//! Mapping is asynchronous: a request completes immediately when the GPU is
//! done with the buffer, otherwise it waits in the manager's request queue
//! until the buffer's last usage serial retires. [`MapSession`] offers the
//! blocking, scope-bound variant.

use stratum_core::{ExecutionSerial, MapMode};

use crate::backend::{GpuBackend, MapType, MappedMemory};
use crate::buffer::{byte_len, BufferId, LogicalBuffer, MapState};
use crate::error::{GpuError, Result};
use crate::manager::BufferManager;
use crate::memory::AccessClass;

/// Result of a map request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapStatus {
    /// Waiting for the GPU; see [`BufferManager::poll_map_requests`].
    Pending,
    /// The mapped range is available.
    Mapped,
}

impl LogicalBuffer {
    /// Start a map. Returns `true` when the buffer is idle and the map can
    /// complete right away.
    pub(crate) fn request_map(&mut self, mode: MapMode, completed: ExecutionSerial) -> Result<bool> {
        match self.map_state {
            MapState::Unmapped => {}
            MapState::MapRequested { .. } => {
                return Err(GpuError::Validation(format!(
                    "{} already has a pending map request",
                    self.id
                )));
            }
            MapState::Mapped { mode: current, .. } => {
                return Err(GpuError::Validation(format!(
                    "{} is already mapped for {current}",
                    self.id
                )));
            }
        }

        if self.last_usage_serial.is_retired(completed) {
            return Ok(true);
        }

        self.map_state = MapState::MapRequested {
            mode,
            serial: self.last_usage_serial,
        };
        Ok(false)
    }

    /// Finish a map: sync the mapped storage and expose its memory.
    ///
    /// The buffer is left unmapped if anything fails.
    pub(crate) fn complete_map<B: GpuBackend>(&mut self, backend: &mut B, mode: MapMode) -> Result<()> {
        let result = self.map_storage(backend, mode);
        match result {
            Ok((storage, memory)) => {
                self.mapped = Some(memory);
                self.map_state = MapState::Mapped { mode, storage };
                tracing::trace!(buffer = %self.id, %mode, %storage, "Mapped");
                Ok(())
            }
            Err(err) => {
                self.map_state = MapState::Unmapped;
                Err(err)
            }
        }
    }

    fn map_storage<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        mode: MapMode,
    ) -> Result<(AccessClass, MappedMemory)> {
        self.ensure_initialized(backend)?;

        let storage = self.map_class(mode);
        self.ensure_storage(backend, storage)?;
        self.sync_storage(backend, storage)?;

        let map_type = match mode {
            MapMode::Read if backend.capabilities().supports_read_only_map => MapType::Read,
            MapMode::Read => MapType::ReadWrite,
            MapMode::Write => MapType::WriteNoOverwrite,
        };
        let allocation = self.storage_allocation(storage)?;
        let memory = backend.map(allocation, map_type)?;
        Ok((storage, memory))
    }

    /// Release a mapping or cancel a pending request.
    ///
    /// Returns the mode and storage of a released mapping, `None` for a
    /// cancelled request.
    pub(crate) fn finish_unmap<B: GpuBackend>(
        &mut self,
        backend: &mut B,
    ) -> Result<Option<(MapMode, AccessClass)>> {
        match self.map_state {
            MapState::Unmapped => Err(GpuError::Validation(format!(
                "{} is not mapped",
                self.id
            ))),
            MapState::MapRequested { .. } => {
                self.map_state = MapState::Unmapped;
                tracing::trace!(buffer = %self.id, "Cancelled map request");
                Ok(None)
            }
            MapState::Mapped { mode, storage } => {
                if let Some(allocation) = self.storages.allocation_id(storage) {
                    backend.unmap(allocation);
                }
                self.mapped = None;
                self.map_state = MapState::Unmapped;

                // A read-write mapping may have been written through
                let may_have_written =
                    mode == MapMode::Write || !backend.capabilities().supports_read_only_map;
                if may_have_written {
                    self.storages.bump(storage);
                }
                Ok(Some((mode, storage)))
            }
        }
    }

    /// The mapped logical range, if mapped.
    pub fn mapped_bytes(&self) -> Option<&[u8]> {
        let memory = self.mapped.as_ref()?;
        let bytes = memory.bytes();
        Some(&bytes[..byte_len(self.size).min(bytes.len())])
    }

    /// The mapped logical range, if mapped for writing.
    pub(crate) fn mapped_bytes_mut(&mut self) -> Option<&mut [u8]> {
        if !matches!(self.map_state, MapState::Mapped { mode: MapMode::Write, .. }) {
            return None;
        }
        let len = byte_len(self.size);
        let memory = self.mapped.as_mut()?;
        let bytes = memory.bytes_mut();
        let len = len.min(bytes.len());
        Some(&mut bytes[..len])
    }
}

/// Scoped CPU access to a buffer, released when dropped.
///
/// A session that found the buffer already mapped in the same mode borrows
/// that mapping and leaves it in place when it ends.
pub struct MapSession<'a, B: GpuBackend> {
    manager: &'a mut BufferManager<B>,
    buffer: BufferId,
    mode: MapMode,
    release_on_drop: bool,
}

impl<'a, B: GpuBackend> MapSession<'a, B> {
    pub(crate) fn new(
        manager: &'a mut BufferManager<B>,
        buffer: BufferId,
        mode: MapMode,
        release_on_drop: bool,
    ) -> Self {
        Self {
            manager,
            buffer,
            mode,
            release_on_drop,
        }
    }

    /// Mapped buffer.
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Access mode.
    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Whether ending the session unmaps the buffer.
    pub fn owns_mapping(&self) -> bool {
        self.release_on_drop
    }

    /// The mapped bytes.
    pub fn bytes(&self) -> &[u8] {
        self.manager
            .buffer(self.buffer)
            .and_then(LogicalBuffer::mapped_bytes)
            .unwrap_or(&[])
    }

    /// The mapped bytes, writable. Fails for read sessions.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.manager.mapped_range_mut(self.buffer)
    }

    /// End the session, reporting unmap errors instead of logging them.
    pub fn unmap(mut self) -> Result<()> {
        if std::mem::replace(&mut self.release_on_drop, false) {
            self.manager.unmap(self.buffer)
        } else {
            Ok(())
        }
    }
}

impl<B: GpuBackend> Drop for MapSession<'_, B> {
    fn drop(&mut self) {
        if !self.release_on_drop {
            return;
        }
        if let Err(err) = self.manager.unmap(self.buffer) {
            tracing::error!(buffer = %self.buffer, "Failed to release mapping: {err}");
        }
    }
}

//! Storage reconciliation.
//!
//! Bringing a stale storage up to date prefers a device copy from the
//! last-updated storage. Storages the device cannot copy into (the dynamic
//! CPU-writable ones) are refreshed through the staging storage with a CPU
//! copy, which stalls until the GPU catches up.

use crate::backend::{GpuBackend, MapType};
use crate::buffer::LogicalBuffer;
use crate::error::{GpuError, Result};
use crate::memory::AccessClass;

/// How [`LogicalBuffer::sync_storage`] brought a storage up to date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to do.
    AlreadyCurrent,
    /// A device copy was recorded from the last-updated storage.
    DeviceCopy,
    /// The data went through staging and a CPU copy.
    CpuBounce,
}

impl LogicalBuffer {
    /// Make the storage of class `target` hold the newest data.
    ///
    /// Idempotent: a second call without an intervening write returns
    /// [`SyncOutcome::AlreadyCurrent`] and records nothing.
    pub fn sync_storage<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        target: AccessClass,
    ) -> Result<SyncOutcome> {
        if self.storages.is_current(target) {
            return Ok(SyncOutcome::AlreadyCurrent);
        }

        let source = self.storages.last_updated().ok_or_else(|| {
            GpuError::InvalidState(format!("{} has no storage to sync from", self.id))
        })?;
        let dst = self.storage_allocation(target)?;

        if target.supports_device_copy_dst() {
            let src = self.storage_allocation(source)?;
            backend.copy_region(src, 0, dst, 0, self.allocated_size)?;
            self.storages.mark_current(target);
            self.track_usage(backend.pending_serial());
            tracing::trace!(buffer = %self.id, %source, %target, "Device copy sync");
            return Ok(SyncOutcome::DeviceCopy);
        }

        tracing::warn!(
            buffer = %self.id,
            %source,
            %target,
            "Syncing through a CPU bounce, this waits for the GPU"
        );
        self.ensure_storage(backend, AccessClass::Staging)?;
        self.sync_storage(backend, AccessClass::Staging)?;

        let staging = self.storage_allocation(AccessClass::Staging)?;
        let read = backend.map(staging, MapType::Read)?;
        let mut write = match backend.map(dst, MapType::WriteDiscard) {
            Ok(memory) => memory,
            Err(err) => {
                backend.unmap(staging);
                return Err(err);
            }
        };

        let len = read.len().min(write.len());
        write.bytes_mut()[..len].copy_from_slice(&read.bytes()[..len]);
        backend.unmap(dst);
        backend.unmap(staging);

        self.storages.mark_current(target);
        Ok(SyncOutcome::CpuBounce)
    }

    /// Refresh the staging storage, if the buffer has one.
    pub(crate) fn sync_staging<B: GpuBackend>(
        &mut self,
        backend: &mut B,
    ) -> Result<Option<SyncOutcome>> {
        if !self.storages.contains(AccessClass::Staging) {
            return Ok(None);
        }
        self.sync_storage(backend, AccessClass::Staging).map(Some)
    }
}

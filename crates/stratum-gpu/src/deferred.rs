//! Deferred CPU reconciliation for GPU-written mappable buffers.
//!
//! When the GPU writes a buffer that can later be mapped for reading, the new
//! contents live only in a GPU-writable storage. Copying them into the staging
//! storage right away would be premature (more GPU writes may follow in the
//! same submission), and doing it at map time would make the map wait for the
//! copy. Instead the buffer is queued here and its staging storage is
//! refreshed once, right before the recording is submitted.

use std::collections::VecDeque;

use crate::buffer::BufferId;

/// Worklist of buffers whose staging storage must be refreshed at the next
/// submission flush.
///
/// Each buffer appears at most once; buffers are drained in the order they
/// were first queued.
#[derive(Debug, Default)]
pub struct DeferredSyncQueue {
    /// Buffers pending reconciliation.
    pending: VecDeque<BufferId>,
}

impl DeferredSyncQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a buffer for reconciliation.
    ///
    /// Returns `false` if the buffer was already queued.
    pub fn enqueue(&mut self, buffer: BufferId) -> bool {
        if self.pending.contains(&buffer) {
            return false;
        }
        self.pending.push_back(buffer);
        true
    }

    /// Drop a buffer from the queue (it was destroyed).
    pub fn remove(&mut self, buffer: BufferId) {
        self.pending.retain(|queued| *queued != buffer);
    }

    /// Take every queued buffer, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<BufferId> {
        self.pending.drain(..).collect()
    }

    /// Check if a buffer is queued.
    pub fn contains(&self, buffer: BufferId) -> bool {
        self.pending.contains(&buffer)
    }

    /// Get the number of queued buffers.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

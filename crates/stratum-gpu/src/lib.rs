//! Multi-storage GPU buffer synchronization for the Stratum engine.
//!
//! This crate provides:
//! - Logical buffers backed by up to five physical storages, one per access class
//! - Revision tracking and device-copy/CPU-bounce reconciliation between storages
//! - Asynchronous and scoped CPU mapping
//! - Deferred staging reconciliation at submission time
//! - The backend traits a device implementation must provide

pub mod backend;
pub mod buffer;
pub mod capabilities;
pub mod config;
pub mod deferred;
pub mod error;
pub mod manager;
pub mod map;
pub mod memory;
pub mod storage;
pub mod sync;

pub use backend::{
    AllocationDesc, AllocationFactory, AllocationId, GpuBackend, MapType, MappedMemory,
    PredicateId, RecordingContext, SerialTracker, UpdateHint,
};
pub use buffer::{BufferDescriptor, BufferId, LogicalBuffer, MapState};
pub use capabilities::DeviceCapabilities;
pub use config::EngineConfig;
pub use deferred::DeferredSyncQueue;
pub use error::{GpuError, Result};
pub use manager::{BufferManager, BufferManagerBuilder, SharedBufferManager};
pub use map::{MapSession, MapStatus};
pub use memory::{AccessClass, PhysicalAllocation};
pub use storage::{StorageEntry, StorageSet};
pub use sync::SyncOutcome;

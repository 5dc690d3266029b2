//! Core types for the Stratum buffer synchronization engine.
//!
//! This crate provides the backend-agnostic vocabulary used by every other crate:
//! - Buffer usage flags, map modes and binding roles
//! - Submission serials
//! - Alignment helpers

pub mod math;
pub mod serial;
pub mod types;

pub use math::{align_up, is_aligned};
pub use serial::ExecutionSerial;
pub use types::{BindingRole, BufferUsage, MapMode};

/// Engine-wide constants
pub mod constants {
    /// Offsets and sizes of buffer writes, clears and copies must be multiples of this.
    pub const COPY_BUFFER_ALIGNMENT: u64 = 4;
    /// Allocation alignment of storages that never back a constant buffer.
    pub const GENERAL_STORAGE_ALIGNMENT: u64 = 4;
    /// Allocation alignment of buffers usable as constant buffers (one shader constant).
    pub const CONSTANT_STORAGE_ALIGNMENT: u64 = 16;
    /// Partial constant buffer updates must start and end on this boundary.
    pub const CONSTANT_BUFFER_UPDATE_GRANULARITY: u64 = 16;
    /// Largest logical buffer the engine accepts (D3D11 resource size limit).
    pub const MAX_BUFFER_SIZE: u64 = 2 * 1024 * 1024 * 1024;
}

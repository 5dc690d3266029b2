//! Physical allocations and their access classes.

use std::fmt;

use stratum_core::constants::{CONSTANT_STORAGE_ALIGNMENT, GENERAL_STORAGE_ALIGNMENT};

use crate::backend::{AllocationDesc, AllocationFactory, AllocationId};
use crate::error::Result;

/// The kind of physical resource backing a storage.
///
/// Each class is a combination of CPU/GPU access rights the graphics API
/// allows on a single resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessClass {
    /// Dynamic constant buffer, written by CPU maps.
    CpuWritableConstant,
    /// Default-usage constant buffer, written by device updates and copies.
    GpuWritableConstant,
    /// Dynamic vertex/index/shader-resource buffer, written by CPU maps.
    CpuWritableGeneral,
    /// Default-usage buffer usable as storage (UAV), copy destination and shader resource.
    GpuWritableGeneral,
    /// CPU read/write bounce buffer.
    Staging,
}

impl AccessClass {
    /// Number of access classes.
    pub const COUNT: usize = 5;

    /// Every access class, in slot order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::CpuWritableConstant,
        Self::GpuWritableConstant,
        Self::CpuWritableGeneral,
        Self::GpuWritableGeneral,
        Self::Staging,
    ];

    /// Slot of this class in a storage table.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::CpuWritableConstant => 0,
            Self::GpuWritableConstant => 1,
            Self::CpuWritableGeneral => 2,
            Self::GpuWritableGeneral => 3,
            Self::Staging => 4,
        }
    }

    /// The CPU can map the resource for writing.
    #[inline]
    pub const fn is_cpu_writable(self) -> bool {
        matches!(
            self,
            Self::CpuWritableConstant | Self::CpuWritableGeneral | Self::Staging
        )
    }

    /// The CPU can map the resource for reading.
    #[inline]
    pub const fn is_cpu_readable(self) -> bool {
        matches!(self, Self::Staging)
    }

    /// The resource can receive device-side copies.
    #[inline]
    pub const fn supports_device_copy_dst(self) -> bool {
        matches!(
            self,
            Self::GpuWritableConstant | Self::GpuWritableGeneral | Self::Staging
        )
    }

    /// The resource accepts inline device updates (`UpdateSubresource`).
    #[inline]
    pub const fn supports_device_update(self) -> bool {
        matches!(self, Self::GpuWritableConstant | Self::GpuWritableGeneral)
    }

    /// The resource is GPU-written and not CPU-visible.
    #[inline]
    pub const fn is_gpu_writable(self) -> bool {
        matches!(self, Self::GpuWritableConstant | Self::GpuWritableGeneral)
    }

    /// The resource can only be bound as a constant buffer.
    #[inline]
    pub const fn is_constant_buffer(self) -> bool {
        matches!(self, Self::CpuWritableConstant | Self::GpuWritableConstant)
    }

    /// Size alignment the graphics API requires for this class.
    #[inline]
    pub const fn alignment(self) -> u64 {
        if self.is_constant_buffer() {
            CONSTANT_STORAGE_ALIGNMENT
        } else {
            GENERAL_STORAGE_ALIGNMENT
        }
    }

    /// Short name used in allocation labels.
    pub const fn label_suffix(self) -> &'static str {
        match self {
            Self::CpuWritableConstant => "cpu-constant",
            Self::GpuWritableConstant => "gpu-constant",
            Self::CpuWritableGeneral => "cpu-general",
            Self::GpuWritableGeneral => "gpu-general",
            Self::Staging => "staging",
        }
    }
}

impl fmt::Display for AccessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_suffix())
    }
}

/// One graphics-API buffer resource.
///
/// Exclusively owned: it is neither `Clone` nor `Copy`, and releasing it
/// consumes it.
#[derive(Debug)]
pub struct PhysicalAllocation {
    id: AllocationId,
    size: u64,
    access: AccessClass,
}

impl PhysicalAllocation {
    /// Create an allocation through `factory`.
    pub fn create<F>(factory: &mut F, label: &str, size: u64, access: AccessClass) -> Result<Self>
    where
        F: AllocationFactory + ?Sized,
    {
        debug_assert!(size % access.alignment() == 0);
        let id = factory.create_allocation(&AllocationDesc {
            label,
            size,
            access,
        })?;

        Ok(Self { id, size, access })
    }

    /// Backend handle.
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Access class the resource was created for.
    pub fn access(&self) -> AccessClass {
        self.access
    }

    /// Release the resource.
    pub fn destroy<F>(self, factory: &mut F)
    where
        F: AllocationFactory + ?Sized,
    {
        factory.destroy_allocation(self.id);
    }
}

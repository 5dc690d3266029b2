//! Buffer usage vocabulary.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Capabilities a logical buffer must support over its lifetime.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Written from the CPU (queue writes, write mapping).
        const CPU_WRITE = 1 << 0;
        /// Read back on the CPU through a read mapping.
        const CPU_READ = 1 << 1;
        /// Bound as a constant (uniform) buffer.
        const CONSTANT = 1 << 2;
        /// Read by shaders as a storage resource.
        const STORAGE_READ = 1 << 3;
        /// Written by shaders as a storage resource.
        const STORAGE_WRITE = 1 << 4;
        /// Source of device-side copies.
        const COPY_SRC = 1 << 5;
        /// Destination of device-side copies and updates.
        const COPY_DST = 1 << 6;
        /// Holds indirect draw/dispatch arguments.
        const INDIRECT = 1 << 7;
        /// Bound as a vertex buffer.
        const VERTEX = 1 << 8;
        /// Bound as an index buffer.
        const INDEX = 1 << 9;
    }
}

impl BufferUsage {
    /// GPU roles that cannot be served by a constant buffer.
    pub const NON_CONSTANT_ROLES: Self = Self::STORAGE_READ
        .union(Self::STORAGE_WRITE)
        .union(Self::VERTEX)
        .union(Self::INDEX)
        .union(Self::INDIRECT);

    /// Usages that let the GPU modify the buffer contents.
    pub const GPU_WRITES: Self = Self::STORAGE_WRITE.union(Self::COPY_DST);

    /// Whether the buffer needs a storage that is not a constant buffer.
    ///
    /// Pure transfer buffers (no GPU binding role at all) also route through
    /// the general storages.
    #[inline]
    #[must_use]
    pub const fn needs_general_storage(self) -> bool {
        self.intersects(Self::NON_CONSTANT_ROLES) || !self.contains(Self::CONSTANT)
    }

    /// Whether the buffer can be bound in `role`.
    #[must_use]
    pub const fn supports_role(self, role: BindingRole) -> bool {
        match role {
            BindingRole::Constant => self.contains(Self::CONSTANT),
            BindingRole::ShaderResource => self.intersects(Self::NON_CONSTANT_ROLES),
            BindingRole::UnorderedAccess => self.contains(Self::STORAGE_WRITE),
        }
    }

    /// Whether the buffer can be mapped in `mode`.
    #[must_use]
    pub const fn supports_map_mode(self, mode: MapMode) -> bool {
        match mode {
            MapMode::Read => self.contains(Self::CPU_READ),
            MapMode::Write => self.contains(Self::CPU_WRITE),
        }
    }
}

/// CPU access requested by a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    Write,
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// How a pipeline binds a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingRole {
    /// Constant (uniform) buffer slot.
    Constant,
    /// Read-only shader resource, vertex/index input or indirect arguments.
    ShaderResource,
    /// Read-write storage (unordered access) slot.
    UnorderedAccess,
}

//! Per-buffer storage table and the rules deciding which storages exist.

use stratum_core::BufferUsage;

use crate::backend::AllocationId;
use crate::memory::{AccessClass, PhysicalAllocation};

/// One physical replica of a logical buffer, tagged with the revision of the
/// logical contents it holds.
#[derive(Debug)]
pub struct StorageEntry {
    allocation: PhysicalAllocation,
    revision: u64,
}

impl StorageEntry {
    /// Access class of the backing allocation.
    pub fn access_class(&self) -> AccessClass {
        self.allocation.access()
    }

    /// Revision of the contents held.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Backend handle of the backing allocation.
    pub fn allocation_id(&self) -> AllocationId {
        self.allocation.id()
    }
}

/// Fixed table holding at most one storage per access class.
///
/// Tracks which entry holds the newest data. Revisions are only compared:
/// an entry is current iff its revision equals the last-updated entry's.
#[derive(Debug, Default)]
pub struct StorageSet {
    entries: [Option<StorageEntry>; AccessClass::COUNT],
    last_updated: Option<AccessClass>,
}

impl StorageSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry of a class.
    pub fn get(&self, class: AccessClass) -> Option<&StorageEntry> {
        self.entries[class.index()].as_ref()
    }

    /// Check if a class has an entry.
    pub fn contains(&self, class: AccessClass) -> bool {
        self.entries[class.index()].is_some()
    }

    /// Backend handle of a class's allocation.
    pub fn allocation_id(&self, class: AccessClass) -> Option<AllocationId> {
        self.get(class).map(StorageEntry::allocation_id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// Check if the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.last_updated.is_none()
    }

    /// Iterate over the entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &StorageEntry> {
        self.entries.iter().flatten()
    }

    /// Entry holding the newest data.
    pub fn last_updated(&self) -> Option<AccessClass> {
        self.last_updated
    }

    /// Revision of the newest data (0 while the set is empty).
    pub fn latest_revision(&self) -> u64 {
        self.last_updated
            .and_then(|class| self.get(class))
            .map_or(0, StorageEntry::revision)
    }

    /// Check if a class exists and holds the newest data.
    pub fn is_current(&self, class: AccessClass) -> bool {
        self.get(class)
            .is_some_and(|entry| entry.revision == self.latest_revision())
    }

    /// Add an entry for a freshly created allocation.
    ///
    /// New entries start at revision 0. The first entry of an empty set
    /// becomes the last-updated one.
    pub fn insert(&mut self, allocation: PhysicalAllocation) {
        let class = allocation.access();
        debug_assert!(!self.contains(class), "duplicate {class} storage");

        self.entries[class.index()] = Some(StorageEntry {
            allocation,
            revision: 0,
        });
        if self.last_updated.is_none() {
            self.last_updated = Some(class);
        }
    }

    /// Record that a class now holds the newest data without a new write.
    pub(crate) fn mark_current(&mut self, class: AccessClass) {
        let latest = self.latest_revision();
        if let Some(entry) = self.entries[class.index()].as_mut() {
            entry.revision = latest;
        }
    }

    /// Record a write into a class: it gets a fresh revision and becomes the
    /// last-updated entry. Returns the new revision.
    pub(crate) fn bump(&mut self, class: AccessClass) -> u64 {
        let revision = self.latest_revision() + 1;
        if let Some(entry) = self.entries[class.index()].as_mut() {
            entry.revision = revision;
            self.last_updated = Some(class);
        }
        revision
    }

    /// Remove every entry, handing back the allocations for release.
    pub(crate) fn take_all(&mut self) -> Vec<PhysicalAllocation> {
        self.last_updated = None;
        self.entries
            .iter_mut()
            .filter_map(Option::take)
            .map(|entry| entry.allocation)
            .collect()
    }
}

/// Storages allocated when the buffer is created, in priority order (the
/// first becomes last-updated). GPU-writable storages are never allocated
/// up front.
pub fn initial_storage_classes(usage: BufferUsage) -> Vec<AccessClass> {
    let mut classes = Vec::with_capacity(2);
    if let Some(class) = primary_cpu_writable_class(usage) {
        classes.push(class);
    }
    if usage.contains(BufferUsage::CPU_READ) {
        classes.push(AccessClass::Staging);
    }
    classes
}

/// CPU-writable storage serving the buffer's main role, if CPU writes are requested.
pub fn primary_cpu_writable_class(usage: BufferUsage) -> Option<AccessClass> {
    if !usage.contains(BufferUsage::CPU_WRITE) {
        None
    } else if usage.contains(BufferUsage::CONSTANT) {
        Some(AccessClass::CpuWritableConstant)
    } else {
        Some(AccessClass::CpuWritableGeneral)
    }
}

/// GPU-writable storage receiving GPU-side writes.
///
/// Constant-only buffers without CPU writes use the constant class; a buffer
/// that already owns the CPU-writable constant storage takes GPU writes in
/// the general class so only one constant storage ever exists.
pub fn gpu_writable_class(usage: BufferUsage) -> AccessClass {
    if !usage.needs_general_storage() && !usage.contains(BufferUsage::CPU_WRITE) {
        AccessClass::GpuWritableConstant
    } else {
        AccessClass::GpuWritableGeneral
    }
}

/// Storage receiving device copies and updates.
///
/// Read-back buffers with no GPU binding role receive copies directly in
/// their staging storage.
pub fn copy_dst_class(usage: BufferUsage) -> AccessClass {
    let bindable = usage.intersects(BufferUsage::NON_CONSTANT_ROLES | BufferUsage::CONSTANT);
    if !bindable && usage.contains(BufferUsage::CPU_READ) {
        AccessClass::Staging
    } else {
        gpu_writable_class(usage)
    }
}

//! Software backend for headless testing of the buffer engine.
//!
//! [`MockBackend`] keeps every allocation in host memory and executes
//! recorded commands immediately, so tests can inspect storage contents at any
//! point. Serials only advance when a test says the GPU finished, which lets
//! tests exercise the busy-buffer paths deterministically.
//!
//! Calls a real device would reject (copies into dynamic storages, partial
//! constant updates without support, maps of the wrong class) fail with
//! [`GpuError::Validation`]; misuse through infallible calls is collected in
//! [`MockBackend::violations`].

use std::ptr::NonNull;

use hashbrown::HashMap;
use stratum_core::{is_aligned, ExecutionSerial};
use stratum_gpu::{
    AccessClass, AllocationDesc, AllocationFactory, AllocationId, DeviceCapabilities, GpuBackend,
    GpuError, MapType, MappedMemory, PredicateId, RecordingContext, Result, SerialTracker,
    UpdateHint,
};

/// Fill pattern of fresh allocations and discarded mappings.
pub const GARBAGE: u8 = 0xCD;

/// A command as the mock recorded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Update {
        dst: AllocationId,
        offset: u64,
        len: u64,
        hint: UpdateHint,
    },
    Copy {
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        dst_offset: u64,
        size: u64,
    },
    PredicatedUpdate {
        predicate: PredicateId,
        dst: AllocationId,
        offset: u64,
        len: u64,
    },
    Map {
        allocation: AllocationId,
        map_type: MapType,
    },
    Submit {
        serial: ExecutionSerial,
    },
}

#[derive(Debug)]
struct MockAllocation {
    label: String,
    access: AccessClass,
    data: Vec<u8>,
    mapped: Option<MapType>,
}

/// Host-memory backend with manual serial control.
#[derive(Debug)]
pub struct MockBackend {
    capabilities: DeviceCapabilities,
    zeroed_allocations: bool,
    allocations: HashMap<AllocationId, MockAllocation>,
    next_allocation: u64,
    predicates: HashMap<PredicateId, bool>,
    next_predicate: u64,
    last_submitted: ExecutionSerial,
    completed: ExecutionSerial,
    commands: Vec<Command>,
    waits: Vec<ExecutionSerial>,
    failing_allocations: usize,
    device_lost: bool,
    violations: Vec<String>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a backend with default capabilities.
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::default().device_name("Mock adapter"))
    }

    /// Create a backend with custom capabilities.
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            zeroed_allocations: false,
            allocations: HashMap::new(),
            next_allocation: 1,
            predicates: HashMap::new(),
            next_predicate: 1,
            last_submitted: ExecutionSerial::ZERO,
            completed: ExecutionSerial::ZERO,
            commands: Vec::new(),
            waits: Vec::new(),
            failing_allocations: 0,
            device_lost: false,
            violations: Vec::new(),
        }
    }

    /// Hand out zero-filled allocations instead of garbage.
    #[must_use]
    pub fn zeroed_allocations(mut self, zeroed: bool) -> Self {
        self.zeroed_allocations = zeroed;
        self
    }

    // ===== GPU PROGRESS =====

    /// Mark every submitted serial as completed.
    pub fn complete_all(&mut self) {
        self.completed = self.last_submitted;
    }

    /// Mark serials up to `serial` as completed.
    pub fn complete_up_to(&mut self, serial: ExecutionSerial) {
        self.completed = self.completed.max(serial.min(self.last_submitted));
    }

    /// Serials passed to `wait_for_serial`, in call order.
    pub fn waits(&self) -> &[ExecutionSerial] {
        &self.waits
    }

    // ===== FAULT INJECTION =====

    /// Make the next `count` allocations fail with out-of-memory.
    pub fn fail_next_allocations(&mut self, count: usize) {
        self.failing_allocations = count;
    }

    /// Simulate device removal: every later fallible call fails.
    pub fn lose_device(&mut self) {
        self.device_lost = true;
    }

    // ===== PREDICATES =====

    /// Create a predicate with a fixed outcome.
    pub fn create_predicate(&mut self, passes: bool) -> PredicateId {
        let id = PredicateId(self.next_predicate);
        self.next_predicate += 1;
        self.predicates.insert(id, passes);
        id
    }

    // ===== INSPECTION =====

    /// Simulate a shader writing `data` into an allocation.
    pub fn gpu_write(&mut self, allocation: AllocationId, offset: u64, data: &[u8]) -> Result<()> {
        let entry = self.allocation_mut(allocation)?;
        if !entry.access.is_gpu_writable() {
            return Err(GpuError::Validation(format!(
                "Shader write into {} storage '{}'",
                entry.access, entry.label
            )));
        }
        write_range(&mut entry.data, offset, data)
    }

    /// Contents of an allocation.
    pub fn allocation_bytes(&self, allocation: AllocationId) -> Option<&[u8]> {
        self.allocations
            .get(&allocation)
            .map(|entry| entry.data.as_slice())
    }

    /// Access class an allocation was created for.
    pub fn allocation_access(&self, allocation: AllocationId) -> Option<AccessClass> {
        self.allocations.get(&allocation).map(|entry| entry.access)
    }

    /// Number of allocations currently alive.
    pub fn live_allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Labels of the allocations currently alive.
    pub fn live_labels(&self) -> Vec<&str> {
        self.allocations
            .values()
            .map(|entry| entry.label.as_str())
            .collect()
    }

    /// Every command recorded so far.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Forget the recorded commands.
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Number of recorded device copies.
    pub fn copy_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Copy { .. }))
            .count()
    }

    /// Number of recorded inline updates.
    pub fn update_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Update { .. }))
            .count()
    }

    /// API misuse through calls that cannot report errors.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    fn check_alive(&self) -> Result<()> {
        if self.device_lost {
            return Err(GpuError::DeviceLost("mock device removed".to_string()));
        }
        Ok(())
    }

    fn allocation_mut(&mut self, allocation: AllocationId) -> Result<&mut MockAllocation> {
        self.allocations
            .get_mut(&allocation)
            .ok_or_else(|| GpuError::Validation(format!("Unknown allocation {}", allocation.0)))
    }

    fn allocation(&self, allocation: AllocationId) -> Result<&MockAllocation> {
        self.allocations
            .get(&allocation)
            .ok_or_else(|| GpuError::Validation(format!("Unknown allocation {}", allocation.0)))
    }
}

fn write_range(target: &mut [u8], offset: u64, data: &[u8]) -> Result<()> {
    let start = usize::try_from(offset).map_err(|_| out_of_range(offset, data.len()))?;
    let end = start
        .checked_add(data.len())
        .filter(|end| *end <= target.len())
        .ok_or_else(|| out_of_range(offset, data.len()))?;
    target[start..end].copy_from_slice(data);
    Ok(())
}

fn out_of_range(offset: u64, len: usize) -> GpuError {
    GpuError::Validation(format!("Range {offset}+{len} exceeds the allocation"))
}

/// Constant storages take whole updates, or partial ones when the device
/// supports them at its update granularity.
fn check_constant_update(
    capabilities: &DeviceCapabilities,
    entry: &MockAllocation,
    offset: u64,
    len: u64,
) -> Result<()> {
    if !entry.access.is_constant_buffer() || (offset == 0 && len == entry.data.len() as u64) {
        return Ok(());
    }
    let granularity = capabilities.constant_buffer_update_granularity;
    if capabilities.supports_partial_constant_buffer_update
        && is_aligned(offset, granularity)
        && is_aligned(len, granularity)
    {
        return Ok(());
    }
    Err(GpuError::Validation(format!(
        "Partial constant update {offset}+{len} of '{}'",
        entry.label
    )))
}

fn not_mapped(entry: &MockAllocation) -> Result<()> {
    match entry.mapped {
        None => Ok(()),
        Some(map_type) => Err(GpuError::Validation(format!(
            "'{}' is mapped ({map_type:?})",
            entry.label
        ))),
    }
}

impl AllocationFactory for MockBackend {
    fn create_allocation(&mut self, desc: &AllocationDesc<'_>) -> Result<AllocationId> {
        self.check_alive()?;
        if self.failing_allocations > 0 {
            self.failing_allocations -= 1;
            return Err(GpuError::OutOfMemory(format!(
                "mock allocation of {} bytes for '{}'",
                desc.size, desc.label
            )));
        }
        if !is_aligned(desc.size, desc.access.alignment()) {
            return Err(GpuError::Validation(format!(
                "'{}' size {} is not aligned for {}",
                desc.label, desc.size, desc.access
            )));
        }

        let fill = if self.zeroed_allocations { 0 } else { GARBAGE };
        let len = usize::try_from(desc.size)
            .map_err(|_| GpuError::OutOfMemory(format!("{} bytes", desc.size)))?;
        let id = AllocationId(self.next_allocation);
        self.next_allocation += 1;
        self.allocations.insert(
            id,
            MockAllocation {
                label: desc.label.to_string(),
                access: desc.access,
                data: vec![fill; len],
                mapped: None,
            },
        );
        Ok(id)
    }

    fn destroy_allocation(&mut self, allocation: AllocationId) {
        match self.allocations.remove(&allocation) {
            Some(entry) if entry.mapped.is_some() => self
                .violations
                .push(format!("'{}' destroyed while mapped", entry.label)),
            Some(_) => {}
            None => self
                .violations
                .push(format!("double destroy of allocation {}", allocation.0)),
        }
    }
}

impl RecordingContext for MockBackend {
    fn update_subresource(
        &mut self,
        dst: AllocationId,
        offset: u64,
        data: &[u8],
        hint: UpdateHint,
    ) -> Result<()> {
        self.check_alive()?;
        let capabilities = self.capabilities.clone();
        let entry = self.allocation_mut(dst)?;
        not_mapped(entry)?;

        if !entry.access.supports_device_update() {
            return Err(GpuError::Validation(format!(
                "Inline update of {} storage '{}'",
                entry.access, entry.label
            )));
        }
        let len = data.len() as u64;
        check_constant_update(&capabilities, entry, offset, len)?;
        if len > capabilities.max_inline_update_size {
            return Err(GpuError::Validation(format!(
                "Inline update of {len} bytes exceeds the device limit"
            )));
        }

        write_range(&mut entry.data, offset, data)?;
        self.commands.push(Command::Update {
            dst,
            offset,
            len,
            hint,
        });
        Ok(())
    }

    fn copy_region(
        &mut self,
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_alive()?;
        if src == dst {
            return Err(GpuError::Validation("Copy within one allocation".to_string()));
        }

        let source = self.allocation(src)?;
        not_mapped(source)?;
        let start = usize::try_from(src_offset).map_err(|_| out_of_range(src_offset, 0))?;
        let len = usize::try_from(size).map_err(|_| out_of_range(src_offset, 0))?;
        let bytes = source
            .data
            .get(start..start.saturating_add(len))
            .ok_or_else(|| out_of_range(src_offset, len))?
            .to_vec();

        let target = self.allocation_mut(dst)?;
        not_mapped(target)?;
        if !target.access.supports_device_copy_dst() {
            return Err(GpuError::Validation(format!(
                "Copy into {} storage '{}'",
                target.access, target.label
            )));
        }
        write_range(&mut target.data, dst_offset, &bytes)?;

        self.commands.push(Command::Copy {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    fn map(&mut self, allocation: AllocationId, map_type: MapType) -> Result<MappedMemory> {
        self.check_alive()?;
        let entry = self.allocation_mut(allocation)?;
        not_mapped(entry)?;

        let allowed = if map_type.reads() {
            entry.access.is_cpu_readable()
        } else {
            entry.access.is_cpu_writable()
        };
        if !allowed {
            return Err(GpuError::Validation(format!(
                "{map_type:?} map of {} storage '{}'",
                entry.access, entry.label
            )));
        }

        if map_type == MapType::WriteDiscard {
            entry.data.fill(GARBAGE);
        }
        entry.mapped = Some(map_type);
        let ptr = NonNull::new(entry.data.as_mut_ptr())
            .ok_or_else(|| GpuError::Backend("empty allocation".to_string()))?;
        // SAFETY: the allocation's heap buffer is never resized, and it is
        // only freed by `destroy_allocation`, which the engine calls after
        // `unmap`.
        let memory = unsafe { MappedMemory::new(ptr, entry.data.len()) };

        self.commands.push(Command::Map {
            allocation,
            map_type,
        });
        Ok(memory)
    }

    fn unmap(&mut self, allocation: AllocationId) {
        match self.allocations.get_mut(&allocation) {
            Some(entry) if entry.mapped.is_some() => entry.mapped = None,
            Some(entry) => self
                .violations
                .push(format!("unmap of unmapped '{}'", entry.label)),
            None => self
                .violations
                .push(format!("unmap of unknown allocation {}", allocation.0)),
        }
    }

    fn update_predicated(
        &mut self,
        predicate: PredicateId,
        dst: AllocationId,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.check_alive()?;
        let passes = *self
            .predicates
            .get(&predicate)
            .ok_or_else(|| GpuError::Validation(format!("Unknown predicate {}", predicate.0)))?;

        let capabilities = self.capabilities.clone();
        let entry = self.allocation_mut(dst)?;
        not_mapped(entry)?;
        if !entry.access.is_gpu_writable() {
            return Err(GpuError::Validation(format!(
                "Predicated update of {} storage '{}'",
                entry.access, entry.label
            )));
        }
        check_constant_update(&capabilities, entry, offset, data.len() as u64)?;
        if passes {
            write_range(&mut entry.data, offset, data)?;
        }

        self.commands.push(Command::PredicatedUpdate {
            predicate,
            dst,
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn submit(&mut self) -> Result<ExecutionSerial> {
        self.check_alive()?;
        self.last_submitted = self.last_submitted.next();
        self.commands.push(Command::Submit {
            serial: self.last_submitted,
        });
        Ok(self.last_submitted)
    }
}

impl SerialTracker for MockBackend {
    fn last_submitted_serial(&self) -> ExecutionSerial {
        self.last_submitted
    }

    fn completed_serial(&mut self) -> Result<ExecutionSerial> {
        self.check_alive()?;
        Ok(self.completed)
    }

    fn wait_for_serial(&mut self, serial: ExecutionSerial) -> Result<()> {
        self.check_alive()?;
        if serial > self.last_submitted {
            return Err(GpuError::InvalidState(format!(
                "Waiting for unsubmitted serial {serial}"
            )));
        }
        self.waits.push(serial);
        self.completed = self.completed.max(serial);
        Ok(())
    }
}

impl GpuBackend for MockBackend {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }
}

//! End-to-end behavior of the buffer engine against the mock backend.

use std::sync::Arc;
use std::thread;

use stratum_core::{BindingRole, BufferUsage, ExecutionSerial, MapMode};
use stratum_gpu::{
    AccessClass, BufferManagerBuilder, DeviceCapabilities, GpuError, MapState, MapStatus,
    SerialTracker, SyncOutcome, UpdateHint,
};

use crate::{
    check_buffer_invariants, create, init_test_logging, logical_contents, mock_manager,
    read_back, storage_contents, Command, MockBackend,
};

fn manager_with(capabilities: DeviceCapabilities) -> stratum_gpu::BufferManager<MockBackend> {
    BufferManagerBuilder::new()
        .build(MockBackend::with_capabilities(capabilities))
        .unwrap()
}

fn readback_buffer(
    manager: &mut stratum_gpu::BufferManager<MockBackend>,
    size: u64,
) -> stratum_gpu::BufferId {
    create(manager, size, BufferUsage::CPU_READ | BufferUsage::COPY_DST).unwrap()
}

// ===== SCENARIOS =====

#[test]
fn constant_write_reaches_readback_with_padding() {
    init_test_logging();
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE
        | BufferUsage::CONSTANT
        | BufferUsage::STORAGE_WRITE
        | BufferUsage::COPY_SRC;
    let uniforms = create(&mut manager, 4, usage).unwrap();
    assert_eq!(manager.buffer(uniforms).unwrap().allocated_size(), 16);

    manager.write(uniforms, 0, &[1, 2, 3, 4]).unwrap();
    manager.bind_as(uniforms, BindingRole::Constant).unwrap();

    let mut expected = vec![1, 2, 3, 4];
    expected.resize(16, 0);
    assert_eq!(
        storage_contents(&manager, uniforms, AccessClass::CpuWritableConstant).unwrap(),
        expected
    );

    let readback = readback_buffer(&mut manager, 4);
    manager
        .copy_buffer_to_buffer(uniforms, 0, readback, 0, 4)
        .unwrap();
    assert_eq!(read_back(&mut manager, readback).unwrap(), vec![1, 2, 3, 4]);

    check_buffer_invariants(manager.buffer(uniforms).unwrap()).unwrap();
    check_buffer_invariants(manager.buffer(readback).unwrap()).unwrap();
    assert!(manager.backend().violations().is_empty());
}

#[test]
fn cpu_write_then_read_map() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 64, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();
    let data: Vec<u8> = (0..64).collect();

    manager.write(id, 0, &data).unwrap();
    {
        let session = manager.map_for_read(id).unwrap().unwrap();
        assert!(session.owns_mapping());
        assert_eq!(session.bytes(), data.as_slice());
    }

    assert_eq!(manager.buffer(id).unwrap().map_state(), MapState::Unmapped);
    check_buffer_invariants(manager.buffer(id).unwrap()).unwrap();
    assert!(manager.backend().violations().is_empty());
}

#[test]
fn gpu_clear_copied_to_readback() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::STORAGE_WRITE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
    let id = create(&mut manager, 32, usage).unwrap();
    assert!(manager.buffer(id).unwrap().storages().is_empty());

    manager.clear(id, 0, 32, 7).unwrap();
    let buffer = manager.buffer(id).unwrap();
    assert_eq!(
        buffer.storages().last_updated(),
        Some(AccessClass::GpuWritableGeneral)
    );

    let readback = readback_buffer(&mut manager, 32);
    manager.copy_buffer_to_buffer(id, 0, readback, 0, 32).unwrap();
    assert_eq!(read_back(&mut manager, readback).unwrap(), vec![7; 32]);
}

#[test]
fn predicated_clear_with_false_predicate() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE | BufferUsage::CPU_READ | BufferUsage::STORAGE_WRITE;
    let id = create(&mut manager, 16, usage).unwrap();
    manager.write(id, 0, &[5; 16]).unwrap();
    let before = manager.buffer(id).unwrap().storages().latest_revision();

    let predicate = manager.backend_mut().create_predicate(false);
    manager.predicated_clear(id, predicate, 0, 16, 9).unwrap();

    let buffer = manager.buffer(id).unwrap();
    assert!(buffer.storages().latest_revision() > before);
    assert_eq!(
        buffer.storages().last_updated(),
        Some(AccessClass::GpuWritableGeneral)
    );
    assert!(manager.is_sync_pending(id));

    assert_eq!(read_back(&mut manager, id).unwrap(), vec![5; 16]);
    check_buffer_invariants(manager.buffer(id).unwrap()).unwrap();
}

#[test]
fn predicated_clear_with_true_predicate() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE | BufferUsage::CPU_READ | BufferUsage::STORAGE_WRITE;
    let id = create(&mut manager, 16, usage).unwrap();
    manager.write(id, 0, &[5; 16]).unwrap();

    let predicate = manager.backend_mut().create_predicate(true);
    manager.predicated_clear(id, predicate, 4, 8, 9).unwrap();

    assert_eq!(
        read_back(&mut manager, id).unwrap(),
        vec![5, 5, 5, 5, 9, 9, 9, 9, 9, 9, 9, 9, 5, 5, 5, 5]
    );
}

#[test]
fn predicated_clear_of_constant_buffer_keeps_constant_updates_whole() {
    let mut manager =
        manager_with(DeviceCapabilities::default().partial_constant_buffer_update(false));
    let id = create(&mut manager, 32, BufferUsage::CONSTANT | BufferUsage::COPY_DST).unwrap();
    manager.write(id, 0, &[1; 32]).unwrap();

    let predicate = manager.backend_mut().create_predicate(true);
    manager.predicated_clear(id, predicate, 4, 4, 9).unwrap();
    assert_eq!(
        manager.buffer(id).unwrap().storages().last_updated(),
        Some(AccessClass::GpuWritableGeneral)
    );

    let cb = manager.bind_as(id, BindingRole::Constant).unwrap();
    assert_eq!(
        manager.backend().allocation_access(cb),
        Some(AccessClass::GpuWritableConstant)
    );
    let mut expected = vec![1; 4];
    expected.extend([9; 4]);
    expected.extend([1; 24]);
    assert_eq!(
        storage_contents(&manager, id, AccessClass::GpuWritableConstant).unwrap(),
        expected
    );
    assert!(manager.backend().violations().is_empty());
    check_buffer_invariants(manager.buffer(id).unwrap()).unwrap();
}

#[test]
fn disjoint_device_writes_preserve_other_bytes() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::STORAGE_READ | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
    let id = create(&mut manager, 16, usage).unwrap();

    manager.write(id, 0, &[1; 4]).unwrap();
    manager.write(id, 8, &[2; 4]).unwrap();

    assert_eq!(
        logical_contents(&manager, id).unwrap(),
        vec![1, 1, 1, 1, 0, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0]
    );
    assert!(manager.backend().commands().iter().any(|command| matches!(
        command,
        Command::Update {
            offset: 8,
            len: 4,
            hint: UpdateHint::Preserve,
            ..
        }
    )));
}

#[test]
fn disjoint_cpu_writes_preserve_other_bytes() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();

    manager.write(id, 0, &[1; 4]).unwrap();
    manager.write(id, 8, &[2; 4]).unwrap();

    assert_eq!(
        read_back(&mut manager, id).unwrap(),
        vec![1, 1, 1, 1, 0, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0]
    );
}

#[test]
fn gpu_write_is_staged_before_map() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE | BufferUsage::CPU_READ | BufferUsage::STORAGE_WRITE;
    let id = create(&mut manager, 16, usage).unwrap();

    let uav = manager.bind_as(id, BindingRole::UnorderedAccess).unwrap();
    assert_eq!(
        manager.backend().allocation_access(uav),
        Some(AccessClass::GpuWritableGeneral)
    );
    manager.backend_mut().gpu_write(uav, 0, &[42; 16]).unwrap();

    manager.submit().unwrap();
    assert_eq!(manager.pending_sync_count(), 0);
    manager.backend_mut().complete_all();

    let copies = manager.backend().copy_count();
    assert_eq!(read_back(&mut manager, id).unwrap(), vec![42; 16]);
    assert!(manager.backend().waits().is_empty());
    assert_eq!(manager.backend().copy_count(), copies);
}

// ===== WRITE PATHS =====

#[test]
fn busy_cpu_storage_falls_back_to_device_update() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE | BufferUsage::VERTEX | BufferUsage::COPY_SRC;
    let id = create(&mut manager, 16, usage).unwrap();

    manager.write(id, 0, &[1; 16]).unwrap();
    let first = manager.bind_as(id, BindingRole::ShaderResource).unwrap();
    assert_eq!(
        manager.backend().allocation_access(first),
        Some(AccessClass::CpuWritableGeneral)
    );

    // The vertex fetch has not completed yet
    manager.write(id, 0, &[2; 16]).unwrap();
    let buffer = manager.buffer(id).unwrap();
    assert_eq!(
        buffer.storages().last_updated(),
        Some(AccessClass::GpuWritableGeneral)
    );
    assert!(!buffer.storages().is_current(AccessClass::CpuWritableGeneral));

    let second = manager.bind_as(id, BindingRole::ShaderResource).unwrap();
    assert_ne!(first, second);
    assert_eq!(logical_contents(&manager, id).unwrap(), vec![2; 16]);
}

#[test]
fn stale_cpu_storage_is_refreshed_through_staging() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE | BufferUsage::STORAGE_WRITE;
    let id = create(&mut manager, 16, usage).unwrap();

    let uav = manager.bind_as(id, BindingRole::UnorderedAccess).unwrap();
    manager.backend_mut().gpu_write(uav, 0, &[42; 16]).unwrap();
    manager.submit().unwrap();
    manager.backend_mut().complete_all();

    // Partial write on the idle CPU storage needs the GPU-written bytes first
    manager.write(id, 0, &[1; 4]).unwrap();

    let buffer = manager.buffer(id).unwrap();
    assert!(buffer.storages().contains(AccessClass::Staging));
    assert_eq!(
        buffer.storages().last_updated(),
        Some(AccessClass::CpuWritableGeneral)
    );
    let mut expected = vec![1; 4];
    expected.extend([42; 12]);
    assert_eq!(logical_contents(&manager, id).unwrap(), expected);
}

#[test]
fn partial_constant_update_without_support_bounces_through_staging() {
    let mut manager = manager_with(DeviceCapabilities::default().partial_constant_buffer_update(false));
    let id = create(&mut manager, 32, BufferUsage::CONSTANT | BufferUsage::COPY_DST).unwrap();

    manager.write(id, 0, &[1; 32]).unwrap();
    let allocations = manager.backend().live_allocation_count();
    manager.backend_mut().clear_commands();

    manager.write(id, 16, &[2; 16]).unwrap();

    assert_eq!(manager.backend().copy_count(), 1);
    assert_eq!(manager.backend().update_count(), 0);
    assert_eq!(manager.backend().live_allocation_count(), allocations);

    let mut expected = vec![1; 16];
    expected.extend([2; 16]);
    assert_eq!(
        storage_contents(&manager, id, AccessClass::GpuWritableConstant).unwrap(),
        expected
    );
}

#[test]
fn aligned_partial_constant_update_is_inline() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 32, BufferUsage::CONSTANT | BufferUsage::COPY_DST).unwrap();

    manager.write(id, 0, &[1; 32]).unwrap();
    manager.backend_mut().clear_commands();
    manager.write(id, 16, &[2; 16]).unwrap();
    assert_eq!(manager.backend().copy_count(), 0);
    assert_eq!(manager.backend().update_count(), 1);

    // Off-granularity writes still need the bounce
    manager.write(id, 4, &[3; 4]).unwrap();
    assert_eq!(manager.backend().copy_count(), 1);

    let mut expected = vec![1; 4];
    expected.extend([3; 4]);
    expected.extend([1; 8]);
    expected.extend([2; 16]);
    assert_eq!(logical_contents(&manager, id).unwrap(), expected);
}

#[test]
fn full_constant_write_is_padded_and_discards() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 20, BufferUsage::CONSTANT | BufferUsage::COPY_DST).unwrap();

    manager.write(id, 0, &[6; 20]).unwrap();

    assert!(manager.backend().commands().iter().any(|command| matches!(
        command,
        Command::Update {
            offset: 0,
            len: 32,
            hint: UpdateHint::Discard,
            ..
        }
    )));
    let mut expected = vec![6; 20];
    expected.resize(32, 0);
    assert_eq!(
        storage_contents(&manager, id, AccessClass::GpuWritableConstant).unwrap(),
        expected
    );
}

#[test]
fn oversized_updates_use_staging_upload() {
    let mut manager = manager_with(DeviceCapabilities::default().max_inline_update_size(16));
    let usage = BufferUsage::STORAGE_READ | BufferUsage::COPY_DST;
    let id = create(&mut manager, 64, usage).unwrap();

    manager.write(id, 0, &[8; 64]).unwrap();

    assert_eq!(manager.backend().update_count(), 0);
    assert_eq!(logical_contents(&manager, id).unwrap(), vec![8; 64]);
    assert!(manager.backend().violations().is_empty());
}

#[test]
fn typed_writes() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();

    let values = [1u32, 2, 3, 4];
    manager.write_typed(id, 0, &values).unwrap();

    let expected: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    assert_eq!(read_back(&mut manager, id).unwrap(), expected);
}

#[test]
fn lazy_zero_init_hides_garbage() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_READ | BufferUsage::COPY_DST).unwrap();

    assert_eq!(read_back(&mut manager, id).unwrap(), vec![0; 16]);
}

#[test]
fn disabled_zero_init_trusts_the_factory() {
    let mut manager = BufferManagerBuilder::new()
        .lazy_zero_init(false)
        .build(MockBackend::new().zeroed_allocations(true))
        .unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_READ | BufferUsage::COPY_DST).unwrap();

    assert_eq!(read_back(&mut manager, id).unwrap(), vec![0; 16]);
    assert_eq!(manager.backend().update_count(), 0);
}

// ===== SYNC =====

#[test]
fn sync_is_idempotent() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();
    manager.write(id, 0, &[3; 16]).unwrap();

    let copies = manager.backend().copy_count();
    assert_eq!(
        manager.sync_storage(id, AccessClass::Staging).unwrap(),
        SyncOutcome::DeviceCopy
    );
    let commands = manager.backend().commands().len();
    assert_eq!(
        manager.sync_storage(id, AccessClass::Staging).unwrap(),
        SyncOutcome::AlreadyCurrent
    );

    assert_eq!(manager.backend().copy_count(), copies + 1);
    assert_eq!(manager.backend().commands().len(), commands);
    assert!(manager
        .buffer(id)
        .unwrap()
        .storages()
        .is_current(AccessClass::Staging));
}

#[test]
fn deferred_queue_deduplicates_and_skips_destroyed_buffers() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_READ | BufferUsage::STORAGE_WRITE;
    let a = create(&mut manager, 16, usage).unwrap();
    let b = create(&mut manager, 16, usage).unwrap();

    manager.bind_as(a, BindingRole::UnorderedAccess).unwrap();
    manager.bind_as(b, BindingRole::UnorderedAccess).unwrap();
    manager.bind_as(a, BindingRole::UnorderedAccess).unwrap();
    assert_eq!(manager.pending_sync_count(), 2);

    manager.destroy_buffer(b).unwrap();
    assert_eq!(manager.pending_sync_count(), 1);

    assert_eq!(manager.on_submission_flush().unwrap(), 1);
    assert_eq!(manager.pending_sync_count(), 0);
    assert!(manager
        .buffer(a)
        .unwrap()
        .storages()
        .is_current(AccessClass::Staging));
}

#[test]
fn failed_flush_keeps_buffers_queued() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_READ | BufferUsage::STORAGE_WRITE;
    let a = create(&mut manager, 16, usage).unwrap();
    let b = create(&mut manager, 16, usage).unwrap();
    manager.bind_as(a, BindingRole::UnorderedAccess).unwrap();
    manager.bind_as(b, BindingRole::UnorderedAccess).unwrap();
    assert_eq!(manager.pending_sync_count(), 2);

    manager.backend_mut().lose_device();
    assert!(manager.on_submission_flush().unwrap_err().is_fatal());
    assert_eq!(manager.pending_sync_count(), 2);
    assert!(manager.is_sync_pending(a));
    assert!(manager.is_sync_pending(b));
}

#[test]
fn write_map_release_queues_staging_refresh() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 8, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();

    {
        let mut session = manager.map_for_write(id).unwrap().unwrap();
        session.bytes_mut().unwrap().copy_from_slice(&[4; 8]);
    }
    assert!(manager.is_sync_pending(id));

    manager.submit().unwrap();
    assert!(manager
        .buffer(id)
        .unwrap()
        .storages()
        .is_current(AccessClass::Staging));
    assert_eq!(read_back(&mut manager, id).unwrap(), vec![4; 8]);
}

// ===== MAPPING =====

#[test]
fn read_map_revision_rule_without_read_only_map() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();
    manager.write(id, 0, &[1; 16]).unwrap();

    assert_eq!(manager.map_async(id, MapMode::Read).unwrap(), MapStatus::Mapped);
    let before = manager.buffer(id).unwrap().storages().latest_revision();
    manager.unmap(id).unwrap();

    let storages = manager.buffer(id).unwrap().storages();
    assert_eq!(storages.latest_revision(), before + 1);
    assert_eq!(storages.last_updated(), Some(AccessClass::Staging));
}

#[test]
fn read_map_revision_rule_with_read_only_map() {
    let mut manager = manager_with(DeviceCapabilities::default().read_only_map(true));
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();
    manager.write(id, 0, &[1; 16]).unwrap();

    manager.map_async(id, MapMode::Read).unwrap();
    let before = manager.buffer(id).unwrap().storages().latest_revision();
    manager.unmap(id).unwrap();

    let storages = manager.buffer(id).unwrap().storages();
    assert_eq!(storages.latest_revision(), before);
    assert_eq!(storages.last_updated(), Some(AccessClass::CpuWritableGeneral));
    assert!(manager.backend().commands().iter().any(|command| matches!(
        command,
        Command::Map {
            map_type: stratum_gpu::MapType::Read,
            ..
        }
    )));
}

#[test]
fn map_request_waits_for_its_serial() {
    let mut manager = mock_manager().unwrap();
    let src = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::COPY_SRC).unwrap();
    let dst = readback_buffer(&mut manager, 16);
    manager.write(src, 0, &[9; 16]).unwrap();
    manager.copy_buffer_to_buffer(src, 0, dst, 0, 16).unwrap();

    assert_eq!(manager.map_async(dst, MapMode::Read).unwrap(), MapStatus::Pending);
    assert!(matches!(
        manager.buffer(dst).unwrap().map_state(),
        MapState::MapRequested { .. }
    ));
    assert!(manager.poll_map_requests().unwrap().is_empty());
    assert!(manager.mapped_range(dst).is_err());

    let serial = manager.submit().unwrap();
    assert!(manager.poll_map_requests().unwrap().is_empty());

    manager.backend_mut().complete_up_to(serial);
    assert_eq!(manager.poll_map_requests().unwrap(), vec![dst]);
    assert_eq!(manager.mapped_range(dst).unwrap(), &[9; 16]);
    manager.unmap(dst).unwrap();
    assert_eq!(manager.pending_map_count(), 0);
}

#[test]
fn unmap_cancels_pending_request() {
    let mut manager = mock_manager().unwrap();
    let src = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::COPY_SRC).unwrap();
    let dst = readback_buffer(&mut manager, 16);
    manager.write(src, 0, &[9; 16]).unwrap();
    manager.copy_buffer_to_buffer(src, 0, dst, 0, 16).unwrap();

    manager.map_async(dst, MapMode::Read).unwrap();
    manager.unmap(dst).unwrap();

    assert_eq!(manager.buffer(dst).unwrap().map_state(), MapState::Unmapped);
    assert_eq!(manager.pending_map_count(), 0);
}

#[test]
fn scoped_map_submits_and_waits() {
    let mut manager = mock_manager().unwrap();
    let src = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::COPY_SRC).unwrap();
    let dst = readback_buffer(&mut manager, 16);
    manager.write(src, 0, &[9; 16]).unwrap();
    manager.copy_buffer_to_buffer(src, 0, dst, 0, 16).unwrap();

    assert_eq!(read_back(&mut manager, dst).unwrap(), vec![9; 16]);
    assert_eq!(manager.backend().last_submitted_serial(), ExecutionSerial(1));
    assert_eq!(manager.backend().waits(), &[ExecutionSerial(1)]);
}

#[test]
fn scoped_map_borrows_existing_mapping() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();
    manager.write(id, 0, &[2; 16]).unwrap();
    manager.map_async(id, MapMode::Read).unwrap();

    {
        let session = manager.map_for_read(id).unwrap().unwrap();
        assert!(!session.owns_mapping());
        assert_eq!(session.bytes(), &[2; 16]);
    }
    assert!(matches!(
        manager.buffer(id).unwrap().map_state(),
        MapState::Mapped { .. }
    ));
    assert!(manager.map_for_write(id).is_err());
    manager.unmap(id).unwrap();
}

#[test]
fn unsupported_scoped_map_returns_none() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::STORAGE_READ | BufferUsage::COPY_DST).unwrap();

    assert!(manager.map_for_read(id).unwrap().is_none());
    assert!(manager.map_for_write(id).unwrap().is_none());
}

#[test]
fn read_session_rejects_writes() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();

    let mut session = manager.map_for_read(id).unwrap().unwrap();
    assert!(session.bytes_mut().is_err());
    session.unmap().unwrap();
}

// ===== ERRORS =====

#[test]
fn allocation_failure_leaves_buffer_usable() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE | BufferUsage::CPU_READ | BufferUsage::STORAGE_WRITE;
    let id = create(&mut manager, 16, usage).unwrap();
    manager.write(id, 0, &[3; 16]).unwrap();

    manager.backend_mut().fail_next_allocations(1);
    let err = manager.bind_as(id, BindingRole::UnorderedAccess).unwrap_err();
    assert!(matches!(err, GpuError::OutOfMemory(_)));
    assert!(!err.is_fatal());

    check_buffer_invariants(manager.buffer(id).unwrap()).unwrap();
    assert_eq!(read_back(&mut manager, id).unwrap(), vec![3; 16]);
    manager.bind_as(id, BindingRole::UnorderedAccess).unwrap();
}

#[test]
fn failed_whole_write_leaves_buffer_zeroed() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::STORAGE_READ | BufferUsage::COPY_DST | BufferUsage::CPU_READ;
    let id = create(&mut manager, 16, usage).unwrap();

    manager.backend_mut().fail_next_allocations(1);
    let err = manager.write(id, 0, &[1; 16]).unwrap_err();
    assert!(matches!(err, GpuError::OutOfMemory(_)));
    assert!(!manager.buffer(id).unwrap().is_data_initialized());

    assert_eq!(read_back(&mut manager, id).unwrap(), vec![0; 16]);
    assert!(manager.buffer(id).unwrap().is_data_initialized());
}

#[test]
fn failed_whole_copy_leaves_buffer_zeroed() {
    let mut manager = mock_manager().unwrap();
    let source_usage = BufferUsage::STORAGE_READ | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
    let source = create(&mut manager, 16, source_usage).unwrap();
    manager.write(source, 0, &[4; 16]).unwrap();
    let usage = BufferUsage::STORAGE_READ | BufferUsage::COPY_DST | BufferUsage::CPU_READ;
    let id = create(&mut manager, 16, usage).unwrap();

    manager.backend_mut().fail_next_allocations(1);
    let err = manager.copy_buffer_to_buffer(source, 0, id, 0, 16).unwrap_err();
    assert!(matches!(err, GpuError::OutOfMemory(_)));
    assert!(!manager.buffer(id).unwrap().is_data_initialized());

    assert_eq!(read_back(&mut manager, id).unwrap(), vec![0; 16]);
}

#[test]
fn allocation_failure_at_creation_releases_everything() {
    let mut manager = mock_manager().unwrap();
    manager.backend_mut().fail_next_allocations(1);

    let err = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ);
    assert!(err.is_err());
    assert_eq!(manager.buffer_count(), 0);
    assert_eq!(manager.backend().live_allocation_count(), 0);
}

#[test]
fn device_loss_is_fatal() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();
    manager.backend_mut().lose_device();

    assert!(manager.write(id, 0, &[1; 16]).unwrap_err().is_fatal());
    assert!(manager.submit().unwrap_err().is_fatal());
    assert!(matches!(
        manager.map_for_read(id),
        Err(GpuError::DeviceLost(_))
    ));
}

#[test]
fn contract_violations_are_rejected() {
    let mut manager = mock_manager().unwrap();
    let usage = BufferUsage::CPU_WRITE | BufferUsage::CPU_READ | BufferUsage::COPY_SRC;
    let id = create(&mut manager, 16, usage).unwrap();
    let other = create(&mut manager, 16, BufferUsage::STORAGE_READ).unwrap();
    let commands = manager.backend().commands().len();

    let is_validation = |result: Result<(), GpuError>| matches!(result, Err(GpuError::Validation(_)));
    assert!(is_validation(manager.write(id, 0, &[])));
    assert!(is_validation(manager.write(id, 2, &[0; 4])));
    assert!(is_validation(manager.write(id, 0, &[0; 6])));
    assert!(is_validation(manager.write(id, 12, &[0; 8])));
    assert!(is_validation(manager.write(other, 0, &[0; 4])));
    assert!(is_validation(manager.clear(id, 0, 0, 1)));
    assert!(is_validation(manager.copy_buffer_to_buffer(id, 0, id, 0, 4)));
    assert!(is_validation(manager.copy_buffer_to_buffer(id, 0, other, 0, 4)));
    assert!(is_validation(manager.unmap(id)));
    assert!(is_validation(manager.destroy_buffer(stratum_gpu::BufferId(99))));
    assert!(matches!(
        manager.bind_as(id, BindingRole::Constant),
        Err(GpuError::Validation(_))
    ));
    assert!(matches!(
        manager.map_async(other, MapMode::Read),
        Err(GpuError::Validation(_))
    ));

    manager.map_async(id, MapMode::Read).unwrap();
    assert!(is_validation(manager.write(id, 0, &[0; 4])));
    assert!(matches!(
        manager.map_async(id, MapMode::Read),
        Err(GpuError::Validation(_))
    ));
    manager.unmap(id).unwrap();

    let predicate = manager.backend_mut().create_predicate(true);
    assert!(is_validation(manager.predicated_clear(id, predicate, 0, 16, 0)));

    // Only the read map touched the device
    assert!(manager.backend().commands()[commands..]
        .iter()
        .all(|command| matches!(command, Command::Map { .. } | Command::Copy { .. } | Command::Update { .. })));
    assert!(manager.backend().violations().is_empty());
}

#[test]
fn zero_size_copy_is_a_no_op() {
    let mut manager = mock_manager().unwrap();
    let src = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::COPY_SRC).unwrap();
    let dst = readback_buffer(&mut manager, 16);
    let commands = manager.backend().commands().len();

    manager.copy_buffer_to_buffer(src, 0, dst, 0, 0).unwrap();
    assert_eq!(manager.backend().commands().len(), commands);
}

#[test]
fn destroying_mapped_buffer_releases_storages() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();
    manager.map_async(id, MapMode::Write).unwrap();

    manager.destroy_buffer(id).unwrap();
    assert_eq!(manager.backend().live_allocation_count(), 0);
    assert!(manager.backend().violations().is_empty());
}

#[test]
fn labels_carry_prefix_and_class() {
    let mut manager = mock_manager().unwrap();
    let id = create(&mut manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ).unwrap();

    let label = manager.buffer(id).unwrap().label().to_string();
    assert!(label.starts_with("test:"));
    let labels = manager.backend().live_labels();
    assert!(labels.contains(&format!("{label}/cpu-general").as_str()));
    assert!(labels.contains(&format!("{label}/staging").as_str()));
}

// ===== SHARING =====

#[test]
fn shared_manager_across_threads() {
    let shared = mock_manager().unwrap().into_shared();

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut guard = shared.lock();
                let manager = &mut *guard;
                let id = create(manager, 16, BufferUsage::CPU_WRITE | BufferUsage::CPU_READ)
                    .unwrap();
                manager.write(id, 0, &[i; 16]).unwrap();
                assert_eq!(read_back(manager, id).unwrap(), vec![i; 16]);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(shared.lock().buffer_count(), 4);
}

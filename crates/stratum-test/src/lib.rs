//! Test harness for the Stratum buffer engine.
//!
//! Provides a host-memory backend and helpers for checking buffer state
//! without a GPU.

pub mod harness;

#[cfg(test)]
mod scenarios;

pub use harness::{Command, MockBackend, GARBAGE};

use stratum_core::BufferUsage;
use stratum_gpu::{
    AccessClass, BufferDescriptor, BufferId, BufferManager, BufferManagerBuilder, GpuBackend,
    GpuError, LogicalBuffer,
};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Install a test-friendly subscriber. Filter with `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Build a manager over a fresh [`MockBackend`].
pub fn mock_manager() -> Result<BufferManager<MockBackend>> {
    Ok(BufferManagerBuilder::new()
        .label_prefix("test:")
        .build(MockBackend::new())?)
}

/// Create a buffer with a generated label.
pub fn create<B: GpuBackend>(
    manager: &mut BufferManager<B>,
    size: u64,
    usage: BufferUsage,
) -> Result<BufferId> {
    let label = format!("buffer-{}", manager.buffer_count());
    Ok(manager.create_buffer(&BufferDescriptor::new(label, size, usage))?)
}

/// Check the storage table invariants of a buffer.
pub fn check_buffer_invariants(buffer: &LogicalBuffer) -> Result<()> {
    let storages = buffer.storages();
    let violated = |what: String| Err(TestError::InvariantViolated(format!("{}: {what}", buffer.id())));

    if storages.is_empty() {
        return Ok(());
    }
    let Some(last) = storages.last_updated() else {
        return violated("storages exist but none is last-updated".to_string());
    };
    if !storages.is_current(last) {
        return violated(format!("last-updated {last} is not current"));
    }

    let latest = storages.latest_revision();
    for entry in storages.iter() {
        if entry.revision() > latest {
            return violated(format!("{} is ahead of the latest revision", entry.access_class()));
        }
    }

    if storages.contains(AccessClass::CpuWritableConstant)
        && storages.contains(AccessClass::GpuWritableConstant)
    {
        return violated("both constant storages exist".to_string());
    }
    Ok(())
}

/// Contents of the last-updated storage, without touching the engine.
pub fn logical_contents(manager: &BufferManager<MockBackend>, id: BufferId) -> Result<Vec<u8>> {
    let buffer = manager
        .buffer(id)
        .ok_or_else(|| TestError::InvariantViolated(format!("unknown {id}")))?;
    let class = buffer
        .storages()
        .last_updated()
        .ok_or_else(|| TestError::InvariantViolated(format!("{id} has no storage")))?;
    let allocation = buffer
        .storages()
        .allocation_id(class)
        .ok_or_else(|| TestError::InvariantViolated(format!("{id} lost its {class} storage")))?;
    let bytes = manager
        .backend()
        .allocation_bytes(allocation)
        .ok_or_else(|| TestError::InvariantViolated(format!("{class} allocation of {id} is gone")))?;

    let len = usize::try_from(buffer.size()).unwrap_or(usize::MAX).min(bytes.len());
    Ok(bytes[..len].to_vec())
}

/// Contents of one storage, without touching the engine.
pub fn storage_contents(
    manager: &BufferManager<MockBackend>,
    id: BufferId,
    class: AccessClass,
) -> Option<Vec<u8>> {
    let allocation = manager.buffer(id)?.storages().allocation_id(class)?;
    manager
        .backend()
        .allocation_bytes(allocation)
        .map(<[u8]>::to_vec)
}

/// Read a buffer back through a blocking read map.
pub fn read_back<B: GpuBackend>(manager: &mut BufferManager<B>, id: BufferId) -> Result<Vec<u8>> {
    let session = manager
        .map_for_read(id)?
        .ok_or_else(|| TestError::InvariantViolated(format!("{id} is not readable")))?;
    let bytes = session.bytes().to_vec();
    session.unmap()?;
    Ok(bytes)
}

//! Engine configuration.

/// Behavior switches of a [`crate::BufferManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Treat new allocations as uninitialized and clear buffers to zero
    /// before their contents are first observed. Disable only when the
    /// allocation factory hands out zeroed memory.
    pub lazy_zero_init: bool,
    /// Prefix prepended to every allocation label.
    pub label_prefix: String,
    /// After a write map of a non-staging storage is released, queue the
    /// buffer so its staging storage is refreshed at the next flush.
    pub refresh_staging_after_write_map: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lazy_zero_init: true,
            label_prefix: "stratum:".to_string(),
            refresh_staging_after_write_map: true,
        }
    }
}

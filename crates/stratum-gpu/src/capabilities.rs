//! Device capability description.

use stratum_core::constants::CONSTANT_BUFFER_UPDATE_GRANULARITY;

/// Capabilities of the device behind a backend that change which paths the
/// engine may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Adapter name, for logs.
    pub device_name: String,

    /// Constant buffers accept updates of a sub-range (D3D11.1 `UpdateSubresource1`).
    pub supports_partial_constant_buffer_update: bool,
    /// Partial constant buffer updates must be aligned to this many bytes.
    pub constant_buffer_update_granularity: u64,

    /// The map primitive offers a true read-only mode on staging storages.
    pub supports_read_only_map: bool,

    /// Largest update the recording context accepts inline; bigger writes are
    /// uploaded through a temporary staging allocation.
    pub max_inline_update_size: u64,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            device_name: "Unknown adapter".to_string(),
            supports_partial_constant_buffer_update: true,
            constant_buffer_update_granularity: CONSTANT_BUFFER_UPDATE_GRANULARITY,
            supports_read_only_map: false,
            max_inline_update_size: u64::MAX,
        }
    }
}

impl DeviceCapabilities {
    /// Set the adapter name.
    #[must_use]
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Enable or disable partial constant buffer updates.
    #[must_use]
    pub fn partial_constant_buffer_update(mut self, supported: bool) -> Self {
        self.supports_partial_constant_buffer_update = supported;
        self
    }

    /// Set the partial constant buffer update granularity.
    #[must_use]
    pub fn constant_buffer_update_granularity(mut self, granularity: u64) -> Self {
        self.constant_buffer_update_granularity = granularity;
        self
    }

    /// Enable or disable read-only maps.
    #[must_use]
    pub fn read_only_map(mut self, supported: bool) -> Self {
        self.supports_read_only_map = supported;
        self
    }

    /// Set the inline update size limit.
    #[must_use]
    pub fn max_inline_update_size(mut self, size: u64) -> Self {
        self.max_inline_update_size = size;
        self
    }

    /// Check if the capabilities describe a device the engine can drive.
    pub fn meets_requirements(&self) -> bool {
        // Granularity is used as an alignment mask
        if !self.constant_buffer_update_granularity.is_power_of_two()
            || self.constant_buffer_update_granularity < 4
        {
            return false;
        }

        self.max_inline_update_size >= 4
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} - partial constant updates: {} (granularity {}) - read-only map: {}",
            self.device_name,
            if self.supports_partial_constant_buffer_update {
                "yes"
            } else {
                "no"
            },
            self.constant_buffer_update_granularity,
            if self.supports_read_only_map {
                "yes"
            } else {
                "no"
            },
        )
    }
}

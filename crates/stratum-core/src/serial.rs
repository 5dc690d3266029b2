//! Submission serials.

use std::fmt;

/// Identifies a batch of submitted GPU commands.
///
/// Serials only ever grow. They are compared, never subtracted, so a serial
/// is "retired" once the device reports a completed serial at least as large.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ExecutionSerial(pub u64);

impl ExecutionSerial {
    /// Serial of a device that has submitted nothing yet.
    pub const ZERO: Self = Self(0);

    /// The serial that follows this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether work tagged with this serial has finished on the GPU.
    #[inline]
    #[must_use]
    pub fn is_retired(self, completed: Self) -> bool {
        self <= completed
    }
}

impl fmt::Display for ExecutionSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//! Alignment helpers.

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Check whether `value` is a multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

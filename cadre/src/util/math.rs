//! Integer rounding helpers.

use num_traits::PrimInt;

/// Rounds `value` up to the next multiple of `alignment`, which must be a
/// power of two. Used for chunk offsets, which carry the backend's vertex and
/// index alignment requirements.
pub fn round_up_pot<T: PrimInt>(value: T, alignment: T) -> T {
    debug_assert_eq!(alignment.count_ones(), 1, "alignment must be a power of two");
    let mask = alignment - T::one();
    (value + mask) & !mask
}

/// Integer division of `numerator` by `denominator`, rounding up.
pub fn round_up_div<T: PrimInt>(numerator: T, denominator: T) -> T {
    (numerator + denominator - T::one()) / denominator
}

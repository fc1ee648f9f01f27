use num_traits::PrimInt;

/// Rounds `value` up to the next multiple of `align`.
///
/// An `align` of zero or one leaves `value` unchanged.
#[inline]
pub fn align_up<T: PrimInt>(value: T, align: T) -> T {
    if align <= T::one() {
        return value;
    }

    match value % align {
        rem if rem == T::zero() => value,
        rem => value + (align - rem),
    }
}

#[inline]
pub fn is_aligned<T: PrimInt>(value: T, align: T) -> bool {
    align <= T::one() || value % align == T::zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0u64, 256), 0);
        assert_eq!(align_up(1u64, 256), 256);
        assert_eq!(align_up(256u64, 256), 256);
        assert_eq!(align_up(257usize, 16), 272);
        assert_eq!(align_up(13u32, 0), 13);
        assert_eq!(align_up(13u32, 1), 13);
    }

    #[test]
    fn is_aligned_checks_remainder() {
        assert!(is_aligned(512u64, 512));
        assert!(!is_aligned(100u64, 64));
        assert!(is_aligned(7u64, 1));
    }
}

//! Utility functions.

/// Mapping granularity on x86_64 Linux.
pub const PAGE_SIZE: u64 = 0x1000;

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two. Returns `None` on overflow.
pub fn align_up(addr: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Aligns an address down to a multiple of `align`.
pub fn align_down(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Rounds `size` up to a whole number of pages.
pub fn page_align(size: u64) -> Option<u64> {
    align_up(size, PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(16, 8), Some(16));
        assert_eq!(align_up(u64::MAX, 8), None);
    }

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0), Some(0));
        assert_eq!(page_align(1), Some(PAGE_SIZE));
        assert_eq!(page_align(0x1000), Some(0x1000));
        assert_eq!(page_align(0x2018), Some(0x3000));
        assert_eq!(align_down(0x2018, PAGE_SIZE), 0x2000);
    }
}

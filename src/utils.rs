//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// It aligns `to_be_aligned` using `alignment`, which must be a power of two.
///
/// This method is used to align region sizes to be a multiple of the backend's
/// page size and block sizes to be a multiple of [`crate::block::ALIGNMENT`].
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of overflowing.
pub fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(alignment - 1)
        .map(|value| value & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_block_size() {
        let alignments = vec![(1..16, 16), (17..32, 32), (33..48, 48), (49..64, 64)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, 16));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let alignments = vec![(1..4096, 4096), (4097..8192, 8192)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096))
            }
        }
    }

    #[test]
    fn checked_align_overflow() {
        assert_eq!(checked_align(usize::MAX, 16), None);
        assert_eq!(checked_align(usize::MAX - 15, 16), Some(usize::MAX - 15));
        assert_eq!(checked_align(33, 16), Some(48));
    }
}

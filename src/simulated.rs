//! A fixed-capacity stand-in for the operating system.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use crate::{kernel::PageMapper, utils::align};

/// Default page size of [`SimulatedMemory::new`].
pub const SIMULATED_PAGE_SIZE: usize = 4096;

/// [`PageMapper`] that hands out pages from one buffer reserved up front.
///
/// Mapping only moves a break pointer forward, so regions are contiguous and
/// never reused until [`PageMapper::reset`] rewinds the break. Once the buffer
/// is used up every request fails, which makes running out of memory easy to
/// reproduce.
///
/// ```text
/// +---------------------------------+----------------------------------+
/// |          mapped regions         |            still free            |
/// +---------------------------------+----------------------------------+
/// ^ base                            ^ base + brk                       ^ base + capacity
/// ```
#[derive(Debug)]
pub struct SimulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
    brk: usize,
    page_size: usize,
}

// The buffer is exclusively owned by this value.
unsafe impl Send for SimulatedMemory {}

impl SimulatedMemory {
    /// Reserves `capacity` bytes (rounded up to whole pages) of 4 KiB pages.
    pub fn new(capacity: usize) -> Self {
        Self::with_page_size(capacity, SIMULATED_PAGE_SIZE)
    }

    /// Reserves `capacity` bytes (rounded up to whole pages, at least one)
    /// split into pages of `page_size` bytes.
    ///
    /// # Panics
    ///
    /// If `page_size` is not a power of two or is smaller than 256 bytes.
    pub fn with_page_size(capacity: usize, page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= 256,
            "page size must be a power of two of at least 256 bytes"
        );

        let capacity = align(capacity.max(1), page_size);
        let layout = match Layout::from_size_align(capacity, page_size) {
            Ok(layout) => layout,
            Err(_) => panic!("simulated memory of {capacity} bytes is too large"),
        };

        let base = match NonNull::new(unsafe { alloc::alloc_zeroed(layout) }) {
            Some(base) => base,
            None => alloc::handle_alloc_error(layout),
        };

        Self {
            base,
            layout,
            brk: 0,
            page_size,
        }
    }

    /// Total bytes that can be mapped.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes mapped since creation or the last reset.
    pub fn mapped_bytes(&self) -> usize {
        self.brk
    }

    /// Bytes that can still be mapped.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.brk
    }
}

unsafe impl PageMapper for SimulatedMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_pages(&mut self, len: usize) -> Option<NonNull<u8>> {
        if len == 0 || len % self.page_size != 0 || len > self.remaining() {
            log::debug!(
                "[simulated] refusing to map {len} bytes ({} left)",
                self.remaining()
            );
            return None;
        }

        let addr = unsafe { self.base.add(self.brk) };
        self.brk += len;

        Some(addr)
    }

    unsafe fn release_pages(&mut self, _base: NonNull<u8>, _len: usize) {
        // Pages only come back all at once, on reset.
    }

    fn reset(&mut self) {
        self.brk = 0;
    }
}

impl Drop for SimulatedMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_rounded_to_pages() {
        assert_eq!(SimulatedMemory::new(1).capacity(), 4096);
        assert_eq!(SimulatedMemory::new(4097).capacity(), 8192);
        assert_eq!(SimulatedMemory::with_page_size(300, 256).capacity(), 512);
    }

    #[test]
    fn maps_until_exhausted() {
        let mut memory = SimulatedMemory::new(2 * 4096);

        let first = memory.map_pages(4096).unwrap();
        let second = memory.map_pages(4096).unwrap();

        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 4096);
        assert_eq!(first.as_ptr() as usize % 4096, 0);
        assert_eq!(memory.mapped_bytes(), 8192);
        assert!(memory.map_pages(4096).is_none());
    }

    #[test]
    fn rejects_partial_pages() {
        let mut memory = SimulatedMemory::new(4 * 4096);

        assert!(memory.map_pages(0).is_none());
        assert!(memory.map_pages(100).is_none());
        assert_eq!(memory.mapped_bytes(), 0);
    }

    #[test]
    fn reset_rewinds_the_break() {
        let mut memory = SimulatedMemory::new(4096);

        let first = memory.map_pages(4096).unwrap();
        assert!(memory.map_pages(4096).is_none());

        memory.reset();
        assert_eq!(memory.map_pages(4096), Some(first));
    }
}

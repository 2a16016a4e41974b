//! # memalloc
//!
//! A `malloc`/`free` style allocator that builds its heap out of pages
//! obtained from a page mapper (`mmap` on unix, `VirtualAlloc` on Windows, or
//! a fixed size [`SimulatedMemory`] buffer).
//!
//! Every mapped region is carved into blocks. Each block carries its size and
//! an allocated flag at both ends (boundary tags), so that we can step to the
//! next and to the previous block in constant time:
//!
//! ```text
//! +--------+----------+-------------+-----------+-------------+------------+
//! | Region | Prologue |  Allocated  |   Free    |  Allocated  | Terminator |
//! +--------+----------+-------------+-----------+-------------+------------+
//! ```
//!
//! Free blocks are also chained together in an explicit free list, stored in
//! their own (unused) payload. Allocating is a first-fit search of that list;
//! releasing merges the block with any free neighbour. When nothing fits, a
//! new region is mapped, each one bigger than the last.
//!
//! [`Allocator`] is the single threaded core. [`MemAlloc`] wraps it behind a
//! lock so it can be used as the `#[global_allocator]`.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

mod block;
mod check;
mod coalesce;
mod config;
mod error;
mod freelist;
mod heap;
mod kernel;
mod region;
mod simulated;
mod utils;

pub use block::ALIGNMENT;
pub use config::{AllocatorConfig, FreeCheck};
pub use error::{AllocError, Corruption, InvalidFreeReason};
pub use heap::{Allocator, FreeBlock, HeapStats};
pub use kernel::{Kernel, PageMapper, page_size};
pub use simulated::{SIMULATED_PAGE_SIZE, SimulatedMemory};

/// Thread safe allocator backed by the operating system, usable as the
/// global allocator:
///
/// ```no_run
/// use memalloc::MemAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: MemAlloc = MemAlloc::new();
/// ```
///
/// The heap is initialized on first use. Every call takes one lock around the
/// whole [`Allocator`], so only one thread allocates at a time. Alignments
/// above [`ALIGNMENT`] are not supported and return null.
///
/// A logger that allocates must not be installed at `trace` level while this
/// is the global allocator: the allocator would log from inside the lock.
pub struct MemAlloc {
    heap: Mutex<Option<Allocator<Kernel>>>,
}

impl Default for MemAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl MemAlloc {
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    /// Bookkeeping of the underlying heap, if it has been initialized.
    pub fn stats(&self) -> Option<HeapStats> {
        let heap = self.heap.lock().ok()?;
        heap.as_ref().map(Allocator::stats)
    }
}

unsafe impl GlobalAlloc for MemAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        let Ok(mut guard) = self.heap.lock() else {
            return ptr::null_mut();
        };

        if guard.is_none() {
            // Pointers come from `alloc`, so the O(1) check is enough.
            let config = AllocatorConfig::new().with_free_check(FreeCheck::Tags);
            let mut heap = Allocator::new(Kernel::new(), config);

            if heap.init().is_err() {
                return ptr::null_mut();
            }

            *guard = Some(heap);
        }

        guard
            .as_mut()
            .and_then(|heap| heap.alloc(layout.size()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Ok(mut guard) = self.heap.lock() else {
            return;
        };

        if let (Some(heap), Some(ptr)) = (guard.as_mut(), NonNull::new(ptr)) {
            // `GlobalAlloc::dealloc` cannot report errors.
            let _ = unsafe { heap.free(ptr) };
        }
    }
}

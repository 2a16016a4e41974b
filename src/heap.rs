use std::ptr::NonNull;

use crate::{
    block::{ALIGNMENT, BlockPtr, MIN_BLOCK_SIZE, block_size_for},
    coalesce::coalesce,
    config::{AllocatorConfig, FreeCheck},
    error::{AllocError, Corruption, InvalidFreeReason},
    freelist::{Fit, FreeList},
    kernel::PageMapper,
    region::{REGION_OVERHEAD, Region, RegionChain},
    utils::checked_align,
};

/// A free block as seen from the outside, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Payload address of the block.
    pub addr: usize,
    /// Total size of the block, boundary tags included.
    pub size: usize,
}

/// Snapshot of the allocator's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Regions mapped from the backend.
    pub regions: usize,
    /// Bytes mapped from the backend.
    pub mapped_bytes: usize,
    /// Bytes sitting in free blocks, boundary tags included.
    pub free_bytes: usize,
    /// Entries in the free list.
    pub free_blocks: usize,
    /// Upper bound of the largest free block.
    pub largest_free_hint: usize,
    /// Multiplier the next growth of the arena will use.
    pub growth_multiplier: usize,
}

/// Explicit free list allocator with boundary tags, built on pages mapped by
/// a [`PageMapper`].
///
/// ```text
///                                Free List
///                +-----------------------------------------+
///                |                                         |
/// +--------------|-------------------------+      +--------v-------------------------------+
/// |        | +---v--+    +-------+    +----|-+  |      |        | +-------+    +------+    +-----+  |
/// | Region | | Free | -> | Block | -> | Free |  | <--> | Region | | Block | -> | Free | -> | End |  |
/// |        | +------+    +-------+    +------+  |      |        | +-------+    +------+    +-----+  |
/// +----------------------------------------+      +----------------------------------------+
/// ```
///
/// Allocation is first-fit over the free list. Free blocks are split when
/// what is left over can still be a block, and released blocks are merged
/// with their free neighbours straight away. When nothing fits, a new region
/// is mapped; every growth maps twice as much as the previous one.
///
/// The allocator is single threaded: every operation takes `&mut self`. See
/// [`crate::MemAlloc`] for a version usable as a global allocator.
///
/// ```
/// use memalloc::{Allocator, AllocatorConfig, SimulatedMemory};
///
/// let mut heap = Allocator::new(SimulatedMemory::new(1 << 20), AllocatorConfig::default());
/// heap.init().unwrap();
///
/// let a = heap.alloc(40).unwrap();
/// let _b = heap.alloc(200).unwrap();
/// unsafe { heap.free(a).unwrap() };
///
/// // The released block is the first one we find.
/// assert_eq!(heap.alloc(40), Some(a));
/// assert!(heap.check());
/// ```
pub struct Allocator<B: PageMapper> {
    backend: B,
    config: AllocatorConfig,
    /// Every region mapped so far.
    pub(crate) regions: RegionChain,
    /// Free blocks, most recently released first.
    pub(crate) free_list: FreeList,
    /// Sum of the sizes of every block in `free_list`.
    pub(crate) total_free: usize,
    /// Never smaller than the largest free block. Inserts and merges raise
    /// it, splits leave it alone, and a failed search (which has looked at
    /// every free block) sets it to the exact value.
    pub(crate) largest_free: usize,
    growth_multiplier: usize,
    initialized: bool,
    poisoned: bool,
}

// The regions are owned by the allocator and only reachable through it.
unsafe impl<B: PageMapper + Send> Send for Allocator<B> {}

impl<B: PageMapper> Allocator<B> {
    /// Creates an allocator that will get its memory from `backend`. Nothing
    /// is mapped until [`Allocator::init`] is called.
    pub fn new(backend: B, config: AllocatorConfig) -> Self {
        let config = config.normalized();

        Self {
            backend,
            config,
            regions: RegionChain::new(),
            free_list: FreeList::new(),
            total_free: 0,
            largest_free: 0,
            growth_multiplier: config.initial_growth_multiplier,
            initialized: false,
            poisoned: false,
        }
    }

    /// Starts a new session: gives every region of the previous session back
    /// to the backend, then maps and formats the first region.
    pub fn init(&mut self) -> Result<(), AllocError> {
        self.teardown();

        let len = self
            .backend
            .page_size()
            .checked_mul(self.config.initial_pages)
            .ok_or(AllocError::Exhausted {
                requested: usize::MAX,
            })?;

        self.map_region(len)?;
        self.initialized = true;

        log::debug!(
            "[memalloc] initialized with {len} bytes, {} free",
            self.total_free
        );

        Ok(())
    }

    /// Allocates a block with room for `size` bytes and returns its payload,
    /// aligned to [`ALIGNMENT`] bytes.
    ///
    /// Returns `None` without touching anything when `size` is zero, and
    /// `None` when the backend cannot provide enough memory.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        if !self.initialized || self.poisoned {
            log::warn!("[memalloc] alloc({size}) on an unusable heap");
            return None;
        }

        let needed = block_size_for(size)?;

        // The hint never underestimates, so this means nothing can fit.
        if self.total_free < needed || self.largest_free < needed {
            self.grow_arena(needed).ok()?;
        }

        let block = match unsafe { self.free_list.find_first_fit(needed) } {
            Fit::Found(block) => block,
            Fit::Miss { largest } => {
                self.largest_free = largest;
                self.grow_arena(needed).ok()?;

                match unsafe { self.free_list.find_first_fit(needed) } {
                    Fit::Found(block) => block,
                    Fit::Miss { largest } => {
                        self.largest_free = largest;
                        return None;
                    }
                }
            }
        };

        let payload = unsafe { self.place(block, needed) };

        log::trace!("[memalloc] alloc({size}) -> {payload:p} ({needed} bytes)");

        Some(payload)
    }

    /// Releases a block returned by [`Allocator::alloc`].
    ///
    /// The pointer is validated first (see [`FreeCheck`]); a pointer that is
    /// not a live allocation is reported as [`AllocError::InvalidFree`] and
    /// nothing is modified. If merging with the neighbours finds broken
    /// metadata, [`AllocError::Corrupted`] is returned and the allocator stops
    /// serving requests.
    ///
    /// # Safety
    ///
    /// The payload must not be accessed once it has been released. With
    /// [`FreeCheck::Tags`], `ptr` must also have been returned by `alloc` on
    /// this allocator: that check cannot tell a block from payload bytes that
    /// merely look like one.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        if self.poisoned {
            return Err(Corruption::Poisoned.into());
        }

        if !self.initialized {
            return Err(AllocError::Uninitialized);
        }

        let (block, region) = match self.validate_free(ptr) {
            Ok(found) => found,
            Err(AllocError::Corrupted(corruption)) => return Err(self.poison(corruption)),
            Err(err) => {
                log::warn!("[memalloc] {err}");
                return Err(err);
            }
        };

        unsafe {
            let size = block.size();
            block.write_tags(size, false);
            self.total_free += size;

            match coalesce(block, region, &mut self.free_list) {
                Ok(merged) => {
                    self.largest_free = self.largest_free.max(merged.size());
                    log::trace!("[memalloc] free({ptr:p}) -> {size} bytes");
                    Ok(())
                }
                Err(corruption) => Err(self.poison(corruption)),
            }
        }
    }

    /// Whether every heap invariant holds. See [`Allocator::verify`].
    pub fn check(&self) -> bool {
        self.verify().is_ok()
    }

    /// Snapshot of the counters, see [`HeapStats`].
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            regions: self.regions.len(),
            mapped_bytes: self.regions.mapped_bytes(),
            free_bytes: self.total_free,
            free_blocks: self.free_list.len(),
            largest_free_hint: self.largest_free,
            growth_multiplier: self.growth_multiplier,
        }
    }

    /// The free list, in search order.
    pub fn free_blocks(&self) -> Vec<FreeBlock> {
        unsafe {
            self.free_list
                .iter()
                .map(|block| FreeBlock {
                    addr: block.addr(),
                    size: block.size(),
                })
                .collect()
        }
    }

    /// Configuration in use, after zeroes were clamped.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// The page backend the regions come from.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether [`Allocator::init`] has succeeded since creation.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Maps `len` bytes, formats them and puts the new free block in the list.
    fn map_region(&mut self, len: usize) -> Result<BlockPtr, AllocError> {
        let Some(base) = self.backend.map_pages(len) else {
            log::warn!("[memalloc] backend could not map {len} bytes");
            return Err(AllocError::Exhausted { requested: len });
        };

        debug_assert_eq!(base.as_ptr() as usize % ALIGNMENT, 0);

        unsafe {
            let region = self.regions.append(base, len);
            let block = region.format();
            let size = block.size();

            self.free_list.insert(block);
            self.total_free += size;
            self.largest_free = self.largest_free.max(size);

            Ok(block)
        }
    }

    /// Maps a new region big enough for a block of `needed` bytes, scaled by
    /// the growth multiplier, which then doubles.
    fn grow_arena(&mut self, needed: usize) -> Result<BlockPtr, AllocError> {
        let len = needed
            .checked_add(REGION_OVERHEAD)
            .and_then(|len| checked_align(len, self.backend.page_size()))
            .and_then(|len| len.checked_mul(self.growth_multiplier))
            .ok_or(AllocError::Exhausted {
                requested: usize::MAX,
            })?;

        let block = self.map_region(len)?;

        self.growth_multiplier = self
            .growth_multiplier
            .saturating_mul(2)
            .min(self.config.max_growth_multiplier);

        log::debug!(
            "[memalloc] grew arena by {len} bytes for a {needed} byte block ({} regions)",
            self.regions.len()
        );

        Ok(block)
    }

    /// Hands out `needed` bytes of the free `block`.
    ///
    /// If what is left would be more than a minimum block, the block is split
    /// and the leftover takes the block's place in the free list:
    ///
    /// ```text
    /// +----------------------------------+        +-----------+----------------------+
    /// |            free block            |   ->   | allocated |    free leftover     |
    /// +----------------------------------+        +-----------+----------------------+
    ///                                              <- needed ->
    /// ```
    ///
    /// Otherwise the whole block is handed out.
    unsafe fn place(&mut self, block: BlockPtr, needed: usize) -> NonNull<u8> {
        unsafe {
            let size = block.size();
            let extra = size - needed;

            if extra > MIN_BLOCK_SIZE {
                block.write_tags(needed, true);

                let rest = block.next();
                rest.write_tags(extra, false);
                self.free_list.replace(block, rest);

                self.total_free -= needed;
            } else {
                self.free_list.remove(block);
                block.set_allocated(true);

                self.total_free -= size;
            }

            block.payload()
        }
    }

    /// Finds the block and region `ptr` belongs to, or tells why it cannot be
    /// released. A region walk that runs into broken tags reports
    /// [`AllocError::Corrupted`].
    fn validate_free(&self, ptr: NonNull<u8>) -> Result<(BlockPtr, Region), AllocError> {
        let addr = ptr.as_ptr() as usize;
        let invalid = |reason| AllocError::InvalidFree { addr, reason };

        let region = unsafe { self.regions.find(addr) }.ok_or(invalid(InvalidFreeReason::OutOfBounds))?;

        if addr % ALIGNMENT != 0 {
            return Err(invalid(InvalidFreeReason::Misaligned));
        }

        let end = unsafe { region.end() };
        if addr < region.first_payload() || addr >= end {
            return Err(invalid(InvalidFreeReason::NotABlock));
        }

        let block = BlockPtr::from_payload(ptr);

        if self.config.free_check == FreeCheck::Walk {
            let mut found = None;
            for candidate in unsafe { region.blocks() } {
                let candidate = candidate?;
                if candidate.addr() >= addr {
                    found = Some(candidate);
                    break;
                }
            }

            if found != Some(block) {
                return Err(invalid(InvalidFreeReason::NotABlock));
            }
        }

        unsafe {
            let header = block.header();
            let size = header.size;

            if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 || size > end - addr {
                return Err(invalid(InvalidFreeReason::NotABlock));
            }

            if block.footer() != header {
                return Err(invalid(InvalidFreeReason::NotABlock));
            }

            if !header.is_allocated() {
                return Err(invalid(InvalidFreeReason::NotAllocated));
            }
        }

        Ok((block, region))
    }

    /// Marks the heap as unusable after `corruption` was found.
    fn poison(&mut self, corruption: Corruption) -> AllocError {
        log::error!("[memalloc] {corruption}");
        self.poisoned = true;

        AllocError::Corrupted(corruption)
    }

    /// Gives every region back to the backend and forgets about them.
    fn teardown(&mut self) {
        let mapped = self.regions.len();
        let mut current = self.regions.first();

        while let Some(region) = current {
            unsafe {
                // The header lives inside the region, read it before it goes.
                current = region.next();
                let len = region.len();
                self.backend.release_pages(region.base(), len);
            }
        }

        if mapped > 0 {
            self.backend.reset();
            log::debug!("[memalloc] released {mapped} regions");
        }

        self.regions.clear();
        self.free_list.clear();
        self.total_free = 0;
        self.largest_free = 0;
        self.growth_multiplier = self.config.initial_growth_multiplier;
        self.initialized = false;
        self.poisoned = false;
    }
}

impl<B: PageMapper> Drop for Allocator<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

//! Heap consistency checker.
//!
//! Walks everything the allocator knows about and cross-checks it:
//!
//! - the chain of regions, linked both ways;
//! - every block of every region, in address order, from the prologue to the
//!   terminator: sizes, matching boundary tags, no two free blocks in a row;
//! - the free list: every member is free, inside a region and reachable
//!   through consistent links, and no two members overlap;
//! - the counters: free bytes and free block count agree with both walks, and
//!   the largest free block hint is not below the real largest block.

use crate::{
    Allocator,
    block::{ALIGNMENT, BlockPtr, MIN_BLOCK_SIZE, PROLOGUE_SIZE},
    error::Corruption,
    freelist::FreeList,
    kernel::PageMapper,
    region::Region,
};

impl<B: PageMapper> Allocator<B> {
    /// Checks every heap invariant and reports the first one that is broken.
    pub fn verify(&self) -> Result<(), Corruption> {
        if !self.is_initialized() {
            return Ok(());
        }

        let mut free_blocks = 0;
        let mut previous = None;
        for region in self.regions.iter() {
            if unsafe { region.prev() } != previous {
                return Err(Corruption::BrokenLinks {
                    addr: region.start(),
                });
            }

            free_blocks += unsafe { check_region(region)? };
            previous = Some(region);
        }

        if self.regions.last() != previous {
            return Err(Corruption::BrokenLinks {
                addr: previous.map_or(0, Region::start),
            });
        }

        let listed = unsafe { self.check_free_list()? };

        if listed.len() != free_blocks {
            return Err(Corruption::FreeCountMismatch {
                listed: listed.len(),
                found: free_blocks,
            });
        }

        let listed_bytes: usize = listed.iter().map(|(_, size)| size).sum();
        if listed_bytes != self.total_free {
            return Err(Corruption::FreeBytesMismatch {
                listed: listed_bytes,
                tracked: self.total_free,
            });
        }

        let largest = listed.iter().map(|&(_, size)| size).max().unwrap_or(0);
        if largest > self.largest_free {
            return Err(Corruption::StaleHint {
                hint: self.largest_free,
                actual: largest,
            });
        }

        Ok(())
    }

    /// Follows the free list and returns `(addr, size)` of every member,
    /// sorted by address.
    unsafe fn check_free_list(&self) -> Result<Vec<(usize, usize)>, Corruption> {
        let mut listed = Vec::with_capacity(self.free_list.len());
        let mut prev: Option<BlockPtr> = None;

        for block in unsafe { self.free_list.iter() } {
            let addr = block.addr();

            let region = unsafe { self.regions.find(addr) }.ok_or(Corruption::OutOfRegion { addr })?;
            let size = unsafe { check_tags(block, region)? };

            if unsafe { block.is_allocated() } {
                return Err(Corruption::AllocatedInFreeList { addr });
            }

            if unsafe { FreeList::prev_of(block) } != prev {
                return Err(Corruption::BrokenLinks { addr });
            }

            listed.push((addr, size));
            prev = Some(block);
        }

        // The iterator stops after `len` blocks; the list has to end there too.
        if self.free_list.last() != prev {
            return Err(Corruption::BrokenLinks {
                addr: prev.map_or(0, BlockPtr::addr),
            });
        }

        if let Some(last) = prev {
            if unsafe { FreeList::next_of(last) }.is_some() {
                return Err(Corruption::BrokenLinks { addr: last.addr() });
            }
        }

        listed.sort_unstable();
        for pair in listed.windows(2) {
            let (first, first_size) = pair[0];
            let (second, _) = pair[1];

            if first + first_size > second {
                return Err(Corruption::Overlap { first, second });
            }
        }

        Ok(listed)
    }
}

/// Size of `block` after making sure it is a well formed block of `region`.
unsafe fn check_tags(block: BlockPtr, region: Region) -> Result<usize, Corruption> {
    let addr = block.addr();

    unsafe {
        let header = block.header();
        let size = header.size;

        if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
            return Err(Corruption::BadSize { addr, size });
        }

        if addr < region.first_payload() || addr + size > region.end() {
            return Err(Corruption::OutOfRegion { addr });
        }

        let footer = block.footer();
        if footer != header {
            return Err(Corruption::TagMismatch {
                addr,
                header: size,
                footer: footer.size,
            });
        }

        Ok(size)
    }
}

/// Walks one region block by block and returns how many free blocks it has.
unsafe fn check_region(region: Region) -> Result<usize, Corruption> {
    unsafe {
        let prologue = region.prologue();
        if prologue.size() != PROLOGUE_SIZE || !prologue.is_allocated() {
            return Err(Corruption::BadSize {
                addr: prologue.addr(),
                size: prologue.size(),
            });
        }

        let mut free_blocks = 0;
        let mut prev_free: Option<BlockPtr> = None;
        let mut block = prologue.next();

        while !block.is_terminator() {
            check_tags(block, region)?;

            if block.is_allocated() {
                prev_free = None;
            } else {
                if let Some(prev) = prev_free {
                    return Err(Corruption::Uncoalesced {
                        first: prev.addr(),
                        second: block.addr(),
                    });
                }

                free_blocks += 1;
                prev_free = Some(block);
            }

            block = block.next();
        }

        if block.addr() != region.end() {
            return Err(Corruption::MissingTerminator {
                addr: region.start(),
            });
        }

        Ok(free_blocks)
    }
}

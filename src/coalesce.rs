//! Merging of freed blocks with their free neighbours.

use crate::{
    block::{ALIGNMENT, BlockPtr, MIN_BLOCK_SIZE},
    error::Corruption,
    freelist::FreeList,
    region::Region,
};

/// Follows the footer before `block` back to the previous block, refusing to
/// leave the region if that footer is broken.
unsafe fn prev_in_region(block: BlockPtr, region: Region) -> Result<BlockPtr, Corruption> {
    unsafe {
        let size = block.prev_footer().size;

        if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
            return Err(Corruption::BadSize {
                addr: block.addr(),
                size,
            });
        }

        if block.addr() - region.first_payload() < size {
            return Err(Corruption::OutOfRegion {
                addr: block.addr().wrapping_sub(size),
            });
        }

        Ok(block.prev())
    }
}

/// Makes sure a free neighbour is what its tags claim before we absorb it.
unsafe fn check_neighbour(
    block: BlockPtr,
    region: Region,
    free_list: &FreeList,
) -> Result<usize, Corruption> {
    let addr = block.addr();

    unsafe {
        let size = block.size();

        if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
            return Err(Corruption::BadSize { addr, size });
        }

        if addr < region.first_payload() || addr + size > region.end() {
            return Err(Corruption::OutOfRegion { addr });
        }

        let footer = block.footer();
        if footer != block.header() {
            return Err(Corruption::TagMismatch {
                addr,
                header: size,
                footer: footer.size,
            });
        }

        if !free_list.is_linked(block) {
            return Err(Corruption::Unlinked { addr });
        }

        Ok(size)
    }
}

/// Merges the just released `block` with whichever physical neighbours are
/// free, and makes sure the result is in the free list exactly once:
///
/// ```text
///  prev     block    next           result
/// +------+---------+------+
/// | used |  freed  | used |   ->   block is inserted
/// | used |  freed  | free |   ->   block absorbs next
/// | free |  freed  | used |   ->   prev absorbs block
/// | free |  freed  | free |   ->   prev absorbs block and next
/// +------+---------+------+
/// ```
///
/// The prologue and the terminator are always allocated, so neither
/// neighbour can fall outside of `region`.
///
/// Returns the block that now covers the released memory.
///
/// **SAFETY**: `block` must be a block of `region` whose tags were just marked
/// free and which is not in the free list.
pub(crate) unsafe fn coalesce(
    block: BlockPtr,
    region: Region,
    free_list: &mut FreeList,
) -> Result<BlockPtr, Corruption> {
    unsafe {
        let size = block.size();
        let prev_free = !block.prev_footer().is_allocated();
        let next = block.next();
        let next_free = !next.is_allocated();

        match (prev_free, next_free) {
            (false, false) => {
                free_list.insert(block);
                Ok(block)
            }
            (false, true) => {
                let next_size = check_neighbour(next, region, free_list)?;

                free_list.remove(next);
                block.write_tags(size + next_size, false);
                free_list.insert(block);

                Ok(block)
            }
            (true, false) => {
                let prev = prev_in_region(block, region)?;
                let prev_size = check_neighbour(prev, region, free_list)?;

                // prev keeps its place in the list, it just gets bigger.
                prev.write_tags(prev_size + size, false);

                Ok(prev)
            }
            (true, true) => {
                let prev = prev_in_region(block, region)?;
                let prev_size = check_neighbour(prev, region, free_list)?;
                let next_size = check_neighbour(next, region, free_list)?;

                free_list.remove(next);
                prev.write_tags(prev_size + size + next_size, false);

                Ok(prev)
            }
        }
    }
}

use std::{mem, ptr::NonNull};

use crate::{
    block::{ALIGNMENT, BlockPtr, PROLOGUE_SIZE, TAG_SIZE},
    error::Corruption,
};

/// This is the overhead size introduced by the [`RegionHeader`] in bytes.
pub(crate) const REGION_HEADER_SIZE: usize = mem::size_of::<RegionHeader>();

/// Bytes of every region that can never be handed out: the region header, the
/// prologue block and the terminator header.
pub(crate) const REGION_OVERHEAD: usize = REGION_HEADER_SIZE + PROLOGUE_SIZE + TAG_SIZE;

/// Metadata written at the very beginning of every region we get from the
/// backend.
///
/// The backend gives us memory regions aligned with the page size, but we
/// cannot assume these regions are adjacent. So every region is formatted on
/// its own and the regions are chained together:
///
/// ```text
/// +-----------------------------------------------------+      +-----------------------------------------------------+
/// |        | +----------+ +-------+ +-------+ +------+  |      |        | +----------+ +-------+ +-------+ +------+  |
/// | Region | | Prologue | | Block | | Block | | Term |  | <--> | Region | | Prologue | | Block | | Block | | Term |  |
/// |        | +----------+ +-------+ +-------+ +------+  |      |        | +----------+ +-------+ +-------+ +------+  |
/// +-----------------------------------------------------+      +-----------------------------------------------------+
/// ```
///
/// The chain is only used to know what we own (to validate pointers and to
/// give everything back on teardown). It plays no part in finding free memory.
#[repr(C, align(16))]
pub(crate) struct RegionHeader {
    next: Option<Region>,
    prev: Option<Region>,
    /// Length of the whole mapping, header included.
    len: usize,
}

/// Handle to a mapped region, pointing at its [`RegionHeader`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Region(NonNull<RegionHeader>);

impl Region {
    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    #[inline]
    pub fn start(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub unsafe fn len(self) -> usize {
        unsafe { self.0.as_ref().len }
    }

    /// One past the last byte of the mapping.
    #[inline]
    pub unsafe fn end(self) -> usize {
        unsafe { self.start() + self.len() }
    }

    #[inline]
    pub unsafe fn next(self) -> Option<Region> {
        unsafe { self.0.as_ref().next }
    }

    #[inline]
    pub unsafe fn prev(self) -> Option<Region> {
        unsafe { self.0.as_ref().prev }
    }

    /// The prologue block, first block of the region.
    #[inline]
    pub fn prologue(self) -> BlockPtr {
        unsafe { BlockPtr::from_payload(self.base().add(REGION_HEADER_SIZE + TAG_SIZE)) }
    }

    /// Address of the first payload a user block can ever have.
    #[inline]
    pub fn first_payload(self) -> usize {
        self.prologue().addr() + PROLOGUE_SIZE
    }

    /// Whether `addr` falls inside the mapping.
    #[inline]
    pub unsafe fn contains(self, addr: usize) -> bool {
        unsafe { (self.start()..self.end()).contains(&addr) }
    }

    /// Lays out a brand new region:
    ///
    /// ```text
    /// +--------+----------+--------------------------------------+------------+
    /// | header | prologue |          one big free block          | terminator |
    /// +--------+----------+--------------------------------------+------------+
    /// ```
    ///
    /// Returns the free block. It is not linked into any free list yet.
    pub unsafe fn format(self) -> BlockPtr {
        unsafe {
            let prologue = self.prologue();
            prologue.write_tags(PROLOGUE_SIZE, true);

            let block = prologue.next();
            let size = self.len() - REGION_OVERHEAD;
            block.write_tags(size, false);

            block.next().write_terminator();

            block
        }
    }

    /// Walks the blocks of the region in address order, prologue included,
    /// terminator excluded.
    pub unsafe fn blocks(self) -> Blocks {
        Blocks {
            current: Some(self.prologue()),
            end: unsafe { self.end() },
        }
    }
}

/// Physical walk over the blocks of one region.
///
/// The walk stops at the terminator. A block whose size is malformed or would
/// take it past the end of the region is yielded as an error, and the walk
/// stops there without stepping over it.
pub(crate) struct Blocks {
    current: Option<BlockPtr>,
    end: usize,
}

impl Iterator for Blocks {
    type Item = Result<BlockPtr, Corruption>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current.take()?;
        let addr = block.addr();
        let size = unsafe { block.size() };

        if size == 0 {
            return None;
        }

        if size < PROLOGUE_SIZE || size % ALIGNMENT != 0 {
            return Some(Err(Corruption::BadSize { addr, size }));
        }

        if size > self.end - addr {
            return Some(Err(Corruption::OutOfRegion { addr }));
        }

        self.current = Some(unsafe { block.next() });
        Some(Ok(block))
    }
}

/// Doubly linked chain of every region mapped so far, in acquisition order.
pub(crate) struct RegionChain {
    head: Option<Region>,
    tail: Option<Region>,
    len: usize,
}

pub(crate) struct Regions {
    current: Option<Region>,
}

impl RegionChain {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Option<Region> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Option<Region> {
        self.tail
    }

    /// Writes a [`RegionHeader`] at `base` and links it at the tail of the
    /// chain. We keep the tail around so this never has to walk the chain.
    ///
    /// **SAFETY**: `[base, base + len)` must be writable memory we own, aligned
    /// to 16 bytes, and not part of any region already in the chain.
    pub unsafe fn append(&mut self, base: NonNull<u8>, len: usize) -> Region {
        let header = base.cast::<RegionHeader>();

        unsafe {
            header.as_ptr().write(RegionHeader {
                next: None,
                prev: self.tail,
                len,
            });
        }

        let region = Region(header);

        match self.tail {
            Some(mut tail) => unsafe { tail.0.as_mut().next = Some(region) },
            None => self.head = Some(region),
        }

        self.tail = Some(region);
        self.len += 1;

        region
    }

    /// Region whose mapping contains `addr`.
    pub unsafe fn find(&self, addr: usize) -> Option<Region> {
        self.iter().find(|region| unsafe { region.contains(addr) })
    }

    pub fn iter(&self) -> Regions {
        Regions {
            current: self.head,
        }
    }

    /// Total bytes mapped across the chain.
    pub fn mapped_bytes(&self) -> usize {
        self.iter().map(|region| unsafe { region.len() }).sum()
    }

    /// Forgets every region. Only valid once the memory behind them is gone.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Iterator for Regions {
    type Item = Region;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.current?;
        self.current = unsafe { region.next() };
        Some(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{MIN_BLOCK_SIZE, OVERHEAD},
        kernel::PageMapper,
        simulated::SimulatedMemory,
    };

    #[test]
    fn header_fits_in_overhead() {
        assert_eq!(REGION_HEADER_SIZE % 16, 0);
        assert_eq!(REGION_OVERHEAD % 16, 0);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(REGION_OVERHEAD, 80);
    }

    #[test]
    fn format_lays_out_prologue_block_and_terminator() {
        let mut memory = SimulatedMemory::new(4096);
        let base = memory.map_pages(4096).unwrap();
        let mut chain = RegionChain::new();

        unsafe {
            let region = chain.append(base, 4096);
            let block = region.format();

            let prologue = region.prologue();
            assert_eq!(prologue.size(), PROLOGUE_SIZE);
            assert!(prologue.is_allocated());

            assert_eq!(block.addr(), region.first_payload());
            assert_eq!(block.size(), 4096 - REGION_OVERHEAD);
            assert!(!block.is_allocated());
            assert_eq!(block.header(), block.footer());
            assert_eq!(block.prev(), prologue);

            let terminator = block.next();
            assert!(terminator.is_terminator());
            assert!(terminator.is_allocated());
            assert_eq!(terminator.addr(), region.end());

            assert_eq!(
                region.blocks().collect::<Result<Vec<_>, _>>(),
                Ok(vec![prologue, block])
            );
        }
    }

    #[test]
    fn chain_keeps_acquisition_order() {
        let mut memory = SimulatedMemory::new(4 * 4096);
        let mut chain = RegionChain::new();

        let regions: Vec<_> = (0..3)
            .map(|_| {
                let base = memory.map_pages(4096).unwrap();
                unsafe { chain.append(base, 4096) }
            })
            .collect();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.first(), Some(regions[0]));
        assert_eq!(chain.last(), Some(regions[2]));
        assert_eq!(chain.iter().collect::<Vec<_>>(), regions);
        assert_eq!(chain.mapped_bytes(), 3 * 4096);

        unsafe {
            assert_eq!(regions[1].prev(), Some(regions[0]));
            assert_eq!(regions[1].next(), Some(regions[2]));
            assert_eq!(regions[0].prev(), None);
            assert_eq!(regions[2].next(), None);

            assert_eq!(chain.find(regions[1].start() + 100), Some(regions[1]));
            assert_eq!(chain.find(regions[2].end() - 1), Some(regions[2]));
            assert_eq!(chain.find(regions[2].end() + 4096), None);
        }
    }

    #[test]
    fn walk_stops_at_a_malformed_size() {
        let mut memory = SimulatedMemory::new(4096);
        let base = memory.map_pages(4096).unwrap();
        let mut chain = RegionChain::new();

        unsafe {
            let region = chain.append(base, 4096);
            let block = region.format();

            // Not a multiple of 16: stepping over it would land misaligned.
            block.payload().as_ptr().sub(TAG_SIZE).cast::<usize>().write(1234);

            let mut blocks = region.blocks();
            assert_eq!(blocks.next(), Some(Ok(region.prologue())));
            assert_eq!(
                blocks.next(),
                Some(Err(Corruption::BadSize {
                    addr: block.addr(),
                    size: 1234
                }))
            );
            assert_eq!(blocks.next(), None);

            // Aligned, but bigger than what is left of the region.
            block.payload().as_ptr().sub(TAG_SIZE).cast::<usize>().write(4096);
            assert_eq!(
                region.blocks().nth(1),
                Some(Err(Corruption::OutOfRegion { addr: block.addr() }))
            );
        }
    }

    #[test]
    fn smallest_page_still_fits_a_block() {
        assert!(256 - REGION_OVERHEAD >= MIN_BLOCK_SIZE + OVERHEAD);
    }
}

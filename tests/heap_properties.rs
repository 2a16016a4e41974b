//! Properties that must hold for any sequence of allocations and releases.
//!
//! The sequences are pseudo random but deterministic: every run replays the
//! same operations, so a failure can be reproduced from the seed.

use std::ptr::NonNull;

use memalloc::{ALIGNMENT, AllocError, Allocator, AllocatorConfig, FreeCheck, Kernel, SimulatedMemory};

/// xorshift64, enough to shuffle sizes and decide what to free.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> usize {
        (self.next() % n) as usize
    }
}

/// A live allocation and the byte pattern written into it.
struct Live {
    ptr: NonNull<u8>,
    size: usize,
    fill: u8,
}

impl Live {
    fn range(&self) -> (usize, usize) {
        let start = self.ptr.as_ptr() as usize;
        (start, start + self.size)
    }

    fn intact(&self) -> bool {
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        bytes.iter().all(|&b| b == self.fill)
    }
}

fn simulated(pages: usize, free_check: FreeCheck) -> Allocator<SimulatedMemory> {
    let config = AllocatorConfig::new().with_free_check(free_check);
    let mut heap = Allocator::new(SimulatedMemory::new(pages * 4096), config);
    heap.init().unwrap();
    heap
}

fn assert_disjoint(live: &[Live]) {
    let mut ranges: Vec<_> = live.iter().map(Live::range).collect();
    ranges.sort_unstable();

    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:x?} overlaps {:x?}", pair[0], pair[1]);
    }
}

/// Runs `steps` random operations and checks every property along the way.
fn churn(heap: &mut Allocator<impl memalloc::PageMapper>, seed: u64, steps: usize, max_size: u64) {
    let mut rng = Rng(seed);
    let mut live: Vec<Live> = Vec::new();

    for step in 0..steps {
        if live.is_empty() || rng.below(3) != 0 {
            let size = 1 + rng.below(max_size);
            let Some(ptr) = heap.alloc(size) else {
                continue;
            };

            assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);

            let fill = step as u8;
            unsafe { ptr.as_ptr().write_bytes(fill, size) };
            live.push(Live { ptr, size, fill });
        } else {
            let victim = live.swap_remove(rng.below(live.len() as u64));
            assert!(victim.intact(), "payload of {:p} was overwritten", victim.ptr);
            unsafe { heap.free(victim.ptr).unwrap() };
        }

        if step % 16 == 0 {
            assert_disjoint(&live);
            assert_eq!(heap.verify(), Ok(()));
        }
    }

    assert_disjoint(&live);
    assert!(live.iter().all(Live::intact));

    for block in live {
        unsafe { heap.free(block.ptr).unwrap() };
    }

    assert_eq!(heap.verify(), Ok(()));
}

#[test]
fn random_small_requests() {
    let mut heap = simulated(4096, FreeCheck::Walk);
    churn(&mut heap, 0x9E37_79B9_7F4A_7C15, 2000, 256);
}

#[test]
fn random_mixed_requests_with_tag_checks() {
    let mut heap = simulated(8192, FreeCheck::Tags);
    churn(&mut heap, 0xDEAD_BEEF_CAFE_F00D, 1500, 9000);
}

#[test]
fn random_requests_on_the_os_backend() {
    let mut heap = Allocator::new(Kernel::new(), AllocatorConfig::new());
    heap.init().unwrap();
    churn(&mut heap, 42, 1000, 3000);
}

#[test]
fn everything_freed_leaves_one_block_per_region() {
    let mut heap = simulated(4096, FreeCheck::Walk);
    churn(&mut heap, 7, 500, 1024);

    let stats = heap.stats();
    assert_eq!(stats.free_blocks, stats.regions);
    assert!(heap.check());
}

#[test]
fn reused_block_does_not_overlap_live_ones() {
    let mut heap = simulated(64, FreeCheck::Walk);

    let a = heap.alloc(100).unwrap();
    let b = heap.alloc(100).unwrap();
    let c = heap.alloc(100).unwrap();

    unsafe {
        a.as_ptr().write_bytes(0xAA, 100);
        c.as_ptr().write_bytes(0xCC, 100);
        heap.free(b).unwrap();
    }

    let d = heap.alloc(60).unwrap();
    unsafe { d.as_ptr().write_bytes(0xDD, 60) };

    let live = [
        Live { ptr: a, size: 100, fill: 0xAA },
        Live { ptr: c, size: 100, fill: 0xCC },
        Live { ptr: d, size: 60, fill: 0xDD },
    ];
    assert_disjoint(&live);
    assert!(live.iter().all(Live::intact));
    assert_eq!(d, b);
}

#[test]
fn adjacent_blocks_merge_in_either_order() {
    for reversed in [false, true] {
        let mut heap = simulated(16, FreeCheck::Walk);

        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(300).unwrap();
        let _guard = heap.alloc(10).unwrap();

        unsafe {
            if reversed {
                heap.free(b).unwrap();
                heap.free(a).unwrap();
            } else {
                heap.free(a).unwrap();
                heap.free(b).unwrap();
            }
        }

        let merged: Vec<_> = heap
            .free_blocks()
            .into_iter()
            .filter(|block| block.addr == a.as_ptr() as usize)
            .collect();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].size, 144 + 336);
        assert_eq!(heap.stats().free_blocks, 2);
        assert!(heap.check());
    }
}

#[test]
fn end_to_end_reuse() {
    let mut heap = simulated(16, FreeCheck::Walk);

    let a = heap.alloc(40).unwrap();
    let b = heap.alloc(200).unwrap();
    unsafe { heap.free(a).unwrap() };
    let c = heap.alloc(40).unwrap();

    assert_eq!(c, a);
    assert_ne!(c, b);
}

#[test]
fn growth_covers_requests_below_a_page() {
    let mut heap = simulated(16, FreeCheck::Walk);

    // Leaves less than 1 KiB in the first region.
    let _big = heap.alloc(3000).unwrap();
    let before = heap.stats();

    let ptr = heap.alloc(2500).unwrap();
    unsafe { ptr.as_ptr().write_bytes(0, 2500) };

    let after = heap.stats();
    assert_eq!(after.regions, before.regions + 1);
    assert!(after.mapped_bytes >= before.mapped_bytes + 4096);
    assert!(heap.check());
}

#[test]
fn exhaustion_is_recoverable() {
    let mut heap = simulated(4, FreeCheck::Walk);

    let mut live = Vec::new();
    while let Some(ptr) = heap.alloc(700) {
        live.push(ptr);
    }

    assert!(!live.is_empty());
    assert!(heap.check());

    for ptr in live.drain(..) {
        unsafe { heap.free(ptr).unwrap() };
    }

    assert!(heap.alloc(700).is_some());
    assert!(heap.check());
}

#[test]
fn second_init_forgets_the_previous_session() {
    let mut heap = simulated(256, FreeCheck::Walk);

    let old: Vec<_> = (0..50).map(|i| heap.alloc(100 + i * 40).unwrap()).collect();
    assert!(heap.stats().regions > 1);

    heap.init().unwrap();

    let stats = heap.stats();
    assert_eq!(stats.regions, 1);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(heap.backend().mapped_bytes(), 4096);

    // Blocks of the previous session live in released regions now. The first
    // region is mapped again at the same address, but its old blocks are gone.
    let stale = old[10];
    assert!(matches!(
        unsafe { heap.free(stale) },
        Err(AllocError::InvalidFree { .. })
    ));
    assert!(heap.check());
}

//! Runs the allocator on a small simulated memory until it is exhausted,
//! then releases everything and shows the heap going back to one free block
//! per region.

use std::ptr::NonNull;

use memalloc::{AllocError, Allocator, AllocatorConfig, SimulatedMemory};

fn main() -> Result<(), AllocError> {
    let memory = SimulatedMemory::new(16 * 4096);
    println!("Simulated memory: {} bytes", memory.capacity());

    let mut heap = Allocator::new(memory, AllocatorConfig::new().with_max_growth_multiplier(8));
    heap.init()?;

    let mut live: Vec<NonNull<u8>> = Vec::new();
    let mut size = 64;

    while let Some(ptr) = heap.alloc(size) {
        live.push(ptr);
        size += 64;
    }

    let stats = heap.stats();
    println!(
        "Exhausted after {} allocations: request for {size} bytes failed",
        live.len()
    );
    println!(
        "  {} region(s), {} bytes mapped, {} bytes left in the backend",
        stats.regions,
        stats.mapped_bytes,
        heap.backend().remaining()
    );

    // Odd ones first, so the even ones merge with both neighbours.
    for ptr in live.iter().skip(1).step_by(2) {
        unsafe { heap.free(*ptr)? };
    }
    println!("Released half: {} free blocks", heap.stats().free_blocks);

    for ptr in live.iter().step_by(2) {
        unsafe { heap.free(*ptr)? };
    }

    let stats = heap.stats();
    println!(
        "Released everything: {} free block(s) in {} region(s), {} bytes free",
        stats.free_blocks, stats.regions, stats.free_bytes
    );

    if let Err(corruption) = heap.verify() {
        println!("Heap is corrupted: {corruption}");
    }

    Ok(())
}

//! Drives [`Allocator`] by hand on top of the operating system's pages and
//! prints what the heap looks like after every step.

use memalloc::{Allocator, AllocatorConfig, Kernel};

fn print_heap(heap: &Allocator<Kernel>) {
    let stats = heap.stats();
    println!(
        "  {} region(s), {} bytes mapped, {} bytes free in {} block(s)",
        stats.regions, stats.mapped_bytes, stats.free_bytes, stats.free_blocks
    );

    for block in heap.free_blocks() {
        println!("    free block at {:#x}: {} bytes", block.addr, block.size);
    }
}

fn main() {
    let mut heap = Allocator::new(Kernel::new(), AllocatorConfig::default());
    heap.init().expect("could not map the first region");
    println!("Initialized heap");
    print_heap(&heap);

    let a = heap.alloc(40).expect("out of memory");
    println!("Requested 40 bytes, received {a:p}");

    let b = heap.alloc(200).expect("out of memory");
    println!("Requested 200 bytes, received {b:p}");

    let c = heap.alloc(16).expect("out of memory");
    println!("Requested 16 bytes, received {c:p}");
    print_heap(&heap);

    unsafe { heap.free(a).expect("a is a live allocation") };
    println!("Released {a:p}");
    print_heap(&heap);

    let d = heap.alloc(40).expect("out of memory");
    println!("Requested 40 bytes again, received {d:p} (reused: {})", d == a);

    // The last release merges everything back into one block.
    unsafe {
        heap.free(b).expect("b is a live allocation");
        heap.free(c).expect("c is a live allocation");
        heap.free(d).expect("d is a live allocation");
    }
    println!("Released everything");
    print_heap(&heap);

    let big = heap.alloc(20_000).expect("out of memory");
    println!("Requested 20000 bytes, received {big:p}");
    print_heap(&heap);

    match unsafe { heap.free(big.add(16)) } {
        Ok(()) => println!("Released an interior pointer?"),
        Err(err) => println!("Refused to release an interior pointer: {err}"),
    }

    println!("Heap consistent: {}", heap.check());
}

//! Uses [`MemAlloc`] as the global allocator, so every `Box`, `Vec` and
//! `String` below lives in our heap.

use std::thread;

use memalloc::MemAlloc;

#[global_allocator]
static ALLOCATOR: MemAlloc = MemAlloc::new();

fn main() {
    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {val_box}, At: {val_box:p}");

    // Vec example
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}", v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{msg}' - At: {:p}", msg.as_ptr());

    let p1 = Box::new(2.22);
    let addr_p1 = format!("{p1:p}");
    println!("P1 Allocated at: {addr_p1}");

    drop(p1);
    println!("P1 Deallocated");

    let p2 = Box::new(2.22);
    println!("P2 at: {p2:p}");

    // Merge example: two neighbours released, then one block as big as both.
    let a = Box::new([0u8; 64]);
    let b = Box::new([0u8; 64]);
    let ptr_a = a.as_ptr();

    drop(a);
    drop(b);

    let c = Box::new([0u8; 128]);
    let ptr_c = c.as_ptr();

    if ptr_a == ptr_c {
        println!("Correctly reused at {ptr_c:p}");
    } else {
        println!("Not reused. A was at {ptr_a:p} and C is at {ptr_c:p}");
    }

    // Thread example
    let handles: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let data: Vec<u64> = (0..1000).map(|n| n * i).collect();
                data.iter().sum::<u64>()
            })
        })
        .collect();

    for handle in handles {
        println!("Thread sum: {}", handle.join().unwrap());
    }

    if let Some(stats) = ALLOCATOR.stats() {
        println!(
            "\n{} region(s), {} bytes mapped, {} bytes free in {} block(s)",
            stats.regions, stats.mapped_bytes, stats.free_bytes, stats.free_blocks
        );
    }
}

use tagalloc::Heap;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut heap = Heap::new().expect("could not reserve a heap");

    let addr1 = heap.allocate(8);
    log_alloc(addr1, 8);

    let addr2 = heap.allocate(100);
    log_alloc(addr2, 100);

    let addr3 = heap.allocate(4096);
    log_alloc(addr3, 4096);

    unsafe {
        let grown = heap.resize(addr2, 300);
        println!("Resized the 100 byte block, now at: {grown:?}");

        heap.free(addr1);
        heap.free(grown);
        heap.free(addr3);
    }

    println!(
        "After freeing everything the heap tracks {} free block(s)",
        heap.free_blocks()
    );
}

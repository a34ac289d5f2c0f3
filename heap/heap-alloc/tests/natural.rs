//! Natural-alignment carving: payloads aligned to their own (power-of-two)
//! size, with prefix and tail free nodes around the aligned slot.

use heap_alloc::node::HEADER_SIZE;
use heap_alloc::{Heap, HeapError, HeapFlags};
use std::ptr;

/// Backing memory whose base sits at `boundary_offset` bytes past a
/// 256-byte boundary. Returns the buffer and the region base.
fn offset_backing(words: usize, boundary_offset: usize) -> (Vec<u64>, *mut u8) {
    assert_eq!(boundary_offset % size_of::<u64>(), 0);
    let mut buf = vec![0_u64; words];
    let raw = buf.as_mut_ptr() as usize;
    let base = ((raw + 255) & !255) + boundary_offset;
    (buf, base as *mut u8)
}

fn natural_wait() -> HeapFlags {
    HeapFlags::new().with_natural(true).with_wait(true)
}

#[test]
fn misaligned_node_gets_prefix_and_tail() {
    let heap = Heap::new();
    let size = 32 * 1024;
    // Base 8 past a 256 boundary: the first payload cannot be 256-aligned.
    let (_buf, base) = offset_backing(8 * 1024, 8);
    assert_ne!((base as usize + HEADER_SIZE) % 256, 0);

    let id = unsafe { heap.region_add(base, size, HeapFlags::new()).unwrap() };

    let mut p = ptr::null_mut();
    heap.calloc(&mut p, 1, 256, natural_wait()).unwrap();
    let addr = p as usize;
    assert_eq!(addr % 256, 0);

    // A prefix free node sits in front of the allocation and a tail free
    // node after it.
    let stats = heap.region_stats(id).unwrap();
    assert_eq!(stats.nodes_active, 1);
    assert_eq!(stats.nodes_free, 2);
    assert!(addr > base as usize + HEADER_SIZE);
    assert!(addr + 256 < base as usize + size);
    heap.verify(id).unwrap();

    // The aligned payload is zeroed like any other.
    let payload = unsafe { core::slice::from_raw_parts(p, 256) };
    assert!(payload.iter().all(|&b| b == 0));

    heap.free(&mut p, HeapFlags::new()).unwrap();
    heap.verify(id).unwrap();
    assert_eq!(heap.region_stats(id).unwrap().nodes_active, 0);
}

#[test]
fn already_aligned_node_skips_the_prefix() {
    let heap = Heap::new();
    let size = 32 * 1024;
    // Place the base so the first payload lands exactly on a 256 boundary.
    let (_buf, base) = offset_backing(8 * 1024, 256 - HEADER_SIZE);
    assert_eq!((base as usize + HEADER_SIZE) % 256, 0);

    let id = unsafe { heap.region_add(base, size, HeapFlags::new()).unwrap() };

    let mut p = ptr::null_mut();
    heap.calloc(&mut p, 1, 256, natural_wait()).unwrap();
    assert_eq!(p as usize % 256, 0);
    assert_eq!(p as usize, base as usize + HEADER_SIZE);

    // No prefix was carved, only the tail.
    let stats = heap.region_stats(id).unwrap();
    assert_eq!(stats.nodes_active, 1);
    assert_eq!(stats.nodes_free, 1);
    heap.verify(id).unwrap();

    heap.free(&mut p, HeapFlags::new()).unwrap();
}

#[test]
fn natural_requires_a_power_of_two() {
    let heap = Heap::new();
    let (_buf, base) = offset_backing(8 * 1024, 8);
    unsafe { heap.region_add(base, 16 * 1024, HeapFlags::new()).unwrap() };

    // 24 bytes rounds to a 24-byte payload, which is not a power of two.
    let mut p = ptr::null_mut();
    assert_eq!(
        heap.calloc(&mut p, 1, 24, natural_wait()),
        Err(HeapError::Fatal)
    );
    assert!(p.is_null());
}

#[test]
fn alignment_survives_repeated_allocations() {
    let heap = Heap::new();
    let (_buf, base) = offset_backing(32 * 1024, 8);
    let id = unsafe { heap.region_add(base, 128 * 1024, HeapFlags::new()).unwrap() };

    let mut held: Vec<*mut u8> = Vec::new();
    for _ in 0..8 {
        let mut p = ptr::null_mut();
        heap.calloc(&mut p, 1, 512, natural_wait()).unwrap();
        assert_eq!(p as usize % 512, 0);
        held.push(p);
    }
    heap.verify(id).unwrap();

    for p in &mut held {
        heap.free(p, HeapFlags::new()).unwrap();
    }
    heap.verify(id).unwrap();
    assert_eq!(heap.region_stats(id).unwrap().nodes_active, 0);
}

#[test]
fn natural_request_larger_than_any_node_is_fatal() {
    let heap = Heap::new();
    let (_buf, base) = offset_backing(2 * 1024, 8);
    unsafe { heap.region_add(base, 4 * 1024, HeapFlags::new()).unwrap() };

    // No aligned 4 KiB slot can exist inside a 4 KiB region whose payload
    // starts past the boundary.
    let mut p = ptr::null_mut();
    assert_eq!(
        heap.calloc(&mut p, 1, 4 * 1024, natural_wait()),
        Err(HeapError::Fatal)
    );
    assert!(p.is_null());
}

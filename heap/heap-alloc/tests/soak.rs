//! Randomized single-threaded soak: interleaved allocations and frees with
//! payload validation, auditing the region as it churns.

use heap_alloc::{Heap, HeapFlags};
use std::ptr;

const REGION_SIZE: usize = 32 * 1024;
const MAX_ALLOC: usize = 2 * 1024;
const SLOTS: usize = 32;
const ROUNDS: usize = 4_000;

struct Slot {
    ptr: *mut u8,
    fill: u8,
    size: usize,
}

fn xorshift(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn validate(slot: &Slot) {
    let bytes = unsafe { core::slice::from_raw_parts(slot.ptr, slot.size) };
    assert!(
        bytes.iter().all(|&b| b == slot.fill),
        "payload at {:p} lost its fill pattern",
        slot.ptr
    );
}

#[test]
fn random_alloc_free_churn_stays_consistent() {
    let heap = Heap::new();
    let mut mem = vec![0_u64; REGION_SIZE / size_of::<u64>()];
    let id = unsafe {
        heap.region_add(mem.as_mut_ptr().cast(), REGION_SIZE, HeapFlags::new()).unwrap()
    };

    let mut rng = 0x2545_F491_4F6C_DD1D_u64;
    let mut slots: Vec<Slot> = Vec::new();

    for round in 0..ROUNDS {
        let make_one = slots.len() < SLOTS && (slots.is_empty() || xorshift(&mut rng) % 3 != 0);

        if make_one {
            let size = 1 + (xorshift(&mut rng) as usize) % MAX_ALLOC;
            let mut p = ptr::null_mut();
            if heap.calloc(&mut p, 1, size, HeapFlags::new()).is_ok() {
                // Zeroed on arrival, then filled with a recognizable byte.
                let bytes = unsafe { core::slice::from_raw_parts_mut(p, size) };
                assert!(bytes.iter().all(|&b| b == 0));
                let fill = (xorshift(&mut rng) as u8) | 1;
                bytes.fill(fill);
                slots.push(Slot { ptr: p, fill, size });
            } else {
                // Out of space: drain a few slots and keep going.
                for _ in 0..slots.len().min(4) {
                    let victim = (xorshift(&mut rng) as usize) % slots.len();
                    let mut slot = slots.swap_remove(victim);
                    validate(&slot);
                    heap.free(&mut slot.ptr, HeapFlags::new()).unwrap();
                }
            }
        } else {
            let victim = (xorshift(&mut rng) as usize) % slots.len();
            let mut slot = slots.swap_remove(victim);
            validate(&slot);
            heap.free(&mut slot.ptr, HeapFlags::new()).unwrap();
        }

        if round % 256 == 0 {
            heap.verify(id).unwrap();
        }
    }

    for slot in &mut slots {
        validate(slot);
        heap.free(&mut slot.ptr, HeapFlags::new()).unwrap();
    }

    heap.verify(id).unwrap();
    let stats = heap.region_stats(id).unwrap();
    assert_eq!(stats.nodes_active, 0);
}

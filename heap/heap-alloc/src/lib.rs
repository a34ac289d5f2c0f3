//! # Multi-Region Heap Allocation
//!
//! A heap allocator for systems with several distinct memory backings, such
//! as internal SRAM next to external DRAM next to memory behind an encrypted
//! bus. Each backing is handed to the allocator as a *region*; allocations
//! are tagged with flags that select a compatible region, and every region
//! manages its own nodes with in-band metadata.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Allocation engine                      │
//! │    • first-fit search, node splitting               │
//! │    • natural-alignment carving                      │
//! │    • on-demand coalescing                           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Region table                           │
//! │    • fixed slot array, master + per-region locks    │
//! │    • ascending-address iteration, flag filtering    │
//! │    • add / drain / reclaim lifecycle                │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Node layout                            │
//! │    • header / payload / footer tiling               │
//! │    • boundary tags with magic sentinels             │
//! │    • intrusive, address-ordered free list           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Two lock levels: a master lock serializes the region table's shape, and
//! each region's own lock protects its nodes. The master is always taken
//! first and released as soon as a region lock is held; at most one region
//! lock is held per caller at any time. Callers choose per operation whether
//! to spin on contention (`wait`) or fail fast with [`HeapError::Again`]
//! (`nowait`, the default). Waiting is for high-priority callers only; a
//! low-priority thread that spins while holding a region lock can stall
//! everyone behind it.
//!
//! ## Corruption detection
//!
//! Every header and footer carries a magic sentinel and a duplicated size
//! word. Walks check them at every step, and any mismatch fails the
//! operation with [`HeapError::Fatal`] without touching the damaged state:
//! silent recovery would only spread the corruption.
//!
//! ## Usage
//!
//! ```
//! use heap_alloc::{Heap, HeapFlags};
//!
//! let heap = Heap::new();
//!
//! let mut backing = vec![0_u64; 4096];
//! let bytes = backing.len() * size_of::<u64>();
//! let internal = HeapFlags::new().with_internal(true);
//!
//! // Safety: the span is valid, writable, and ours to hand over.
//! let region = unsafe {
//!     heap.region_add(backing.as_mut_ptr().cast(), bytes, internal).unwrap()
//! };
//!
//! // Zeroed allocation from the internal region.
//! let mut p = core::ptr::null_mut();
//! heap.calloc(&mut p, 16, 8, internal).unwrap();
//!
//! heap.free(&mut p, HeapFlags::new()).unwrap();
//! assert!(p.is_null());
//!
//! let stats = heap.region_stats(region).unwrap();
//! assert_eq!(stats.nodes_active, 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod alloc;
mod error;
mod flags;
pub mod node;
mod region;
mod table;

pub use error::HeapError;
pub use flags::HeapFlags;
pub use table::{Heap, MAX_REGIONS, RegionId, RegionStats};

//! Allocation engine and free path.
//!
//! `calloc` walks the region table in ascending base-address order, holding
//! one region lock at a time, and runs a first-fit search over the chosen
//! region's free list. A node that is larger than the request is split; a
//! request for natural alignment carves a prefix node first so the payload
//! lands on a multiple of its own size. When a region has enough free bytes
//! but no single node fits, adjacent free nodes are coalesced and the search
//! retried, which terminates because every join shrinks the free list.
//!
//! `free` resolves the containing region, walks the node chain from the
//! region base verifying boundary tags, splices the node back into the
//! address-ordered free list, and coalesces only when the freed node is
//! surrounded by free neighbors. A draining region is reclaimed here once
//! its last allocation is gone.

use crate::error::HeapError;
use crate::flags::HeapFlags;
use crate::node::{CHUNK_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, MIN_NODE_SIZE, NIL, round_to_chunks};
use crate::region::Region;
use crate::table::Heap;
use core::ptr;
use heap_sync::current_task;
use log::{error, trace, warn};

/// Admission gate for regions that only serve one end of the size spectrum.
///
/// The threshold is a sixteenth of the region. With no policy bits set every
/// size is admitted; `small_requests` admits sizes below the threshold. The
/// `large_requests` predicate accepts every size; the behavior is inherited
/// and kept as-is.
fn admits_size(flags: HeapFlags, region_size: usize, bytes: usize) -> bool {
    let threshold = region_size / 16;

    if !flags.small_requests() && !flags.large_requests() {
        return true;
    }
    if flags.small_requests() && bytes < threshold {
        return true;
    }

    flags.large_requests()
}

impl Heap {
    /// Allocates zero-initialized memory for `count` elements of
    /// `elem_size` bytes each, from the first compatible region.
    ///
    /// On success `*out` points at the payload; it is nulled first, so a
    /// failed call never leaves a stale pointer behind. The payload size is
    /// the request rounded up to whole chunks.
    ///
    /// # Errors
    ///
    /// [`HeapError::Fatal`] when the size is zero or overflows, or when no
    /// region can serve the request; [`HeapError::Again`] when a lock was
    /// contested and the caller did not ask to wait.
    pub fn calloc(
        &self,
        out: &mut *mut u8,
        count: usize,
        elem_size: usize,
        flags: HeapFlags,
    ) -> Result<(), HeapError> {
        *out = ptr::null_mut();

        let bytes = count.checked_mul(elem_size).ok_or(HeapError::Fatal)?;
        if bytes == 0 {
            return Err(HeapError::Fatal);
        }
        let bytes = round_to_chunks(bytes).ok_or(HeapError::Fatal)?;

        self.calloc_bytes(out, bytes, flags)
    }

    /// Region search: first candidate by `find_first`, then ascending by
    /// base address until a region admits and serves the request.
    fn calloc_bytes(
        &self,
        out: &mut *mut u8,
        bytes: usize,
        flags: HeapFlags,
    ) -> Result<(), HeapError> {
        trace!("calloc: bytes={bytes}");

        let mut current = self.find_first(flags)?;
        loop {
            // The region must have enough free bytes overall; they may not
            // be contiguous, which the engine below sorts out.
            if current.guard.free >= bytes
                && admits_size(self.slot_flags(current.index), current.guard.size, bytes)
            {
                if let Ok(node) = current.guard.calloc_with_coalesce(bytes, flags) {
                    *out = current.guard.payload_ptr(node);
                    trace!("calloc: served from region {}", current.index);
                    return Ok(());
                }
            }

            current = self.find_next(current, flags)?;
        }
    }

    /// Releases an allocation made by [`calloc`](Self::calloc).
    ///
    /// Reads the payload pointer out of `*out` and nulls it before anything
    /// can fail, so the caller is never left holding a freed address.
    ///
    /// # Errors
    ///
    /// [`HeapError::Fatal`] when the pointer lies in no region, does not
    /// match a payload base, was already free, or a boundary tag is corrupt;
    /// [`HeapError::Again`] on contention for a non-waiting caller. Failed
    /// calls mutate no region state.
    pub fn free(&self, out: &mut *mut u8, flags: HeapFlags) -> Result<(), HeapError> {
        let addr = *out as usize;
        *out = ptr::null_mut();

        let mut current = self.ptr2region_locked(addr, flags)?;
        let index = current.index;
        let slot_flags = self.slot_flags(index);
        let region = &mut *current.guard;

        // Walk the chain from the base, remembering the last free node at a
        // lower address so the free-list splice lands in address order.
        let mut lower_free = NIL;
        let mut off = 0;
        while region.contains(off) {
            if off + HEADER_SIZE > region.size {
                error!("free: truncated node at {off:#x}");
                return Err(HeapError::Fatal);
            }
            if !region.is_active(off) {
                lower_free = off;
            }
            if !region.magic_ok(off) {
                error!("free: magic failure at {off:#x}");
                return Err(HeapError::Fatal);
            }
            let Some(end) = region.node_end(off) else {
                error!("free: corrupt size at {off:#x}");
                return Err(HeapError::Fatal);
            };
            if end > region.size {
                error!("free: node at {off:#x} overruns the region");
                return Err(HeapError::Fatal);
            }

            if addr == region.payload_addr(off) {
                if !region.is_active(off) {
                    error!("free: node at {off:#x} is already free");
                    return Err(HeapError::Fatal);
                }
                if region.footer_magic(off) != MAGIC {
                    error!("free: footer magic failure at {off:#x}");
                    return Err(HeapError::Fatal);
                }

                let node_flags = HeapFlags::from_bits(region.node_flags(off) as u32);
                if slot_flags.wiped() || node_flags.wiped() {
                    region.zero_payload(off);
                }

                let size = region.node_size(off);
                region.set_size(off, size, false);
                region.splice_after(lower_free, off);
                region.free += size;
                region.nodes_active -= 1;
                region.nodes_free += 1;

                // Only coalesce when surrounded by free neighbors; doing it
                // on every free costs too much.
                let next = region.next_offset(off);
                let next_is_free = region.contains(next)
                    && next + HEADER_SIZE <= region.size
                    && !region.is_active(next);
                let prev_is_free = region
                    .prev_offset(off)
                    .is_some_and(|prev| !region.is_active(prev));
                if next_is_free && prev_is_free {
                    trace!("free: coalescing around {off:#x}");
                    region.coalesce();
                }

                self.reap_if_drained(index, region);
                return Ok(());
            }

            off = end;
        }

        error!("free: {addr:#x} matches no payload");
        Err(HeapError::Fatal)
    }
}

impl Region {
    /// Retries the first-fit search as long as coalescing makes progress.
    ///
    /// Either the allocation lands, or a round joins no nodes and the
    /// region genuinely cannot serve the request. A successful allocation
    /// can still trigger a coalesce pass when the region looks fragmented:
    /// more free nodes than active ones while most of the region is free.
    pub(crate) fn calloc_with_coalesce(
        &mut self,
        bytes: usize,
        flags: HeapFlags,
    ) -> Result<usize, HeapError> {
        let mut joined = 1;
        while joined > 0 {
            let result = self.calloc_within_region(bytes, flags);

            let fragmented =
                self.nodes_free > self.nodes_active && (self.free * 100) / self.size >= 60;
            if result.is_err() || fragmented {
                if result.is_ok() {
                    trace!("calloc: fragmentation-driven coalesce");
                }
                joined = self.coalesce();
            }

            if let Ok(node) = result {
                return Ok(node);
            }
        }

        Err(HeapError::Fatal)
    }

    /// First fit over the free list. Returns the offset of the allocated
    /// node, fully initialized and accounted for.
    fn calloc_within_region(&mut self, bytes: usize, flags: HeapFlags) -> Result<usize, HeapError> {
        let mut chosen = NIL;

        let mut node = self.free_list;
        while node != NIL {
            if !self.contains(node) {
                error!("calloc: free list leaves the region at {node:#x}");
                return Err(HeapError::Fatal);
            }
            if self.is_active(node) {
                error!("calloc: active node on the free list at {node:#x}");
                return Err(HeapError::Fatal);
            }

            if self.node_size(node) >= bytes {
                if let Ok(carved) = self.carve(node, bytes, flags) {
                    chosen = carved;
                    break;
                }
                trace!("calloc: node at {node:#x} fits but cannot be carved");
            }

            node = self.next_free(node);
        }

        if chosen == NIL {
            return Err(HeapError::Fatal);
        }

        self.unlink_free(chosen);
        self.zero_payload(chosen);

        let size = self.node_size(chosen);
        self.set_owner(
            chosen,
            current_task().as_raw(),
            flags.into_bits() as usize,
        );
        self.set_size(chosen, size, true);

        self.free -= size;
        self.nodes_active += 1;
        self.nodes_free -= 1;

        Ok(chosen)
    }

    /// Shapes the free node at `node` for a request of `bytes`.
    fn carve(&mut self, node: usize, bytes: usize, flags: HeapFlags) -> Result<usize, HeapError> {
        if flags.natural() {
            return self.carve_natural(node, bytes);
        }
        Ok(self.split(node, bytes))
    }

    /// Splits `node` so its payload is exactly `bytes`, leaving the tail as
    /// a new free node spliced in right after it. A node that matches the
    /// request, or whose remainder is too small to stand alone, is consumed
    /// whole.
    fn split(&mut self, node: usize, bytes: usize) -> usize {
        let size = self.node_size(node);
        if size == bytes || size - bytes < MIN_NODE_SIZE {
            return node;
        }

        self.set_size(node, bytes, false);
        let tail = self.next_offset(node);

        self.set_size(tail, size - bytes - (HEADER_SIZE + FOOTER_SIZE), false);
        self.set_magic(tail);
        self.splice_after(node, tail);
        self.write_footer(tail);
        self.write_footer(node);

        self.free -= HEADER_SIZE + FOOTER_SIZE;
        self.nodes_free += 1;

        node
    }

    /// Carves `node` so the returned payload is aligned to `bytes`, which
    /// must be a power of two.
    ///
    /// The space in front of the aligned address becomes a prefix free node
    /// (the carve moves up in `bytes` steps until that prefix can stand
    /// alone); the aligned remainder is then split normally, which handles
    /// any tail.
    fn carve_natural(&mut self, node: usize, bytes: usize) -> Result<usize, HeapError> {
        if bytes == 0 || !bytes.is_power_of_two() {
            return Err(HeapError::Fatal);
        }

        let mask = bytes - 1;
        let payload = self.payload_addr(node);
        let payload_end = payload + self.node_size(node);

        let mut aligned = payload & !mask;
        if aligned < payload {
            aligned += bytes;
        }

        // Aligned already; the plain split handles it.
        if aligned == payload {
            return Ok(self.split(node, bytes));
        }

        loop {
            let end = aligned.checked_add(bytes).ok_or(HeapError::Fatal)?;
            if end > payload_end {
                trace!("calloc: no aligned slot for {bytes} bytes at {node:#x}");
                return Err(HeapError::Fatal);
            }
            if aligned - payload >= MIN_NODE_SIZE {
                break;
            }
            aligned += bytes;
        }

        // The prefix keeps its own header and the footer in front of the
        // aligned node's header.
        let prefix = aligned - payload - (HEADER_SIZE + FOOTER_SIZE);
        if !prefix.is_multiple_of(CHUNK_SIZE) {
            warn!("calloc: ragged prefix while aligning at {node:#x}");
            return Err(HeapError::Fatal);
        }

        let original = self.node_size(node);
        self.set_size(node, prefix, false);

        let carved = self.next_offset(node);
        self.set_size(carved, original - (prefix + HEADER_SIZE + FOOTER_SIZE), false);
        self.set_magic(carved);
        self.splice_after(node, carved);
        self.write_footer(carved);
        self.write_footer(node);

        self.nodes_free += 1;
        self.free -= HEADER_SIZE + FOOTER_SIZE;

        Ok(self.split(carved, bytes))
    }

    /// Merges address-adjacent free nodes, absorbing each higher neighbor
    /// into the lower one. Returns the number of joins; the walk is finite
    /// because every join shortens the free list.
    pub(crate) fn coalesce(&mut self) -> usize {
        let mut joins = 0;

        let mut low = self.free_list;
        if low == NIL {
            return 0;
        }
        let mut high = self.next_free(low);

        while high != NIL && self.contains(high) {
            if self.next_offset(low) == high {
                // Adjacent: the higher node's tags become payload.
                self.free += HEADER_SIZE + FOOTER_SIZE;

                let after = self.next_free(high);
                self.set_next_free(low, after);
                if after != NIL {
                    self.set_prev_free(after, low);
                }

                let merged = self.node_size(low)
                    + self.node_size(high)
                    + HEADER_SIZE
                    + FOOTER_SIZE;
                self.set_size(low, merged, false);
                self.write_footer(low);

                self.nodes_free -= 1;
                joins += 1;
                high = self.next_free(low);
            } else {
                low = high;
                high = self.next_free(high);
            }
        }

        joins
    }
}

//! The region table and its two-level locking protocol.
//!
//! One master lock protects the table's shape: which slots are in use, their
//! base addresses and capability flags. Each region additionally has its own
//! lock protecting the nodes and the free list inside it.
//!
//! The ordering rule is strict: a caller that needs both locks takes the
//! master first, and a caller holding a region lock releases it before going
//! back to the master. The iterators below briefly overlap the two while
//! handing a locked region to the caller, then drop the master.
//!
//! Shape data that must stay readable during a master-guarded scan while
//! some other thread holds a region lock (the flag word and the base
//! address) lives in per-slot atomics. A region can thus be restricted under
//! the master lock even while its own lock is held elsewhere; restriction
//! only affects future iterations.

use crate::error::HeapError;
use crate::flags::HeapFlags;
use crate::node::{CHUNK_SIZE, HEADER_SIZE, MAGIC, MIN_NODE_SIZE, NIL};
use crate::region::Region;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use heap_sync::{MutexGuard, SpinMutex};
use log::{debug, error, trace};

/// Fixed capacity of the region table, chosen at build time.
pub const MAX_REGIONS: usize = 8;

/// Stable identity of a region slot, valid for the region's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionId(pub(crate) usize);

impl RegionId {
    /// Index of the slot backing this region.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Counter snapshot of one region, taken under its lock.
#[derive(Debug, Clone, Copy)]
pub struct RegionStats {
    /// Total bytes in the region span.
    pub size: usize,
    /// Bytes available to future payloads.
    pub free: usize,
    /// Nodes currently on the free list.
    pub nodes_free: usize,
    /// Nodes currently allocated.
    pub nodes_active: usize,
    /// The region's capability flags.
    pub flags: HeapFlags,
}

/// One slot of the region table.
pub(crate) struct RegionSlot {
    /// Node state; everything behind this requires the region lock.
    state: SpinMutex<Region>,
    /// Mirror of the region's flag word, readable without the region lock.
    flags: AtomicU32,
    /// Mirror of the base address, readable without the region lock.
    /// Zero while the slot is vacant.
    base: AtomicUsize,
}

impl RegionSlot {
    const fn vacant() -> Self {
        Self {
            state: SpinMutex::new(Region::vacant()),
            flags: AtomicU32::new(0),
            base: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn flags(&self) -> HeapFlags {
        HeapFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.load(Ordering::Acquire)
    }

    /// Makes the slot visible to iteration. Caller holds master and the
    /// region lock.
    fn publish(&self, flags: HeapFlags, base: usize) {
        self.base.store(base, Ordering::Release);
        self.flags.store(flags.into_bits(), Ordering::Release);
    }

    /// Marks the slot as draining. Caller holds master.
    fn set_restricted(&self) {
        let bit = HeapFlags::new().with_restricted(true).into_bits();
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    /// Returns the slot to the vacant state. Caller holds the region lock.
    fn retire(&self) {
        self.flags.store(0, Ordering::Release);
        self.base.store(0, Ordering::Release);
    }
}

/// A region handed out by the iterators: the slot index plus the held lock.
pub(crate) struct LockedRegion<'a> {
    pub(crate) index: usize,
    pub(crate) guard: MutexGuard<'a, Region>,
}

/// Acquires `mutex` according to the caller's locking mode: spin when `wait`
/// is set, otherwise a single attempt that fails with [`HeapError::Again`].
pub(crate) fn lock_flags<'a, T>(
    mutex: &'a SpinMutex<T>,
    flags: HeapFlags,
) -> Result<MutexGuard<'a, T>, HeapError> {
    match mutex.acquire(flags.wait()) {
        Some(guard) => Ok(guard),
        None => {
            if let Some(task) = mutex.holder() {
                trace!("lock contended, held by task {}", task.as_raw());
            }
            Err(HeapError::Again)
        }
    }
}

/// A multi-region heap.
///
/// Holds a fixed table of region slots, each managing a caller-supplied span
/// of backing memory. All state lives inside this value; independent heaps
/// do not interact, so tests and subsystems can each own one.
///
/// # Examples
///
/// ```
/// use heap_alloc::{Heap, HeapFlags};
///
/// let heap = Heap::new();
/// let mut backing = vec![0_u64; 4096];
/// let size = backing.len() * size_of::<u64>();
///
/// // Safety: the span is valid, writable, and handed over exclusively.
/// unsafe {
///     heap.region_add(backing.as_mut_ptr().cast(), size, HeapFlags::new()).unwrap();
/// }
///
/// let mut p = core::ptr::null_mut();
/// heap.calloc(&mut p, 4, 32, HeapFlags::new()).unwrap();
/// assert!(!p.is_null());
/// heap.free(&mut p, HeapFlags::new()).unwrap();
/// ```
pub struct Heap {
    /// Serializes changes to the table's shape and all slot scans.
    master: SpinMutex<()>,
    /// The region slots.
    slots: [RegionSlot; MAX_REGIONS],
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Creates a heap with an empty region table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            master: SpinMutex::new(()),
            slots: [const { RegionSlot::vacant() }; MAX_REGIONS],
        }
    }

    #[inline]
    pub(crate) fn slot_flags(&self, index: usize) -> HeapFlags {
        self.slots[index].flags()
    }

    /// Hands `addr..addr + size` to the heap as a new region.
    ///
    /// The span is seeded with a single free node covering everything but
    /// the boundary tags. Returns the new region's stable identity.
    ///
    /// # Errors
    ///
    /// [`HeapError::Again`] when a needed lock is contended and the caller
    /// did not ask to wait; [`HeapError::Fatal`] when the span is null,
    /// misaligned, not a whole number of chunks, too small to hold one
    /// minimum node, or the table is full.
    ///
    /// # Safety
    ///
    /// `addr..addr + size` must be valid, writable memory that the caller
    /// hands over exclusively for the lifetime of the region (until it is
    /// deleted and drained).
    pub unsafe fn region_add(
        &self,
        addr: *mut u8,
        size: usize,
        flags: HeapFlags,
    ) -> Result<RegionId, HeapError> {
        if addr.is_null()
            || !(addr as usize).is_multiple_of(CHUNK_SIZE)
            || !size.is_multiple_of(CHUNK_SIZE)
            || size < MIN_NODE_SIZE
        {
            error!("region_add: rejecting span {addr:p}+{size:#x}");
            return Err(HeapError::Fatal);
        }

        let _master = lock_flags(&self.master, flags)?;

        for (index, slot) in self.slots.iter().enumerate() {
            let Ok(mut guard) = lock_flags(&slot.state, flags) else {
                continue;
            };
            if slot.flags().active() {
                continue;
            }

            guard.assign(addr, size);
            slot.publish(flags.with_active(true), addr as usize);
            debug!("region_add: slot={index} addr={addr:p} size={size:#x}");
            return Ok(RegionId(index));
        }

        error!("region_add: no slot is free");
        Err(HeapError::Fatal)
    }

    /// Starts deleting a region.
    ///
    /// The region is marked as draining: it disappears from every search,
    /// while existing allocations inside it can still be freed. The slot is
    /// reclaimed by `free` once no active node remains.
    ///
    /// # Errors
    ///
    /// [`HeapError::Fatal`] when the identity does not name a live region.
    pub fn region_delete(&self, id: RegionId) -> Result<(), HeapError> {
        // Deletion always waits for the master; it must not fail spuriously.
        let _master = self.master.lock();

        let Some(slot) = self.slots.get(id.0) else {
            return Err(HeapError::Fatal);
        };
        if !slot.flags().active() {
            return Err(HeapError::Fatal);
        }

        // The master lock suffices: searches consult this word under the
        // master, and the drain reaper re-reads it under the region lock.
        slot.set_restricted();
        debug!("region_delete: slot={} now draining", id.0);
        Ok(())
    }

    /// Resolves the region containing `ptr`.
    ///
    /// # Errors
    ///
    /// [`HeapError::Again`] on lock contention for a non-waiting caller,
    /// [`HeapError::Fatal`] when no live region contains the pointer.
    pub fn ptr2region(&self, ptr: *const u8, flags: HeapFlags) -> Result<RegionId, HeapError> {
        let locked = self.ptr2region_locked(ptr as usize, flags)?;
        Ok(RegionId(locked.index))
    }

    /// Like [`ptr2region`](Self::ptr2region) but keeps the region locked for
    /// the caller.
    pub(crate) fn ptr2region_locked(
        &self,
        addr: usize,
        flags: HeapFlags,
    ) -> Result<LockedRegion<'_>, HeapError> {
        let _master = lock_flags(&self.master, flags)?;

        for (index, slot) in self.slots.iter().enumerate() {
            // A contested slot aborts the whole scan for non-waiting
            // callers; the table may be mid-change.
            let guard = lock_flags(&slot.state, flags)?;

            if slot.flags().active() && guard.contains_addr(addr) {
                return Ok(LockedRegion { index, guard });
            }
        }

        Err(HeapError::Fatal)
    }

    /// Attempts to lock slot `index` and checks it against the request.
    ///
    /// Holds the region lock on success. `Again` means the lock was
    /// contested; `Fatal` means the region is unusable for this request.
    fn test_and_lock(&self, index: usize, flags: HeapFlags) -> Result<LockedRegion<'_>, HeapError> {
        let slot = &self.slots[index];
        let guard = lock_flags(&slot.state, flags)?;

        let current = slot.flags();
        if current.active()
            && !current.intersects(HeapFlags::DONT_USE_MASK)
            && current.admits_request(flags)
        {
            return Ok(LockedRegion { index, guard });
        }

        Err(HeapError::Fatal)
    }

    /// Returns the lowest-indexed usable region for the request, locked.
    ///
    /// A candidate that cannot be locked or fails the filter is simply
    /// skipped; an exhausted table is `Fatal` either way. Callers that want
    /// to outwait contention say so with the `wait` flag.
    pub(crate) fn find_first(&self, flags: HeapFlags) -> Result<LockedRegion<'_>, HeapError> {
        let _master = lock_flags(&self.master, flags)?;

        for index in 0..self.slots.len() {
            if let Ok(locked) = self.test_and_lock(index, flags) {
                return Ok(locked);
            }
        }

        Err(HeapError::Fatal)
    }

    /// Exchanges a locked region for the next usable one by ascending base
    /// address.
    ///
    /// The current lock is released before the master is taken, honoring the
    /// lock order. Candidates that cannot be locked or fail the filter are
    /// skipped; the scan keeps moving upward.
    pub(crate) fn find_next<'a>(
        &'a self,
        current: LockedRegion<'a>,
        flags: HeapFlags,
    ) -> Result<LockedRegion<'a>, HeapError> {
        let from = current.guard.base_addr();
        drop(current);

        let _master = lock_flags(&self.master, flags)?;
        self.scan_next_and_lock(from, flags)
    }

    /// Scans for the region with the smallest base address strictly above
    /// `from` that passes the filter. Caller holds the master.
    ///
    /// Candidates that cannot be locked are skipped and the scan keeps
    /// climbing; running out of candidates is `Fatal` regardless of how
    /// many were contended on the way up.
    fn scan_next_and_lock(
        &self,
        mut from: usize,
        flags: HeapFlags,
    ) -> Result<LockedRegion<'_>, HeapError> {
        loop {
            let mut best_index = None;
            let mut best_base = usize::MAX;
            for (index, slot) in self.slots.iter().enumerate() {
                let base = slot.base_addr();
                if base > from && base < best_base {
                    best_base = base;
                    best_index = Some(index);
                }
            }

            let Some(index) = best_index else {
                return Err(HeapError::Fatal);
            };

            from = best_base;
            if let Ok(locked) = self.test_and_lock(index, flags) {
                return Ok(locked);
            }
        }
    }

    /// Reclaims a draining region once its last allocation is gone. Called
    /// by `free` with the region lock held; the lock itself stays valid for
    /// the caller to release.
    pub(crate) fn reap_if_drained(&self, index: usize, region: &mut Region) {
        let slot = &self.slots[index];
        if slot.flags().restricted() && region.nodes_active == 0 {
            debug!("region {index}: drained, retiring slot");
            region.clear();
            slot.retire();
        }
    }

    /// Logs every region and node. Diagnostic; always waits for locks.
    pub fn walk(&self) {
        let _master = self.master.lock();

        for (index, slot) in self.slots.iter().enumerate() {
            let region = slot.state.lock();
            let flags = slot.flags();
            if !flags.active() {
                debug!("walk: region={index} inactive");
                continue;
            }

            debug!(
                "walk: region={index} addr={:#x} size={} free={} nodes_free={} nodes_active={} flags={:#x}",
                region.base_addr(),
                region.size,
                region.free,
                region.nodes_free,
                region.nodes_active,
                flags.into_bits(),
            );

            let mut off = 0;
            while region.contains(off) {
                if off + HEADER_SIZE > region.size || !region.magic_ok(off) {
                    error!("walk: corrupt node at {off:#x} in region {index}");
                    break;
                }
                let Some(end) = region.node_end(off) else {
                    error!("walk: corrupt size at {off:#x} in region {index}");
                    break;
                };
                if end > region.size {
                    error!("walk: node at {off:#x} overruns region {index}");
                    break;
                }

                if region.is_active(off) {
                    debug!(
                        "walk: node={off:#x} active=1 size={} task={} refs={} flags={:#x}",
                        region.node_size(off),
                        region.node_task(off),
                        region.node_refs(off),
                        region.node_flags(off),
                    );
                } else {
                    debug!(
                        "walk: node={off:#x} active=0 size={} next={:#x} prev={:#x}",
                        region.node_size(off),
                        region.next_free(off),
                        region.prev_free(off),
                    );
                }

                off = end;
            }
        }
    }

    /// Snapshots one region's counters. Diagnostic; always waits.
    ///
    /// # Errors
    ///
    /// [`HeapError::Fatal`] when the identity does not name a live region.
    pub fn region_stats(&self, id: RegionId) -> Result<RegionStats, HeapError> {
        let slot = self.slots.get(id.0).ok_or(HeapError::Fatal)?;
        let region = slot.state.lock();
        let flags = slot.flags();
        if !flags.active() {
            return Err(HeapError::Fatal);
        }

        Ok(RegionStats {
            size: region.size,
            free: region.free,
            nodes_free: region.nodes_free,
            nodes_active: region.nodes_active,
            flags,
        })
    }

    /// Audits one region's metadata: the node chain must tile the span
    /// exactly with intact boundary tags, the free list must be
    /// address-ordered and consistently doubly linked, and the counters
    /// must agree with both. Diagnostic; always waits.
    ///
    /// # Errors
    ///
    /// [`HeapError::Fatal`] when the identity does not name a live region or
    /// any check fails.
    pub fn verify(&self, id: RegionId) -> Result<(), HeapError> {
        let slot = self.slots.get(id.0).ok_or(HeapError::Fatal)?;
        let region = slot.state.lock();
        if !slot.flags().active() {
            return Err(HeapError::Fatal);
        }

        audit(&region)
    }
}

/// Full consistency check of one region, under its lock.
fn audit(region: &Region) -> Result<(), HeapError> {
    let mut nodes_active = 0;
    let mut nodes_free = 0;
    let mut free_bytes = 0;

    // The node chain must tile the span exactly.
    let mut off = 0;
    while off < region.size {
        if off + HEADER_SIZE > region.size || !region.magic_ok(off) {
            error!("audit: bad header at {off:#x}");
            return Err(HeapError::Fatal);
        }
        let size = region.node_size(off);
        if !size.is_multiple_of(CHUNK_SIZE) {
            error!("audit: ragged payload size at {off:#x}");
            return Err(HeapError::Fatal);
        }
        let Some(end) = region.node_end(off) else {
            error!("audit: size overflow at {off:#x}");
            return Err(HeapError::Fatal);
        };
        if end > region.size {
            error!("audit: node at {off:#x} overruns the region");
            return Err(HeapError::Fatal);
        }
        if region.footer_magic(off) != MAGIC {
            error!("audit: bad footer magic at {off:#x}");
            return Err(HeapError::Fatal);
        }
        if region.footer_size(off) != size {
            error!("audit: header and footer disagree at {off:#x}");
            return Err(HeapError::Fatal);
        }

        if region.is_active(off) {
            nodes_active += 1;
        } else {
            nodes_free += 1;
            free_bytes += size;
        }
        off = end;
    }
    if off != region.size {
        error!("audit: node chain does not tile the region");
        return Err(HeapError::Fatal);
    }

    if nodes_active != region.nodes_active
        || nodes_free != region.nodes_free
        || free_bytes != region.free
    {
        error!(
            "audit: counters disagree (active {}/{}, free {}/{}, bytes {}/{})",
            nodes_active,
            region.nodes_active,
            nodes_free,
            region.nodes_free,
            free_bytes,
            region.free,
        );
        return Err(HeapError::Fatal);
    }

    // The free list must be ascending and mutually linked.
    let mut prev = NIL;
    let mut seen = 0;
    let mut cursor = region.free_list;
    while cursor != NIL {
        if !region.contains(cursor) || region.is_active(cursor) {
            error!("audit: bad free-list entry at {cursor:#x}");
            return Err(HeapError::Fatal);
        }
        if region.prev_free(cursor) != prev {
            error!("audit: broken back link at {cursor:#x}");
            return Err(HeapError::Fatal);
        }
        if prev != NIL && cursor <= prev {
            error!("audit: free list out of order at {cursor:#x}");
            return Err(HeapError::Fatal);
        }
        seen += 1;
        if seen > nodes_free {
            error!("audit: free list cycles");
            return Err(HeapError::Fatal);
        }
        prev = cursor;
        cursor = region.next_free(cursor);
    }
    if seen != nodes_free {
        error!("audit: free list misses nodes ({seen}/{nodes_free})");
        return Err(HeapError::Fatal);
    }

    Ok(())
}

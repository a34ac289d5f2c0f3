//! A single managed span of backing memory and its in-band node view.
//!
//! All node access happens through byte offsets relative to the region base.
//! The typed header and footer views are computed on the fly; nothing in the
//! region's bookkeeping stores a pointer into the span except the base
//! itself, so the metadata stays valid wherever the backing memory sits.

use crate::node::{
    ACTIVE_BIT, FOOTER_SIZE, HEADER_SIZE, MAGIC, NIL, NodeFooter, NodeHeader,
};
use core::ptr;

/// Bookkeeping for one region. Lives under the region's lock.
///
/// # Invariant
///
/// While a region is live (`size != 0`), `base..base + size` is valid,
/// writable memory owned exclusively by this region, as promised by the
/// caller of `region_add`. Every node access below relies on that promise
/// plus in-bounds offsets, which the walk and free-list code establish
/// before dereferencing.
pub(crate) struct Region {
    /// Base of the backing span. Null while the slot is empty.
    base: *mut u8,
    /// Total bytes in the span.
    pub(crate) size: usize,
    /// Bytes available to future payloads.
    pub(crate) free: usize,
    /// Number of nodes on the free list.
    pub(crate) nodes_free: usize,
    /// Number of allocated nodes.
    pub(crate) nodes_active: usize,
    /// Offset of the lowest free node, or [`NIL`].
    pub(crate) free_list: usize,
}

// Safety: the raw base pointer is only dereferenced while the region's lock
// is held, and the span is exclusively owned per the region_add contract.
unsafe impl Send for Region {}

impl Region {
    /// An empty slot.
    pub(crate) const fn vacant() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
            free: 0,
            nodes_free: 0,
            nodes_active: 0,
            free_list: NIL,
        }
    }

    /// Takes ownership of `base..base + size` and seeds it with one free
    /// node spanning the whole region.
    ///
    /// The caller has validated alignment and size and holds both the master
    /// and this region's lock.
    pub(crate) fn assign(&mut self, base: *mut u8, size: usize) {
        self.base = base;
        self.size = size;
        self.free = size - (HEADER_SIZE + FOOTER_SIZE);
        self.nodes_free = 1;
        self.nodes_active = 0;
        self.free_list = 0;

        let payload = self.free;
        self.set_size(0, payload, false);
        self.set_next_free(0, NIL);
        self.set_prev_free(0, NIL);
        self.header_mut(0).magic = MAGIC;
        self.write_footer(0);
    }

    /// Returns the slot to its vacant state. Called by the drain reaper with
    /// the region lock held.
    pub(crate) fn clear(&mut self) {
        self.base = ptr::null_mut();
        self.size = 0;
        self.free = 0;
        self.nodes_free = 0;
        self.nodes_active = 0;
        self.free_list = NIL;
    }

    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base as usize
    }

    /// Whether `addr` falls inside the region span.
    #[inline]
    pub(crate) fn contains_addr(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.size
    }

    /// Whether a node offset begins inside the region span.
    #[inline]
    pub(crate) fn contains(&self, off: usize) -> bool {
        off < self.size
    }

    // ---- typed views -------------------------------------------------

    #[inline]
    fn header_ptr(&self, off: usize) -> *mut NodeHeader {
        debug_assert!(off + HEADER_SIZE <= self.size);
        // Safety: in-bounds per the region invariant and the assertion above.
        unsafe { self.base.add(off).cast::<NodeHeader>() }
    }

    #[inline]
    fn header(&self, off: usize) -> &NodeHeader {
        // Safety: exclusive access under the region lock.
        unsafe { &*self.header_ptr(off) }
    }

    #[inline]
    fn header_mut(&mut self, off: usize) -> &mut NodeHeader {
        // Safety: exclusive access under the region lock.
        unsafe { &mut *self.header_ptr(off) }
    }

    #[inline]
    fn footer_ptr(&self, node_off: usize) -> *mut NodeFooter {
        let fo = node_off + HEADER_SIZE + self.node_size(node_off);
        debug_assert!(fo + FOOTER_SIZE <= self.size);
        // Safety: in-bounds per the region invariant and the assertion above.
        unsafe { self.base.add(fo).cast::<NodeFooter>() }
    }

    #[inline]
    pub(crate) fn footer_magic(&self, node_off: usize) -> usize {
        // Safety: exclusive access under the region lock.
        unsafe { (*self.footer_ptr(node_off)).magic }
    }

    #[inline]
    pub(crate) fn footer_size(&self, node_off: usize) -> usize {
        // Safety: exclusive access under the region lock.
        unsafe { (*self.footer_ptr(node_off)).size }
    }

    /// Rewrites a node's footer from its header.
    pub(crate) fn write_footer(&mut self, node_off: usize) {
        let size = self.node_size(node_off);
        // Safety: exclusive access under the region lock.
        unsafe {
            let footer = &mut *self.footer_ptr(node_off);
            footer.magic = MAGIC;
            footer.size = size;
        }
    }

    // ---- size word ---------------------------------------------------

    #[inline]
    pub(crate) fn node_size(&self, off: usize) -> usize {
        self.header(off).size & !ACTIVE_BIT
    }

    #[inline]
    pub(crate) fn is_active(&self, off: usize) -> bool {
        self.header(off).size & ACTIVE_BIT != 0
    }

    /// Stores a node's payload size and active flag in one word. Payload
    /// sizes are chunk multiples, so the low bit is free for the flag.
    #[inline]
    pub(crate) fn set_size(&mut self, off: usize, payload: usize, active: bool) {
        debug_assert_eq!(payload & ACTIVE_BIT, 0);
        self.header_mut(off).size = payload | usize::from(active);
    }

    #[inline]
    pub(crate) fn magic_ok(&self, off: usize) -> bool {
        self.header(off).magic == MAGIC
    }

    /// Stamps the owner fields of a freshly allocated node.
    pub(crate) fn set_owner(&mut self, off: usize, task: usize, flags: usize) {
        let header = self.header_mut(off);
        header.task = task;
        header.flags = flags;
        header.refs = 1;
        header.magic = MAGIC;
    }

    #[inline]
    pub(crate) fn node_flags(&self, off: usize) -> usize {
        self.header(off).flags
    }

    #[inline]
    pub(crate) fn node_task(&self, off: usize) -> usize {
        self.header(off).task
    }

    #[inline]
    pub(crate) fn node_refs(&self, off: usize) -> usize {
        self.header(off).refs
    }

    /// Stamps the sentinel into a freshly carved header.
    #[inline]
    pub(crate) fn set_magic(&mut self, off: usize) {
        self.header_mut(off).magic = MAGIC;
    }

    // ---- walking -----------------------------------------------------

    /// Offset of the node following `off`. Only valid for nodes whose tags
    /// have been validated.
    #[inline]
    pub(crate) fn next_offset(&self, off: usize) -> usize {
        off + HEADER_SIZE + self.node_size(off) + FOOTER_SIZE
    }

    /// End offset (exclusive) of the node at `off`, or `None` when the size
    /// word is corrupt enough to overflow. The caller compares the result
    /// against the region size before trusting the node.
    #[inline]
    pub(crate) fn node_end(&self, off: usize) -> Option<usize> {
        off.checked_add(HEADER_SIZE)?
            .checked_add(self.node_size(off))?
            .checked_add(FOOTER_SIZE)
    }

    /// Rewinds to the node preceding `off` via the boundary tag, or `None`
    /// when `off` is the first node or the tag is not trustworthy.
    pub(crate) fn prev_offset(&self, off: usize) -> Option<usize> {
        if off < HEADER_SIZE + FOOTER_SIZE || off > self.size {
            return None;
        }
        let fo = off - FOOTER_SIZE;
        // Safety: fo + FOOTER_SIZE == off <= size; exclusive access under
        // the region lock.
        let footer = unsafe { &*self.base.add(fo).cast::<NodeFooter>() };
        if footer.magic != MAGIC {
            return None;
        }
        let prev = fo.checked_sub(footer.size)?.checked_sub(HEADER_SIZE)?;
        Some(prev)
    }

    // ---- payload -----------------------------------------------------

    #[inline]
    pub(crate) fn payload_ptr(&self, off: usize) -> *mut u8 {
        debug_assert!(off + HEADER_SIZE <= self.size);
        // Safety: in-bounds per the region invariant.
        unsafe { self.base.add(off + HEADER_SIZE) }
    }

    #[inline]
    pub(crate) fn payload_addr(&self, off: usize) -> usize {
        self.base as usize + off + HEADER_SIZE
    }

    /// Zeroes the payload of the node at `off`.
    pub(crate) fn zero_payload(&mut self, off: usize) {
        let size = self.node_size(off);
        // Safety: the payload is in-bounds and exclusively ours under the
        // region lock.
        unsafe {
            ptr::write_bytes(self.payload_ptr(off), 0, size);
        }
    }

    // ---- free list ---------------------------------------------------

    #[inline]
    pub(crate) fn next_free(&self, off: usize) -> usize {
        self.header(off).next
    }

    #[inline]
    pub(crate) fn prev_free(&self, off: usize) -> usize {
        self.header(off).prev
    }

    #[inline]
    pub(crate) fn set_next_free(&mut self, off: usize, value: usize) {
        self.header_mut(off).next = value;
    }

    #[inline]
    pub(crate) fn set_prev_free(&mut self, off: usize, value: usize) {
        self.header_mut(off).prev = value;
    }

    /// Splices `off` into the free list immediately after `after`, or at
    /// the head when `after` is [`NIL`].
    pub(crate) fn splice_after(&mut self, after: usize, off: usize) {
        if after == NIL {
            let head = self.free_list;
            self.set_next_free(off, head);
            self.set_prev_free(off, NIL);
            if head != NIL {
                self.set_prev_free(head, off);
            }
            self.free_list = off;
        } else {
            let next = self.next_free(after);
            self.set_next_free(off, next);
            self.set_prev_free(off, after);
            self.set_next_free(after, off);
            if next != NIL {
                self.set_prev_free(next, off);
            }
        }
    }

    /// Removes `off` from the free list.
    pub(crate) fn unlink_free(&mut self, off: usize) {
        let prev = self.prev_free(off);
        let next = self.next_free(off);
        if prev != NIL {
            self.set_next_free(prev, next);
        }
        if next != NIL {
            self.set_prev_free(next, prev);
        }
        if self.free_list == off {
            self.free_list = next;
        }
    }
}

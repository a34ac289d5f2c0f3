use bitfield_struct::bitfield;

/// Capability and request flags shared by regions, nodes, and callers.
///
/// Bit positions are stable; flag words may be combined with `|`. The same
/// word type is used in three roles:
///
/// - on a **region**, describing the backing memory and its admission policy,
/// - on a **node**, recording the flags the allocation was made with,
/// - on a **request**, selecting a compatible region and the locking mode.
///
/// ### Bit layout
///
/// | Bit | Name | Meaning |
/// |-----|------|---------|
/// | 0 | `internal` | Region backed by internal/SRAM-class memory |
/// | 1 | `nomadic` | Allocation may be migrated |
/// | 2 | `wait` | Caller spins on lock contention |
/// | 3 | `nowait` | Caller fails with `Again` on contention (default) |
/// | 4 | `busy` | Region is being mutated; skip it |
/// | 5 | `restricted` | Region is draining for deletion; skip it |
/// | 6 | `encrypted` | Region sits on an encrypted bus |
/// | 7 | `active` | Region slot is in use |
/// | 8 | `wiped` | Zero the payload on free |
/// | 9 | `subregions` | Region contains subregions (reserved) |
/// | 10 | `small_requests` | Region admits only requests below its threshold |
/// | 11 | `large_requests` | Region admits requests at/above its threshold |
/// | 12 | `natural` | Allocation must be naturally aligned to its size |
#[bitfield(u32)]
pub struct HeapFlags {
    /// Internal/SRAM-class backing memory.
    pub internal: bool,
    /// The allocation may be migrated.
    pub nomadic: bool,
    /// Spin on lock contention instead of failing.
    pub wait: bool,
    /// Fail with `Again` on lock contention. The default behavior; the bit
    /// exists so callers can state it explicitly.
    pub nowait: bool,
    /// The region is being mutated and must be skipped.
    pub busy: bool,
    /// The region is draining for deletion and must be skipped.
    pub restricted: bool,
    /// The region sits on an encrypted bus.
    pub encrypted: bool,
    /// The region slot is in use.
    pub active: bool,
    /// Zero the payload when the allocation is freed.
    pub wiped: bool,
    /// The region contains subregions. Reserved.
    pub subregions: bool,
    /// Only requests below the region threshold are admitted.
    pub small_requests: bool,
    /// Requests at or above the region threshold are admitted.
    pub large_requests: bool,
    /// The allocation must be naturally aligned to its own size.
    pub natural: bool,

    #[bits(19)]
    __: u32,
}

impl HeapFlags {
    /// Bits that match a request to a region's backing memory.
    pub const REGION_MASK: u32 = Self::new()
        .with_wiped(true)
        .with_internal(true)
        .with_encrypted(true)
        .into_bits();

    /// Bits that are meaningful on an individual node.
    pub const NODE_MASK: u32 = Self::new()
        .with_nomadic(true)
        .with_busy(true)
        .with_wiped(true)
        .with_restricted(true)
        .into_bits();

    /// Bits that make a region invisible to searches.
    pub const DONT_USE_MASK: u32 = Self::new()
        .with_restricted(true)
        .with_busy(true)
        .into_bits();

    /// Whether any of the given mask bits are set.
    #[inline]
    #[must_use]
    pub const fn intersects(self, mask: u32) -> bool {
        self.into_bits() & mask != 0
    }

    /// Whether a request selects this region's backing memory.
    ///
    /// A request with no region-mask bits set is a wildcard and matches any
    /// region; otherwise the masked bits must agree exactly.
    #[inline]
    #[must_use]
    pub const fn admits_request(self, request: Self) -> bool {
        let want = request.into_bits() & Self::REGION_MASK;
        want == 0 || want == self.into_bits() & Self::REGION_MASK
    }
}

impl core::ops::BitOr for HeapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

impl core::ops::BitOrAssign for HeapFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_bit_positions() {
        assert_eq!(HeapFlags::new().with_internal(true).into_bits(), 1 << 0);
        assert_eq!(HeapFlags::new().with_wait(true).into_bits(), 1 << 2);
        assert_eq!(HeapFlags::new().with_restricted(true).into_bits(), 1 << 5);
        assert_eq!(HeapFlags::new().with_active(true).into_bits(), 1 << 7);
        assert_eq!(HeapFlags::new().with_wiped(true).into_bits(), 1 << 8);
        assert_eq!(HeapFlags::new().with_natural(true).into_bits(), 1 << 12);
    }

    #[test]
    fn masks_cover_expected_bits() {
        assert_eq!(HeapFlags::REGION_MASK, (1 << 8) | (1 << 0) | (1 << 6));
        assert_eq!(
            HeapFlags::NODE_MASK,
            (1 << 1) | (1 << 4) | (1 << 8) | (1 << 5)
        );
        assert_eq!(HeapFlags::DONT_USE_MASK, (1 << 5) | (1 << 4));
    }

    #[test]
    fn wildcard_request_matches_any_region() {
        let region = HeapFlags::new().with_internal(true).with_active(true);
        assert!(region.admits_request(HeapFlags::new()));
        assert!(region.admits_request(HeapFlags::new().with_wait(true)));
    }

    #[test]
    fn masked_request_must_agree_exactly() {
        let internal = HeapFlags::new().with_internal(true);
        let encrypted = HeapFlags::new().with_encrypted(true);
        assert!(internal.admits_request(internal));
        assert!(!internal.admits_request(encrypted));
        assert!(!encrypted.admits_request(internal | encrypted));
    }

    #[test]
    fn bitor_combines_words() {
        let f = HeapFlags::new().with_internal(true) | HeapFlags::new().with_wait(true);
        assert!(f.internal());
        assert!(f.wait());
        assert!(!f.encrypted());
    }
}

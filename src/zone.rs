//! Zones and reference sets.
//!
//! A zone is the residue class of an address under
//! `(addr >> zone_shift) mod word-width`; the zone shift is chosen at
//! arena creation so that the primary chunk divides into one stripe per
//! zone.  A `RefSet` is a bitmask over zones: the allocator uses it to
//! group allocations with similar lifetimes into the same stripes, and
//! the collector above us uses the same masks to prove the absence of
//! references without scanning.

use crate::Addr;

/// Number of zones; one per bit of a machine word.
pub const WORD_BITS: usize = usize::BITS as usize;

/// log2 of `WORD_BITS`, used when deriving the zone shift.
pub(crate) const WORD_SHIFT: usize = WORD_BITS.trailing_zeros() as usize;

static_assertions::const_assert!(WORD_BITS == 1 << WORD_SHIFT);

/// Returns the zone of `addr` under the given shift.
#[inline]
pub fn zone_of_addr(zone_shift: usize, addr: Addr) -> usize {
    (addr >> zone_shift) & (WORD_BITS - 1)
}

/// A set of zones, represented as one bit per zone.
///
/// All the set algebra is O(1); `of_range` is O(word width) at worst.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefSet(usize);

impl RefSet {
    pub const EMPTY: RefSet = RefSet(0);
    pub const UNIV: RefSet = RefSet(usize::MAX);

    /// The set containing exactly `zone`.
    #[inline]
    pub fn single(zone: usize) -> RefSet {
        assert!(zone < WORD_BITS, "zone {} out of range", zone);
        RefSet(1 << zone)
    }

    /// The set containing the zone of `addr`.
    #[inline]
    pub fn of_addr(zone_shift: usize, addr: Addr) -> RefSet {
        RefSet(1 << zone_of_addr(zone_shift, addr))
    }

    /// The union of the zones of every address in `[base, limit)`.
    ///
    /// Zones are periodic in the address space, so a range spanning at
    /// least `WORD_BITS` stripes saturates to the universal set.
    pub fn of_range(zone_shift: usize, base: Addr, limit: Addr) -> RefSet {
        assert!(base < limit, "empty or inverted range");

        let stripe_base = base >> zone_shift;
        let stripe_top = (limit - 1) >> zone_shift;
        if stripe_top - stripe_base >= WORD_BITS - 1 {
            return RefSet::UNIV;
        }

        let zbase = stripe_base & (WORD_BITS - 1);
        let ztop = stripe_top & (WORD_BITS - 1);
        if zbase <= ztop {
            RefSet(bits_from_to(zbase, ztop))
        } else {
            // The range wraps past zone WORD_BITS - 1 back to zone 0.
            RefSet(bits_from_to(zbase, WORD_BITS - 1) | bits_from_to(0, ztop))
        }
    }

    #[inline]
    pub fn union(self, other: RefSet) -> RefSet {
        RefSet(self.0 | other.0)
    }

    #[inline]
    pub fn inter(self, other: RefSet) -> RefSet {
        RefSet(self.0 & other.0)
    }

    /// Set difference: the zones of `self` not in `other`.
    #[inline]
    pub fn diff(self, other: RefSet) -> RefSet {
        RefSet(self.0 & !other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains_zone(self, zone: usize) -> bool {
        assert!(zone < WORD_BITS, "zone {} out of range", zone);
        self.0 & (1 << zone) != 0
    }

    #[inline]
    pub fn contains_addr(self, zone_shift: usize, addr: Addr) -> bool {
        self.0 & (1 << zone_of_addr(zone_shift, addr)) != 0
    }

    /// True iff every zone of `self` is also in `other`.
    #[inline]
    pub fn is_subset(self, other: RefSet) -> bool {
        self.0 & !other.0 == 0
    }
}

/// Mask with bits `lo..=hi` set.
#[inline]
fn bits_from_to(lo: usize, hi: usize) -> usize {
    debug_assert!(lo <= hi && hi < WORD_BITS);
    let upper = if hi == WORD_BITS - 1 {
        usize::MAX
    } else {
        (1 << (hi + 1)) - 1
    };
    upper & !((1 << lo) - 1)
}

impl std::fmt::Debug for RefSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RefSet({:#018x})", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    const SHIFT: usize = 20;

    #[test]
    fn zones_are_periodic() {
        let stripe = 1usize << SHIFT;
        assert_eq!(zone_of_addr(SHIFT, 0), 0);
        assert_eq!(zone_of_addr(SHIFT, stripe - 1), 0);
        assert_eq!(zone_of_addr(SHIFT, stripe), 1);
        assert_eq!(zone_of_addr(SHIFT, 3 * stripe + 17), 3);
        assert_eq!(zone_of_addr(SHIFT, WORD_BITS * stripe), 0);
    }

    // Small integers land in zone 0 and all-ones in the top zone; this
    // is why those two zones are blacklisted by default.
    #[test]
    fn ambiguous_patterns() {
        assert_eq!(zone_of_addr(SHIFT, 1), 0);
        assert_eq!(zone_of_addr(SHIFT, usize::MAX), WORD_BITS - 1);
    }

    #[test]
    fn algebra() {
        let a = RefSet::single(3).union(RefSet::single(5));
        let b = RefSet::single(5).union(RefSet::single(7));

        assert_eq!(a.inter(b), RefSet::single(5));
        assert_eq!(a.diff(b), RefSet::single(3));
        assert!(a.diff(a).is_empty());
        assert!(a.is_subset(RefSet::UNIV));
        assert!(RefSet::EMPTY.is_subset(a));
        assert!(!a.is_subset(b));
        assert!(a.contains_zone(3));
        assert!(!a.contains_zone(4));
    }

    #[test]
    fn of_range_single_stripe() {
        let stripe = 1usize << SHIFT;
        let rs = RefSet::of_range(SHIFT, 3 * stripe, 4 * stripe);
        assert_eq!(rs, RefSet::single(3));
    }

    #[test]
    fn of_range_crosses_stripes() {
        let stripe = 1usize << SHIFT;
        let rs = RefSet::of_range(SHIFT, 3 * stripe + 8, 5 * stripe + 8);
        assert_eq!(
            rs,
            RefSet::single(3).union(RefSet::single(4)).union(RefSet::single(5))
        );
    }

    #[test]
    fn of_range_wraps() {
        let stripe = 1usize << SHIFT;
        let top = (WORD_BITS - 1) * stripe;
        let rs = RefSet::of_range(SHIFT, top, top + 2 * stripe);
        assert_eq!(rs, RefSet::single(WORD_BITS - 1).union(RefSet::single(0)));
    }

    #[test]
    fn of_range_saturates() {
        let stripe = 1usize << SHIFT;
        assert_eq!(
            RefSet::of_range(SHIFT, 0, WORD_BITS * stripe),
            RefSet::UNIV
        );
        assert_eq!(
            RefSet::of_range(SHIFT, 17, 200 * stripe),
            RefSet::UNIV
        );
    }

    proptest! {
        // Every address in a range is a member of the range's RefSet.
        #[test]
        fn of_range_covers_members(base in 0usize..(1 << 40),
                                   len in 1usize..(1 << 24),
                                   probe in 0usize..(1 << 24)) {
            let limit = base + len;
            let rs = RefSet::of_range(SHIFT, base, limit);
            let addr = base + probe % len;
            prop_assert!(rs.contains_addr(SHIFT, addr));
        }

        // Union is exact: an address outside the range whose zone is not
        // spanned must not be a member, unless the set saturated.
        #[test]
        fn of_range_is_union_of_zones(base in 0usize..(1 << 40),
                                      len in 1usize..(1 << 24)) {
            let limit = base + len;
            let rs = RefSet::of_range(SHIFT, base, limit);

            let mut expected = RefSet::EMPTY;
            let stripe = 1usize << SHIFT;
            let mut cursor = base;
            while cursor < limit {
                expected = expected.union(RefSet::of_addr(SHIFT, cursor));
                match cursor.checked_add(stripe) {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            expected = expected.union(RefSet::of_addr(SHIFT, limit - 1));
            prop_assert_eq!(rs, expected);
        }
    }
}

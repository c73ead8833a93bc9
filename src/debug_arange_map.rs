//! This module tracks metadata about reserved and committed address
//! ranges in debug builds.  The mapper contracts call into it so any
//! mismatch between the arena's accounting and the mappings it
//! actually made shows up as a contract failure.
use std::collections::BTreeMap;
use std::sync::Mutex;

struct AddressRange {
    /// The range of address space reserved.
    begin: usize,
    size: usize,

    /// Committed subranges, begin -> size.  Non-overlapping, but not
    /// necessarily coalesced.
    committed: BTreeMap<usize, usize>,
}

lazy_static::lazy_static! {
    static ref ADDRESS_RANGE_MAP: Mutex<BTreeMap<usize, AddressRange>> = Default::default();
}

fn with_reservation<T>(
    ptr: usize,
    f: impl FnOnce(&mut AddressRange) -> Result<T, &'static str>,
) -> Result<T, &'static str> {
    let mut map = ADDRESS_RANGE_MAP.lock().unwrap();
    let entry = map
        .range_mut(0..=ptr)
        .last()
        .map(|x| x.1)
        .ok_or("Parent range not found")?;
    if ptr >= entry.begin + entry.size {
        return Err("Address past its parent range");
    }
    f(entry)
}

/// Registers a new reserved range.  It must not overlap with any other
/// registered range.
pub fn reserve_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if usize::MAX - begin < size {
        return Err("Address is too high.");
    }

    let mut map = ADDRESS_RANGE_MAP.lock().unwrap();

    // Make sure nothing overlaps with the new range.
    for (_, info) in map.range(0..=(begin + size)).rev() {
        // We're walking reservations from the top down.  If the
        // current one is too high, keep looking.
        if info.begin >= begin + size {
            continue;
        }

        // If the current reservation is too low, stop.
        if begin >= info.begin + info.size {
            break;
        }

        return Err("Reservations overlap");
    }

    map.insert(
        begin,
        AddressRange {
            begin,
            size,
            committed: BTreeMap::new(),
        },
    );
    Ok(())
}

/// A range is releasable iff it is exactly one whole reservation;
/// the arena never releases partial reservations.
pub fn releasable_range(begin: usize, size: usize) -> Result<(), &'static str> {
    let map = ADDRESS_RANGE_MAP.lock().unwrap();
    let reserved = map.get(&begin).ok_or("Reservation not found")?;

    if reserved.size != size {
        return Err("Release does not cover the whole reservation");
    }
    Ok(())
}

/// Unregisters a whole reservation, committed subranges included.
pub fn release_range(begin: usize, size: usize) -> Result<(), &'static str> {
    releasable_range(begin, size)?;

    let mut map = ADDRESS_RANGE_MAP.lock().unwrap();
    map.remove(&begin);
    Ok(())
}

/// A range may be committed iff it lies in one reservation and does
/// not overlap anything already committed.
pub fn can_commit_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    with_reservation(begin, |reserved| {
        if begin + size > reserved.begin + reserved.size {
            return Err("Commit overflows its reservation");
        }

        for (&sub_begin, &sub_size) in reserved.committed.range(0..begin + size).rev() {
            if sub_begin + sub_size <= begin {
                break;
            }
            return Err("Commit overlaps an already-committed range");
        }
        Ok(())
    })
}

/// Marks a new committed subrange in a previously reserved range.
pub fn commit_range(begin: usize, size: usize) -> Result<(), &'static str> {
    can_commit_range(begin, size)?;

    with_reservation(begin, |reserved| {
        reserved.committed.insert(begin, size);
        Ok(())
    })
}

/// A range may be uncommitted iff every byte of it is committed.
pub fn can_uncommit_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    with_reservation(begin, |reserved| {
        let mut cursor = begin;
        for (&sub_begin, &sub_size) in reserved.committed.range(0..begin + size) {
            if sub_begin + sub_size <= cursor {
                continue;
            }
            if sub_begin > cursor {
                return Err("Uncommit covers an uncommitted gap");
            }
            cursor = sub_begin + sub_size;
            if cursor >= begin + size {
                break;
            }
        }
        if cursor < begin + size {
            return Err("Uncommit runs past the committed ranges");
        }
        Ok(())
    })
}

/// Removes `[begin, begin + size)` from the committed subranges,
/// splitting any range it partially covers.
pub fn uncommit_range(begin: usize, size: usize) -> Result<(), &'static str> {
    can_uncommit_range(begin, size)?;

    with_reservation(begin, |reserved| {
        let end = begin + size;
        let overlapping: Vec<usize> = reserved
            .committed
            .range(0..end)
            .filter(|&(&sub_begin, &sub_size)| sub_begin + sub_size > begin)
            .map(|(&sub_begin, _)| sub_begin)
            .collect();

        for sub_begin in overlapping {
            let sub_size = reserved.committed.remove(&sub_begin).expect("key just seen");
            let sub_end = sub_begin + sub_size;
            if sub_begin < begin {
                reserved.committed.insert(sub_begin, begin - sub_begin);
            }
            if sub_end > end {
                reserved.committed.insert(end, sub_end - end);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commit_uncommit_split_and_merge() {
        // Use impossible (page-misaligned, far away) addresses so the
        // entries never collide with real mapper traffic.
        let base = 0x7777_0000_0001usize;

        assert!(reserve_range(base, 0x10000).is_ok());
        assert!(reserve_range(base + 0x8000, 0x1000).is_err());

        assert!(commit_range(base + 0x1000, 0x4000).is_ok());
        assert!(commit_range(base + 0x5000, 0x1000).is_ok());
        assert!(commit_range(base + 0x2000, 0x1000).is_err());

        // Uncommitting across both adjacent entries works.
        assert!(can_uncommit_range(base + 0x2000, 0x3000).is_ok());
        assert!(uncommit_range(base + 0x2000, 0x3000).is_ok());
        // The tails survive.
        assert!(uncommit_range(base + 0x1000, 0x1000).is_ok());
        assert!(uncommit_range(base + 0x5000, 0x1000).is_ok());
        assert!(can_uncommit_range(base + 0x1000, 0x1000).is_err());

        assert!(releasable_range(base, 0x8000).is_err());
        assert!(release_range(base, 0x10000).is_ok());
        assert!(release_range(base, 0x10000).is_err());
    }
}

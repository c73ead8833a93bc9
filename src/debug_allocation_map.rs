//! This module tracks the arena allocations (tract ranges and their
//! owning pools) in debug builds, to catch double allocation, double
//! free, and frees that cross pools.
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::pool::Pool;

lazy_static::lazy_static! {
    // base -> (owning pool, size)
    static ref ALLOCATION_MAP: Mutex<BTreeMap<usize, (Pool, usize)>> = Default::default();
}

/// Registers a fresh allocation; it must not overlap any live one.
pub fn mark_allocated(pool: Pool, base: usize, size: usize) -> Result<(), &'static str> {
    if size > usize::MAX - base {
        return Err("Range too large");
    }

    let mut map = ALLOCATION_MAP.lock().unwrap();

    if let Some((&prev_base, &(_, prev_size))) = map.range(0..=base).last() {
        if prev_base + prev_size > base {
            return Err("Allocation overlaps a live allocation below it");
        }
    }
    if let Some((&next_base, _)) = map.range(base..).next() {
        if base + size > next_base {
            return Err("Allocation overlaps a live allocation above it");
        }
    }

    map.insert(base, (pool, size));
    Ok(())
}

/// Unregisters `[base, base + size)`.  The range must lie in a single
/// live allocation of the same pool; freeing a subrange splits the
/// remainder.
pub fn mark_released(pool: Pool, base: usize, size: usize) -> Result<(), &'static str> {
    if size == 0 || size > usize::MAX - base {
        return Err("Bad release size");
    }

    let mut map = ALLOCATION_MAP.lock().unwrap();

    let (&entry_base, &(entry_pool, entry_size)) = map
        .range(0..=base)
        .last()
        .ok_or("Released range was never allocated")?;
    if entry_base + entry_size <= base {
        return Err("Released range was never allocated");
    }
    if base + size > entry_base + entry_size {
        return Err("Released range overruns its allocation");
    }
    if entry_pool != pool {
        return Err("Released range belongs to another pool");
    }

    map.remove(&entry_base);
    if entry_base < base {
        map.insert(entry_base, (entry_pool, base - entry_base));
    }
    if base + size < entry_base + entry_size {
        map.insert(base + size, (entry_pool, entry_base + entry_size - (base + size)));
    }
    Ok(())
}

/// Drops the entry containing `addr`, if any.  Arena teardown uses
/// this so a later arena reusing the address space starts clean.
pub fn forget_containing(addr: usize) {
    let mut map = ALLOCATION_MAP.lock().unwrap();

    if let Some((&entry_base, &(_, entry_size))) = map.range(0..=addr).last() {
        if entry_base + entry_size > addr {
            map.remove(&entry_base);
        }
    }
}

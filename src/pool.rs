//! Pool handles.
//!
//! The pool classes themselves live above the arena; down here a pool
//! is an owner token that tracts point back at.  Allocation and free
//! calls must present matching `Pool` handles, and the arena checks
//! this invariant to help detect bugs.  Handles are per-arena: the
//! registry hangs off the arena, and an id is the position of its
//! record plus one.

use std::num::NonZeroU32;

/// External callers interact with arena pools via this opaque Pool
/// struct.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Pool {
    id: NonZeroU32,
}

/// The arena stores internal information about created pools with this
/// Info struct.
pub(crate) struct PoolInfo {
    pub name: Option<String>,
}

impl Pool {
    /// Returns the pool handle for the record at `index` in an arena's
    /// registry.
    pub(crate) fn from_index(index: usize) -> Pool {
        assert!(index < u32::MAX as usize, "too many pools");
        Pool {
            id: NonZeroU32::new(index as u32 + 1).expect("index + 1 is positive"),
        }
    }

    /// Position of this pool's record in its arena's registry.
    ///
    /// This operation is the inverse of `Pool::from_index`.
    pub(crate) fn index(self) -> usize {
        self.id.get() as usize - 1
    }

    /// Returns the `Pool`'s underlying `NonZeroU32` id.
    pub fn id(self) -> NonZeroU32 {
        self.id
    }
}

#[test]
fn index_round_trips() {
    for index in [0usize, 1, 17, 4096] {
        let pool = Pool::from_index(index);
        assert_eq!(pool.index(), index);
        assert_eq!(pool.id().get() as usize, index + 1);
    }
}

//! Page descriptors and tracts.
//!
//! Every page of a chunk has a descriptor in the chunk's (lazily
//! mapped) page table.  A free page carries nothing; a latent page is
//! free but still OS-mapped, and threads through the arena's hysteresis
//! ring via index links; an allocated page carries its tract.

use crate::pool::Pool;
use crate::Addr;

/// Names one page of one chunk.  Ring links are stored as these
/// indices, never as pointers, so descriptors stay trivially copyable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PageRef {
    pub chunk: u32,
    pub page: u32,
}

impl PageRef {
    pub(crate) fn new(chunk: usize, page: usize) -> PageRef {
        assert!(chunk <= u32::MAX as usize && page <= u32::MAX as usize);
        PageRef {
            chunk: chunk as u32,
            page: page as u32,
        }
    }
}

/// A single page handed out to a pool; the unit of arena allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Tract {
    base: Addr,
    pool: Pool,
}

impl Tract {
    pub(crate) fn new(pool: Pool, base: Addr) -> Tract {
        Tract { base, pool }
    }

    /// Base address of the page this tract occupies.
    #[inline]
    pub fn base(&self) -> Addr {
        self.base
    }

    /// The pool this tract was allocated to.
    #[inline]
    pub fn pool(&self) -> Pool {
        self.pool
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum PageDesc {
    Free,
    Latent { prev: PageRef, next: PageRef },
    Allocated(Tract),
}

// The page table must stay cheap: one descriptor per page of address
// space, mapped on demand.
static_assertions::const_assert!(std::mem::size_of::<PageDesc>() <= 32);

impl PageDesc {
    #[inline]
    pub(crate) fn is_latent(&self) -> bool {
        matches!(self, PageDesc::Latent { .. })
    }

    #[inline]
    pub(crate) fn tract(&self) -> Option<Tract> {
        match self {
            PageDesc::Allocated(tract) => Some(*tract),
            _ => None,
        }
    }
}

//! Chunks.
//!
//! A chunk is one contiguous virtual-memory reservation together with
//! its own bookkeeping: a page-descriptor table and three bit tables.
//! The reservation is laid out as
//!
//! - bit tables, boot-allocated at the base and mapped eagerly,
//! - the page-descriptor table, page-aligned and mapped *lazily* one
//!   table page at a time (a large reservation would otherwise pay for
//!   descriptors it never touches),
//! - the usable pages.
//!
//! The prefix consumed by the tables is the chunk's *ullage*; those
//! pages are never handed out as tracts.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::arena::ArenaError;
use crate::arith::{align_up, div_ceil, is_aligned};
use crate::bit_table::BitTable;
use crate::boot::BootBlock;
use crate::mapper::Mapper;
use crate::page::PageDesc;
use crate::Addr;

const DESC_SIZE: usize = std::mem::size_of::<PageDesc>();

pub(crate) struct Chunk {
    mapper: &'static dyn Mapper,
    base: Addr,
    limit: Addr,
    page_size: usize,
    pages: usize,
    ullage_pages: usize,
    /// Bytes of this chunk currently committed.
    mapped: usize,
    page_table: NonNull<PageDesc>,
    page_table_pages: usize,
    pub(crate) alloc_table: BitTable,
    pub(crate) table_mapped: BitTable,
    pub(crate) no_latent: BitTable,
}

// All chunk state is reached through the arena lock; the raw pointers
// refer to the chunk's own reservation.
unsafe impl Send for Chunk {}

/// Releases the reservation if chunk initialization bails out early.
struct ReservationGuard {
    mapper: &'static dyn Mapper,
    base: NonNull<c_void>,
    size: usize,
    armed: bool,
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.mapper.release(self.base, self.size);
        }
    }
}

impl Chunk {
    /// Reserves roughly `size` bytes of address space and initializes
    /// the chunk's tables inside it, committing only the table prefix.
    ///
    /// `committed` is the owning arena's commit accounting; the prefix
    /// mapping is charged against it and checked against
    /// `commit_limit`.
    pub(crate) fn create(
        mapper: &'static dyn Mapper,
        size: usize,
        committed: &mut usize,
        commit_limit: usize,
    ) -> Result<Chunk, ArenaError> {
        assert!(size > 0);
        let page_size = mapper.page_size();
        let size = align_up(size, page_size);

        let (region, actual) = mapper.reserve(size).map_err(|_| ArenaError::Resource)?;
        let mut guard = ReservationGuard {
            mapper,
            base: region,
            size: actual,
            armed: true,
        };

        let base = region.as_ptr() as Addr;
        let limit = base + actual;
        let pages = actual / page_size;
        assert!(pages <= u32::MAX as usize, "chunk too large for page refs");

        let table_bytes = pages.checked_mul(DESC_SIZE).ok_or(ArenaError::Memory)?;
        let page_table_pages = div_ceil(table_bytes, page_size);

        let mut boot = BootBlock::new(base, limit);
        let word_align = std::mem::align_of::<usize>();
        let alloc_table_at = boot.alloc(BitTable::byte_size(pages), word_align)?;
        let table_mapped_at = boot.alloc(BitTable::byte_size(page_table_pages), word_align)?;
        let no_latent_at = boot.alloc(BitTable::byte_size(page_table_pages), word_align)?;
        // The descriptor table is page-aligned so it can be mapped and
        // unmapped one table page at a time.
        let page_table_at = boot.alloc(table_bytes, page_size)?;

        let ullage_pages = align_up(boot.allocated(), page_size) / page_size;
        if ullage_pages >= pages {
            return Err(ArenaError::Memory);
        }

        // Commit the prefix holding the bit tables; the descriptor
        // table beyond it stays unmapped until someone needs it.
        let prefix = page_table_at - base;
        let new_committed = committed.checked_add(prefix).ok_or(ArenaError::CommitLimit)?;
        if new_committed > commit_limit {
            return Err(ArenaError::CommitLimit);
        }
        mapper
            .commit(region, prefix)
            .map_err(|_| ArenaError::Resource)?;
        *committed = new_committed;

        let alloc_table = unsafe {
            BitTable::from_raw(
                NonNull::new(alloc_table_at as *mut u8).expect("inside the reservation"),
                pages,
            )
        };
        let table_mapped = unsafe {
            BitTable::from_raw(
                NonNull::new(table_mapped_at as *mut u8).expect("inside the reservation"),
                page_table_pages,
            )
        };
        let mut no_latent = unsafe {
            BitTable::from_raw(
                NonNull::new(no_latent_at as *mut u8).expect("inside the reservation"),
                page_table_pages,
            )
        };
        no_latent.set_range(0, page_table_pages);

        guard.armed = false;
        log::debug!(
            "chunk [{:#x}, {:#x}): {} pages, {} ullage, {} table pages",
            base,
            limit,
            pages,
            ullage_pages,
            page_table_pages
        );

        Ok(Chunk {
            mapper,
            base,
            limit,
            page_size,
            pages,
            ullage_pages,
            mapped: prefix,
            page_table: NonNull::new(page_table_at as *mut PageDesc)
                .expect("inside the reservation"),
            page_table_pages,
            alloc_table,
            table_mapped,
            no_latent,
        })
    }

    /// Releases the whole reservation, committed parts included, and
    /// settles the owning arena's commit accounting.
    pub(crate) fn destroy(self, committed: &mut usize) {
        assert!(self.mapped <= *committed);
        *committed -= self.mapped;
        self.mapper
            .release(
                NonNull::new(self.base as *mut c_void).expect("chunk base is non-null"),
                self.limit - self.base,
            )
            .expect("releasing a chunk reservation must succeed");
    }

    #[inline]
    pub(crate) fn base(&self) -> Addr {
        self.base
    }

    #[inline]
    pub(crate) fn limit(&self) -> Addr {
        self.limit
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub(crate) fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    pub(crate) fn ullage_pages(&self) -> usize {
        self.ullage_pages
    }

    #[inline]
    pub(crate) fn page_table_pages(&self) -> usize {
        self.page_table_pages
    }

    #[inline]
    pub(crate) fn mapped(&self) -> usize {
        self.mapped
    }

    pub(crate) fn add_mapped(&mut self, bytes: usize) {
        self.mapped += bytes;
    }

    pub(crate) fn sub_mapped(&mut self, bytes: usize) {
        assert!(bytes <= self.mapped);
        self.mapped -= bytes;
    }

    #[inline]
    pub(crate) fn contains(&self, addr: Addr) -> bool {
        self.base <= addr && addr < self.limit
    }

    #[inline]
    pub(crate) fn page_base(&self, index: usize) -> Addr {
        debug_assert!(index <= self.pages);
        self.base + index * self.page_size
    }

    #[inline]
    pub(crate) fn index_of_addr(&self, addr: Addr) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.base) / self.page_size
    }

    #[inline]
    pub(crate) fn size_to_pages(&self, size: usize) -> usize {
        debug_assert!(is_aligned(size, self.page_size));
        size / self.page_size
    }

    // -- Page-descriptor table geometry -------------------------------

    #[inline]
    fn table_addr(&self) -> Addr {
        self.page_table.as_ptr() as Addr
    }

    /// Base address of table page `tp`.
    #[inline]
    pub(crate) fn table_page_base(&self, tp: usize) -> Addr {
        debug_assert!(tp <= self.page_table_pages);
        self.table_addr() + tp * self.page_size
    }

    /// Index of the first descriptor falling (at least partially) on
    /// table page `tp`.
    #[inline]
    pub(crate) fn tp_base_index(&self, tp: usize) -> usize {
        (tp * self.page_size) / DESC_SIZE
    }

    /// Index of the first descriptor wholly on table page `tp`.
    #[inline]
    pub(crate) fn tp_whole_base_index(&self, tp: usize) -> usize {
        (tp * self.page_size + DESC_SIZE - 1) / DESC_SIZE
    }

    /// Index of the first descriptor falling wholly on the table page
    /// after `tp`.
    #[inline]
    pub(crate) fn tp_limit_index(&self, tp: usize) -> usize {
        (tp * self.page_size + self.page_size - 1) / DESC_SIZE + 1
    }

    /// Index of the first descriptor falling (at least partially) on
    /// the table page after `tp`.
    #[inline]
    pub(crate) fn tp_whole_limit_index(&self, tp: usize) -> usize {
        (tp * self.page_size + self.page_size) / DESC_SIZE
    }

    /// The range of table pages holding the descriptors for pages
    /// `[page_base, page_limit)`.
    pub(crate) fn table_pages_used(&self, page_base: usize, page_limit: usize) -> (usize, usize) {
        debug_assert!(page_base <= page_limit && page_limit <= self.pages);
        (
            (page_base * DESC_SIZE) / self.page_size,
            div_ceil(page_limit * DESC_SIZE, self.page_size),
        )
    }

    /// True iff every table page holding page `index`'s descriptor is
    /// mapped, i.e. the descriptor may be read.
    pub(crate) fn desc_mapped(&self, index: usize) -> bool {
        let (tb, tl) = self.table_pages_used(index, index + 1);
        // A descriptor spans at most two table pages.
        debug_assert!(tl - tb <= 2);
        (tb..tl).all(|tp| self.table_mapped.test(tp))
    }

    #[inline]
    fn desc_ptr(&self, index: usize) -> *mut PageDesc {
        debug_assert!(index < self.pages);
        unsafe { self.page_table.as_ptr().add(index) }
    }

    /// Reads page `index`'s descriptor; its table pages must be mapped.
    #[inline]
    pub(crate) fn page(&self, index: usize) -> PageDesc {
        debug_assert!(self.desc_mapped(index));
        unsafe { *self.desc_ptr(index) }
    }

    /// Writes page `index`'s descriptor; its table pages must be mapped.
    #[inline]
    pub(crate) fn set_page(&mut self, index: usize, desc: PageDesc) {
        debug_assert!(self.desc_mapped(index));
        unsafe { *self.desc_ptr(index) = desc }
    }

    /// Is the free page `index` still OS-mapped?  True exactly for
    /// latent pages whose descriptor storage is present; allocation
    /// uses this to skip the map call.
    pub(crate) fn page_is_mapped(&self, index: usize) -> bool {
        if !self.desc_mapped(index) {
            return false;
        }
        match self.page(index) {
            PageDesc::Latent { .. } => true,
            PageDesc::Free => false,
            PageDesc::Allocated(_) => panic!("allocated page {} in a free run", index),
        }
    }

    /// Is any descriptor on table page `tp` (even partially) in use by
    /// an allocated page?
    pub(crate) fn table_page_in_use(&self, tp: usize) -> bool {
        debug_assert!(tp < self.page_table_pages);
        let base = self.tp_base_index(tp);
        // The last table page may hold only the tail of the table.
        let last_tp = (self.pages * DESC_SIZE) / self.page_size;
        let limit = if tp == last_tp {
            self.pages
        } else {
            self.tp_limit_index(tp)
        };
        !self.alloc_table.is_res_range(base, limit.min(self.pages))
    }

    /// Searches `[base, limit)` for a free run of `size` bytes in the
    /// allocation table; returns the page index of the run's base.
    pub(crate) fn find_free_in_area(
        &self,
        size: usize,
        base: Addr,
        limit: Addr,
        downwards: bool,
    ) -> Option<usize> {
        assert!(is_aligned(base, self.page_size));
        assert!(is_aligned(limit, self.page_size));
        assert!(self.base <= base && base < limit && limit <= self.limit);
        assert!(size > 0 && is_aligned(size, self.page_size));
        assert!(size <= limit - base);

        let base_page = (base - self.base) / self.page_size;
        let limit_page = (limit - self.base) / self.page_size;
        let pages = self.size_to_pages(size);

        if downwards {
            self.alloc_table
                .find_short_res_range_high(base_page, limit_page, pages)
        } else {
            self.alloc_table
                .find_short_res_range(base_page, limit_page, pages)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::get_mapper;

    fn chunk_of(size: usize) -> (Chunk, usize) {
        let mapper = get_mapper(None).expect("default mapper exists");
        let mut committed = 0;
        let chunk =
            Chunk::create(mapper, size, &mut committed, usize::MAX).expect("chunk should build");
        (chunk, committed)
    }

    #[test]
    fn layout_smoke_test() {
        let (chunk, committed) = chunk_of(16 << 20);
        let page = chunk.page_size();

        assert_eq!(chunk.limit() - chunk.base(), 16 << 20);
        assert_eq!(chunk.pages(), (16 << 20) / page);
        assert_eq!(committed, chunk.mapped());

        // Ullage covers the bit tables and the descriptor table, and
        // only the bit-table prefix is committed.
        assert!(chunk.ullage_pages() > chunk.page_table_pages());
        assert!(chunk.mapped() < chunk.ullage_pages() * page);
        assert!(chunk.table_mapped.is_res_range(0, chunk.page_table_pages()));
        assert!(!chunk.no_latent.is_res_range(0, chunk.page_table_pages()));
        assert!(chunk.alloc_table.is_res_range(0, chunk.pages()));

        let mut committed = committed;
        chunk.destroy(&mut committed);
        assert_eq!(committed, 0);
    }

    #[test]
    fn page_addressing_round_trips() {
        let (chunk, mut committed) = chunk_of(4 << 20);
        let page = chunk.page_size();

        for index in [0, 1, chunk.ullage_pages(), chunk.pages() - 1] {
            let base = chunk.page_base(index);
            assert!(chunk.contains(base));
            assert_eq!(chunk.index_of_addr(base), index);
            assert_eq!(chunk.index_of_addr(base + page - 1), index);
        }
        assert!(!chunk.contains(chunk.limit()));

        chunk.destroy(&mut committed);
    }

    #[test]
    fn table_geometry_is_consistent() {
        let (chunk, mut committed) = chunk_of(64 << 20);

        let (tb, tl) = chunk.table_pages_used(0, chunk.pages());
        assert_eq!(tb, 0);
        assert_eq!(tl, chunk.page_table_pages());

        for tp in [0, 1, chunk.page_table_pages() - 1] {
            // Whole-descriptor bounds nest inside partial bounds.
            assert!(chunk.tp_base_index(tp) <= chunk.tp_whole_base_index(tp));
            assert!(chunk.tp_whole_limit_index(tp) <= chunk.tp_limit_index(tp));
            // Adjacent table pages tile the descriptor indices.
            assert_eq!(chunk.tp_base_index(tp + 1), chunk.tp_whole_limit_index(tp));
        }

        // Any single page's descriptors fit in at most two table pages.
        for index in [0, 7, chunk.pages() - 1] {
            let (a, b) = chunk.table_pages_used(index, index + 1);
            assert!(b - a <= 2);
            assert!(b <= chunk.page_table_pages());
        }

        chunk.destroy(&mut committed);
    }
}

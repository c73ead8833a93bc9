//! The arena: owner of a set of chunks, the page-grained allocator
//! over them, and the hysteresis fund of latent pages.
//!
//! All operations are serialized under one lock; the public `Arena`
//! handle is a thin wrapper that takes it.  Multiple arenas per process
//! are fine: nothing here is a singleton.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use thiserror::Error;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map;

use crate::arith::{floor_log2, is_aligned};
use crate::chain::{Chain, ChainId, GenParams};
use crate::chunk::Chunk;
use crate::config;
use crate::mapper::{get_mapper, Mapper};
use crate::page::{PageDesc, PageRef, Tract};
use crate::policy::{pref_gen, SegPref};
use crate::pool::{Pool, PoolInfo};
use crate::zone::{RefSet, WORD_BITS, WORD_SHIFT};
use crate::Addr;

/// Distinct generation reference sets the arena tracks.
pub const GEN_COUNT: usize = WORD_BITS / 2;

/// The recoverable failures of the arena interface.  Contract
/// violations (misalignment, foreign pools, out-of-range addresses)
/// are not errors: they assert.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ArenaError {
    /// Unspecified internal failure.
    #[error("operation failed")]
    Fail,
    /// Address space or backing store exhausted.
    #[error("address space exhausted")]
    Resource,
    /// A heap-side allocation failed, or the reservation cannot hold
    /// its own bookkeeping.
    #[error("out of memory")]
    Memory,
    /// Allocating would exceed the arena's commit limit.
    #[error("commit limit exceeded")]
    CommitLimit,
    /// A parameter is outside the operation's domain.
    #[error("invalid parameter")]
    Param,
}

/// Arena classes: `Vm` applies the zoned allocation policy, `VmNz` is
/// the same arena without zone discipline (it searches the universal
/// set and never grows).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArenaClass {
    Vm,
    VmNz,
}

pub struct Arena {
    inner: Mutex<ArenaInner>,
}

pub(crate) struct ArenaInner {
    pub(crate) class: ArenaClass,
    pub(crate) mapper: &'static dyn Mapper,
    /// Page size; every tract base and size is a multiple of this.
    pub(crate) alignment: usize,
    pub(crate) zone_shift: usize,
    pub(crate) commit_limit: usize,
    pub(crate) committed: usize,
    pub(crate) spare_commit_limit: usize,
    pub(crate) spare_committed: usize,
    /// Creation order; index 0 is the primary chunk and indices are
    /// stable (chunks are never freed while the arena lives).
    pub(crate) chunks: Vec<Chunk>,
    chunk_cache: usize,
    /// First-inserted page of the hysteresis ring.
    pub(crate) latent_head: Option<PageRef>,
    pub(crate) blacklist: RefSet,
    pub(crate) free_set: RefSet,
    pub(crate) gen_ref_set: [RefSet; GEN_COUNT],
    pub(crate) extend_by: usize,
    pub(crate) pools: Vec<PoolInfo>,
    pub(crate) chains: Vec<Chain>,
    pub(crate) top_gen_mortality: f64,
    pub(crate) active_traces: usize,
    pub(crate) emergency: bool,
}

fn non_null(addr: Addr) -> NonNull<c_void> {
    NonNull::new(addr as *mut c_void).expect("arena addresses are non-null")
}

/// Commits `[base, limit)` through the mapper, charging the arena's
/// commit accounting and honoring the commit limit.
fn arena_map(
    mapper: &'static dyn Mapper,
    committed: &mut usize,
    commit_limit: usize,
    chunk: &mut Chunk,
    base: Addr,
    limit: Addr,
) -> Result<(), ArenaError> {
    let size = limit - base;
    let new_committed = committed.checked_add(size).ok_or(ArenaError::CommitLimit)?;
    if new_committed > commit_limit {
        return Err(ArenaError::CommitLimit);
    }
    mapper
        .commit(non_null(base), size)
        .map_err(|_| ArenaError::Resource)?;
    *committed = new_committed;
    chunk.add_mapped(size);
    Ok(())
}

/// Returns `[base, limit)` to the operating system.  Unmapping our own
/// committed pages cannot meaningfully fail.
fn arena_unmap(
    mapper: &'static dyn Mapper,
    committed: &mut usize,
    chunk: &mut Chunk,
    base: Addr,
    limit: Addr,
) {
    let size = limit - base;
    assert!(size <= *committed);
    mapper
        .uncommit(non_null(base), size)
        .expect("uncommitting a committed range must succeed");
    *committed -= size;
    chunk.sub_mapped(size);
}

// -- The hysteresis ring ---------------------------------------------
//
// Latent pages form a circular doubly-linked list in insertion order,
// threaded through their descriptors as page indices.  Only membership
// and O(1) removal matter; the purger walks the no-latent bit tables,
// not the ring.

fn latent_links(chunks: &[Chunk], r: PageRef) -> (PageRef, PageRef) {
    match chunks[r.chunk as usize].page(r.page as usize) {
        PageDesc::Latent { prev, next } => (prev, next),
        _ => panic!("page {:?} is not latent", r),
    }
}

fn latent_ring_append(chunks: &mut [Chunk], head: &mut Option<PageRef>, r: PageRef) {
    match *head {
        None => {
            chunks[r.chunk as usize]
                .set_page(r.page as usize, PageDesc::Latent { prev: r, next: r });
            *head = Some(r);
        }
        Some(h) => {
            let (tail, _) = latent_links(chunks, h);
            chunks[r.chunk as usize]
                .set_page(r.page as usize, PageDesc::Latent { prev: tail, next: h });
            let (tail_prev, _) = latent_links(chunks, tail);
            chunks[tail.chunk as usize].set_page(
                tail.page as usize,
                PageDesc::Latent {
                    prev: tail_prev,
                    next: r,
                },
            );
            let (_, head_next) = latent_links(chunks, h);
            chunks[h.chunk as usize].set_page(
                h.page as usize,
                PageDesc::Latent {
                    prev: r,
                    next: head_next,
                },
            );
        }
    }
}

/// Unlinks `r`; the caller overwrites the descriptor right after.
fn latent_ring_remove(chunks: &mut [Chunk], head: &mut Option<PageRef>, r: PageRef) {
    let (prev, next) = latent_links(chunks, r);
    if prev == r {
        debug_assert!(next == r && *head == Some(r));
        *head = None;
        return;
    }
    let (prev_prev, _) = latent_links(chunks, prev);
    chunks[prev.chunk as usize].set_page(
        prev.page as usize,
        PageDesc::Latent {
            prev: prev_prev,
            next,
        },
    );
    let (_, next_next) = latent_links(chunks, next);
    chunks[next.chunk as usize].set_page(
        next.page as usize,
        PageDesc::Latent {
            prev,
            next: next_next,
        },
    );
    if *head == Some(r) {
        *head = Some(next);
    }
}

/// Turns a free page into a tract owned by `pool`.
fn page_alloc(chunk: &mut Chunk, index: usize, pool: Pool) {
    assert!(!chunk.alloc_table.test(index));
    let base = chunk.page_base(index);
    chunk.alloc_table.set(index);
    chunk.set_page(index, PageDesc::Allocated(Tract::new(pool, base)));
}

/// Maps the table pages holding the descriptors for pages
/// `[base_index, limit_index)`, initializing every descriptor that
/// became readable.  Descriptors straddling a table-page boundary are
/// only initialized once both their pages are mapped.
fn ensure_page_table_mapped(
    mapper: &'static dyn Mapper,
    committed: &mut usize,
    commit_limit: usize,
    chunk: &mut Chunk,
    base_index: usize,
    limit_index: usize,
) -> Result<(), ArenaError> {
    let (table_base, table_limit) = chunk.table_pages_used(base_index, limit_index);

    let mut cursor = table_base;
    while let Some((unmapped_base, unmapped_limit)) =
        chunk.table_mapped.find_long_res_range(cursor, table_limit, 1)
    {
        // A descriptor may overlap the first table page we are about
        // to map; only touch it if its other half is already mapped.
        let init_base = if unmapped_base == table_base
            && unmapped_base > 0
            && !chunk.table_mapped.test(unmapped_base - 1)
        {
            chunk.tp_whole_base_index(unmapped_base)
        } else {
            chunk.tp_base_index(unmapped_base)
        };
        // Similarly for the descriptor overlapping the end.
        let init_limit = if unmapped_limit == table_limit
            && unmapped_limit < chunk.page_table_pages()
            && !chunk.table_mapped.test(unmapped_limit)
        {
            chunk.tp_base_index(unmapped_limit)
        } else if unmapped_limit == chunk.page_table_pages() {
            chunk.pages()
        } else {
            chunk.tp_whole_base_index(unmapped_limit)
        };

        arena_map(
            mapper,
            committed,
            commit_limit,
            chunk,
            chunk.table_page_base(unmapped_base),
            chunk.table_page_base(unmapped_limit),
        )?;
        chunk.table_mapped.set_range(unmapped_base, unmapped_limit);
        for index in init_base..init_limit {
            chunk.alloc_table.reset(index);
            chunk.set_page(index, PageDesc::Free);
        }
        cursor = unmapped_limit;
        if cursor == table_limit {
            break;
        }
    }

    Ok(())
}

/// Unmaps, within table pages `[table_base, table_limit)`, those whose
/// descriptors are all unused.
fn unmap_unused_table_pages(
    mapper: &'static dyn Mapper,
    committed: &mut usize,
    chunk: &mut Chunk,
    table_base: usize,
    table_limit: usize,
) {
    let page_size = chunk.page_size();
    for tp in table_base..table_limit {
        if !chunk.table_page_in_use(tp) {
            assert!(chunk.no_latent.test(tp));
            assert!(chunk.table_mapped.test(tp));
            let base = chunk.table_page_base(tp);
            arena_unmap(mapper, committed, chunk, base, base + page_size);
            chunk.table_mapped.reset(tp);
        }
    }
}

/// Unmaps every latent run within pages `[base, limit)` of chunk `ci`,
/// returning the pages to Free and their bytes to the OS.  The
/// descriptors for the whole range must be readable.
#[allow(clippy::too_many_arguments)]
fn unmap_latent_ranges(
    mapper: &'static dyn Mapper,
    committed: &mut usize,
    spare_committed: &mut usize,
    latent_head: &mut Option<PageRef>,
    chunks: &mut [Chunk],
    ci: usize,
    base: usize,
    limit: usize,
    page_size: usize,
) {
    debug_assert!(base < limit);
    let mut run_base = base;
    while run_base < limit {
        while run_base < limit && !chunks[ci].page(run_base).is_latent() {
            run_base += 1;
        }
        if run_base >= limit {
            break;
        }
        let mut run_limit = run_base;
        while run_limit < limit && chunks[ci].page(run_limit).is_latent() {
            run_limit += 1;
        }
        for index in run_base..run_limit {
            latent_ring_remove(chunks, latent_head, PageRef::new(ci, index));
            assert!(*spare_committed >= page_size);
            *spare_committed -= page_size;
            chunks[ci].set_page(index, PageDesc::Free);
        }
        let (unmap_base, unmap_limit) = (
            chunks[ci].page_base(run_base),
            chunks[ci].page_base(run_limit),
        );
        arena_unmap(mapper, committed, &mut chunks[ci], unmap_base, unmap_limit);
        run_base = run_limit;
    }
}

impl ArenaInner {
    fn init(
        class: ArenaClass,
        user_size: usize,
        mapper: &'static dyn Mapper,
    ) -> Result<ArenaInner, ArenaError> {
        let mut committed = 0;
        let chunk = Chunk::create(mapper, user_size, &mut committed, usize::MAX)?;

        // Divide the primary chunk into one zone stripe per bit of a
        // word.  If the chunk is so small that stripes would be
        // smaller than pages, the user size was too small.
        let chunk_size = chunk.limit() - chunk.base();
        let alignment = chunk.page_size();
        if chunk_size >> WORD_SHIFT == 0 {
            chunk.destroy(&mut committed);
            return Err(ArenaError::Memory);
        }
        let zone_shift = floor_log2(chunk_size >> WORD_SHIFT);
        if alignment > 1 << zone_shift {
            chunk.destroy(&mut committed);
            return Err(ArenaError::Memory);
        }

        // The first and last zones commonly correspond to small
        // integers and -1 masquerading as ambiguous references.
        let blacklist =
            RefSet::of_addr(zone_shift, 1).union(RefSet::of_addr(zone_shift, usize::MAX));

        log::debug!(
            "arena {:?}: [{:#x}, {:#x}), zone shift {}, committed {}",
            class,
            chunk.base(),
            chunk.limit(),
            zone_shift,
            committed
        );

        Ok(ArenaInner {
            class,
            mapper,
            alignment,
            zone_shift,
            commit_limit: usize::MAX,
            committed,
            spare_commit_limit: config::SPARE_COMMIT_LIMIT_DEFAULT,
            spare_committed: 0,
            chunks: vec![chunk],
            chunk_cache: 0,
            latent_head: None,
            blacklist,
            free_set: RefSet::UNIV, // includes the blacklist
            gen_ref_set: [RefSet::EMPTY; GEN_COUNT],
            extend_by: user_size,
            pools: Vec::new(),
            chains: Vec::new(),
            top_gen_mortality: config::TOP_GEN_MORTALITY,
            active_traces: 0,
            emergency: false,
        })
    }

    pub(crate) fn reserved(&self) -> usize {
        self.chunks.iter().map(|c| c.limit() - c.base()).sum()
    }

    /// Locates the chunk containing `addr`, via a one-entry cache.
    pub(crate) fn chunk_of_addr(&mut self, addr: Addr) -> Option<usize> {
        if let Some(chunk) = self.chunks.get(self.chunk_cache) {
            if chunk.contains(addr) {
                return Some(self.chunk_cache);
            }
        }
        for (ci, chunk) in self.chunks.iter().enumerate() {
            if chunk.contains(addr) {
                self.chunk_cache = ci;
                return Some(ci);
            }
        }
        None
    }

    /// The chunk with the least base address strictly above `addr`.
    fn next_chunk_above(&self, addr: Addr) -> Option<usize> {
        let mut least: Option<usize> = None;
        for (ci, chunk) in self.chunks.iter().enumerate() {
            if addr < chunk.base()
                && least.map_or(true, |l| chunk.base() < self.chunks[l].base())
            {
                least = Some(ci);
            }
        }
        least
    }

    /// Creates a new chunk of `extend_by + size` bytes.
    pub(crate) fn grow(&mut self, size: usize) -> Result<(), ArenaError> {
        let chunk_size = self
            .extend_by
            .checked_add(size)
            .ok_or(ArenaError::Resource)?;
        let chunk = Chunk::create(
            self.mapper,
            chunk_size,
            &mut self.committed,
            self.commit_limit,
        )?;
        log::debug!(
            "arena grown by chunk [{:#x}, {:#x})",
            chunk.base(),
            chunk.limit()
        );
        self.chunks.push(chunk);
        Ok(())
    }

    /// Searches every chunk for a free run of `size` bytes lying in
    /// zone stripes of `ref_set`.  Returns the chunk index and the
    /// base page of the run.
    pub(crate) fn find_free_in_ref_set(
        &self,
        size: usize,
        ref_set: RefSet,
        downwards: bool,
    ) -> Option<(usize, usize)> {
        let zone_size = 1usize << self.zone_shift;

        for (ci, chunk) in self.chunks.iter().enumerate() {
            // The first address available for allocation is just past
            // the chunk's own tables.
            let chunk_base = chunk.page_base(chunk.ullage_pages());

            let mut base = chunk_base;
            while base < chunk.limit() {
                if ref_set.contains_addr(self.zone_shift, base) {
                    // Extend limit over the run of stripes in the set.
                    // Advancing by a stripe may wrap to zero; wrap
                    // means we reached the top of the address space.
                    let mut limit = base;
                    loop {
                        limit = crate::arith::align_up_wrapping(limit + 1, zone_size);
                        if limit >= chunk.limit() || limit < base {
                            limit = chunk.limit();
                            break;
                        }
                        if !ref_set.contains_addr(self.zone_shift, limit) {
                            break;
                        }
                    }

                    debug_assert!(
                        ref_set != RefSet::UNIV
                            || (base == chunk_base && limit == chunk.limit())
                    );

                    if limit - base >= size {
                        if let Some(start) = chunk.find_free_in_area(size, base, limit, downwards)
                        {
                            return Some((ci, start));
                        }
                    }
                    base = limit;
                } else {
                    base = crate::arith::align_up_wrapping(base + 1, zone_size);
                    if base == 0 || base >= chunk.limit() {
                        break;
                    }
                }
            }
        }
        None
    }

    /// Maps and allocates pages `[base_index, base_index + pages)` of
    /// chunk `ci` to `pool`.  Latent pages in the run are re-used
    /// without touching the OS; the rest is committed in maximal runs.
    /// On failure everything is reverted: no pages left committed, no
    /// allocation bits set.
    pub(crate) fn pages_map(
        &mut self,
        ci: usize,
        base_index: usize,
        pages: usize,
        pool: Pool,
    ) -> Result<(), ArenaError> {
        let ArenaInner {
            ref mut chunks,
            ref mut committed,
            ref mut spare_committed,
            ref mut latent_head,
            commit_limit,
            mapper,
            alignment,
            ..
        } = *self;

        let limit_index = base_index + pages;
        ensure_page_table_mapped(
            mapper,
            committed,
            commit_limit,
            &mut chunks[ci],
            base_index,
            limit_index,
        )?;

        let mut mapped_base = base_index;
        let mut mapped_limit;
        let result = loop {
            mapped_limit = mapped_base;
            while mapped_limit < limit_index && chunks[ci].page_is_mapped(mapped_limit) {
                mapped_limit += 1;
            }
            for index in mapped_base..mapped_limit {
                latent_ring_remove(chunks, latent_head, PageRef::new(ci, index));
                assert!(*spare_committed >= alignment);
                *spare_committed -= alignment;
                page_alloc(&mut chunks[ci], index, pool);
            }
            if mapped_limit >= limit_index {
                break Ok(());
            }

            let unmapped_base = mapped_limit;
            let mut unmapped_limit = unmapped_base;
            while unmapped_limit < limit_index && !chunks[ci].page_is_mapped(unmapped_limit) {
                unmapped_limit += 1;
            }
            let (map_base, map_limit) = (
                chunks[ci].page_base(unmapped_base),
                chunks[ci].page_base(unmapped_limit),
            );
            if let Err(err) = arena_map(
                mapper,
                committed,
                commit_limit,
                &mut chunks[ci],
                map_base,
                map_limit,
            ) {
                break Err(err);
            }
            for index in unmapped_base..unmapped_limit {
                page_alloc(&mut chunks[ci], index, pool);
            }
            mapped_base = unmapped_limit;
            if mapped_base >= limit_index {
                break Ok(());
            }
        };

        if let Err(err) = result {
            // Revert: everything below mapped_limit was allocated and
            // is still mapped; unmap it and reset the descriptors.
            if base_index < mapped_limit {
                let (revert_base, revert_limit) = (
                    chunks[ci].page_base(base_index),
                    chunks[ci].page_base(mapped_limit),
                );
                arena_unmap(mapper, committed, &mut chunks[ci], revert_base, revert_limit);
                for index in base_index..mapped_limit {
                    chunks[ci].alloc_table.reset(index);
                    chunks[ci].set_page(index, PageDesc::Free);
                }
            }
            // Resetting the no-latent bits is lazy: it spares us from
            // unmapping unused portions of the page table here.
            let (table_base, table_limit) = chunks[ci].table_pages_used(base_index, limit_index);
            chunks[ci].no_latent.reset_range(table_base, table_limit);
            return Err(err);
        }
        Ok(())
    }

    /// Allocation entry point shared by both arena classes.
    #[invariant(self.check_rep_or_err().is_ok(), "Arena invariants hold.")]
    pub(crate) fn alloc_comm(
        &mut self,
        pool: Pool,
        pref: &SegPref,
        size: usize,
    ) -> Result<(Addr, Tract), ArenaError> {
        assert!(size > 0, "zero-sized allocation");
        assert!(
            is_aligned(size, self.alignment),
            "allocation size must be a multiple of the arena page size"
        );
        assert!(
            pool.index() < self.pools.len(),
            "pool does not belong to this arena"
        );

        // Don't attempt to allocate if doing so would definitely
        // exceed the commit limit.  Spare pages count as slack:
        // re-allocating them commits nothing new.
        if self.spare_committed < size {
            let needed = size - self.spare_committed;
            match self.committed.checked_add(needed) {
                Some(total) if total <= self.commit_limit => {}
                _ => return Err(ArenaError::CommitLimit),
            }
        }

        let (ci, base_index) = match self.class {
            ArenaClass::Vm => self.policy_alloc(pref, size)?,
            ArenaClass::VmNz => self.policy_alloc_nz(pref, size)?,
        };

        let pages = size / self.alignment;
        if let Err(err) = self.pages_map(ci, base_index, pages, pool) {
            // One more try after releasing the hysteresis fund.
            if self.spare_committed == 0 {
                return Err(err);
            }
            self.purge_latent_pages();
            self.pages_map(ci, base_index, pages, pool)?;
        }

        let base = self.chunks[ci].page_base(base_index);
        let limit = base + size;
        let ref_set = RefSet::of_range(self.zone_shift, base, limit);
        if pref.is_gen {
            let gen = pref_gen(pref);
            self.gen_ref_set[gen] = self.gen_ref_set[gen].union(ref_set);
        }
        self.free_set = self.free_set.diff(ref_set);

        let tract = self.chunks[ci]
            .page(base_index)
            .tract()
            .expect("the base page was just allocated");
        Ok((base, tract))
    }

    /// Returns `[base, base + size)` to the arena.  The pages become
    /// latent: they stay mapped, queued on the hysteresis ring, until
    /// the spare commit limit forces a purge.
    #[invariant(self.check_rep_or_err().is_ok(), "Arena invariants hold.")]
    pub(crate) fn free_inner(&mut self, base: Addr, size: usize, pool: Pool) {
        assert!(size > 0, "zero-sized free");
        assert!(
            is_aligned(base, self.alignment) && is_aligned(size, self.alignment),
            "free base and size must be multiples of the arena page size"
        );

        let ci = self
            .chunk_of_addr(base)
            .expect("free of an address outside the arena");
        let alignment = self.alignment;
        {
            let ArenaInner {
                ref mut chunks,
                ref mut latent_head,
                ref mut spare_committed,
                ..
            } = *self;

            let page_base = chunks[ci].index_of_addr(base);
            let page_limit = page_base + size / alignment;
            assert!(
                page_limit <= chunks[ci].pages(),
                "free range exceeds its chunk"
            );

            for index in page_base..page_limit {
                let tract = chunks[ci]
                    .page(index)
                    .tract()
                    .expect("freeing a page that is not allocated");
                assert_eq!(
                    tract.pool(),
                    pool,
                    "freeing a tract owned by another pool"
                );
                latent_ring_append(chunks, latent_head, PageRef::new(ci, index));
            }
            *spare_committed += size;
            chunks[ci].alloc_table.reset_range(page_base, page_limit);
            let (table_base, table_limit) = chunks[ci].table_pages_used(page_base, page_limit);
            chunks[ci].no_latent.reset_range(table_base, table_limit);
        }

        if self.spare_committed > self.spare_commit_limit {
            self.purge_latent_pages();
        }
    }

    /// Unmaps every latent page in the arena, and any descriptor-table
    /// pages left with nothing to describe.  The no-latent bit tables
    /// say which stretches of the page tables to examine at all.
    pub(crate) fn purge_latent_pages(&mut self) {
        let ArenaInner {
            ref mut chunks,
            ref mut latent_head,
            ref mut spare_committed,
            ref mut committed,
            mapper,
            alignment,
            ..
        } = *self;

        for ci in 0..chunks.len() {
            let mut table_cursor = 0;
            while let Some((table_base, table_limit)) = chunks[ci].no_latent.find_long_res_range(
                table_cursor,
                chunks[ci].page_table_pages(),
                1,
            ) {
                // First descriptor we may examine: skip a straddler
                // whose lower half sits on an unmapped table page.
                let mut page_base = if table_base > 0
                    && !chunks[ci].table_mapped.test(table_base - 1)
                {
                    chunks[ci].tp_whole_base_index(table_base)
                } else {
                    chunks[ci].tp_base_index(table_base)
                };

                for tp in table_base..table_limit {
                    let table_pages = chunks[ci].page_table_pages();
                    let page_limit = if tp == table_limit - 1
                        && table_limit < table_pages
                        && !chunks[ci].table_mapped.test(table_limit)
                    {
                        chunks[ci].tp_whole_limit_index(tp)
                    } else if tp == table_pages - 1 {
                        chunks[ci].pages()
                    } else {
                        chunks[ci].tp_limit_index(tp)
                    };

                    if page_base < page_limit {
                        unmap_latent_ranges(
                            mapper,
                            committed,
                            spare_committed,
                            latent_head,
                            chunks,
                            ci,
                            page_base,
                            page_limit,
                            alignment,
                        );
                    } else {
                        // Only the tail of the last descriptor reaches
                        // the final table page.
                        debug_assert!(page_base == page_limit && tp == table_pages - 1);
                    }
                    chunks[ci].no_latent.set(tp);
                    page_base = page_limit;
                }

                unmap_unused_table_pages(mapper, committed, &mut chunks[ci], table_base, table_limit);
                table_cursor = table_limit;
                if table_cursor >= chunks[ci].page_table_pages() {
                    break;
                }
            }
        }

        debug_assert_eq!(*spare_committed, 0);
        debug_assert!(latent_head.is_none());
        log::trace!("purged hysteresis fund, committed now {}", committed);
    }

    // -- Tract queries and iteration ---------------------------------

    pub(crate) fn tract_of_addr_inner(&mut self, addr: Addr) -> Option<Tract> {
        let ci = self.chunk_of_addr(addr)?;
        let chunk = &self.chunks[ci];
        let index = chunk.index_of_addr(addr);
        // A reset bit means the page is free or part of the chunk's
        // own tables; either way there is no tract here.
        if chunk.alloc_table.test(index) {
            chunk.page(index).tract()
        } else {
            None
        }
    }

    /// The tract with the least base address strictly above `addr`.
    pub(crate) fn tract_search(&mut self, addr: Addr) -> Option<Tract> {
        fn search_in_chunk(chunk: &Chunk, mut index: usize) -> Option<Tract> {
            while index < chunk.pages() {
                if chunk.alloc_table.test(index) {
                    if let Some(tract) = chunk.page(index).tract() {
                        return Some(tract);
                    }
                }
                index += 1;
            }
            None
        }

        if let Some(ci) = self.chunk_of_addr(addr) {
            let index = self.chunks[ci].index_of_addr(addr);
            if let Some(tract) = search_in_chunk(&self.chunks[ci], index + 1) {
                return Some(tract);
            }
        }
        let mut addr = addr;
        while let Some(ci) = self.next_chunk_above(addr) {
            addr = self.chunks[ci].base();
            // Start past the ullage: the tables can't be tracts.
            if let Some(tract) = search_in_chunk(&self.chunks[ci], self.chunks[ci].ullage_pages())
            {
                return Some(tract);
            }
        }
        None
    }

    pub(crate) fn tract_next_contig_inner(&mut self, tract: Tract) -> Tract {
        let alignment = self.alignment;
        let ci = self
            .chunk_of_addr(tract.base())
            .expect("tract outside the arena");
        let chunk = &self.chunks[ci];
        // The next tract must lie in the same chunk.
        assert!(chunk.contains(tract.base() + alignment));
        let next = chunk.index_of_addr(tract.base()) + 1;
        assert!(
            chunk.alloc_table.test(next),
            "next contiguous page is not allocated"
        );
        chunk.page(next).tract().expect("allocated page has a tract")
    }

    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    pub(crate) fn check_rep_or_err(&self) -> Result<(), &'static str> {
        if self.committed != self.chunks.iter().map(|c| c.mapped()).sum::<usize>() {
            return Err("committed does not match the chunks' mapped bytes");
        }
        if self.spare_committed > self.committed {
            return Err("spare committed exceeds committed");
        }
        if self.committed > self.commit_limit {
            return Err("committed exceeds the commit limit");
        }

        let mut gen_union = RefSet::EMPTY;
        for ref_set in &self.gen_ref_set {
            gen_union = gen_union.union(*ref_set);
        }
        if !self.free_set.inter(gen_union).is_empty() {
            return Err("free zones overlap generation zones");
        }

        let mut latent_bytes = 0;
        for chunk in &self.chunks {
            for index in 0..chunk.pages() {
                if !chunk.desc_mapped(index) {
                    if chunk.alloc_table.test(index) {
                        return Err("allocated page with an unmapped descriptor");
                    }
                    continue;
                }
                match chunk.page(index) {
                    PageDesc::Allocated(_) => {
                        if !chunk.alloc_table.test(index) {
                            return Err("allocated descriptor without its allocation bit");
                        }
                    }
                    PageDesc::Latent { .. } => {
                        if chunk.alloc_table.test(index) {
                            return Err("latent descriptor with its allocation bit set");
                        }
                        latent_bytes += chunk.page_size();
                        let (tb, tl) = chunk.table_pages_used(index, index + 1);
                        if (tb..tl).any(|tp| chunk.no_latent.test(tp)) {
                            return Err("latent page under a set no-latent bit");
                        }
                    }
                    PageDesc::Free => {
                        if chunk.alloc_table.test(index) {
                            return Err("free descriptor with its allocation bit set");
                        }
                    }
                }
            }
        }
        if latent_bytes != self.spare_committed {
            return Err("spare committed does not match the latent pages");
        }
        Ok(())
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        self.purge_latent_pages();

        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        for chunk in &self.chunks {
            for index in 0..chunk.pages() {
                if chunk.alloc_table.test(index) {
                    debug_allocation_map::forget_containing(chunk.page_base(index));
                }
            }
        }

        let mut committed = self.committed;
        for chunk in self.chunks.drain(..) {
            chunk.destroy(&mut committed);
        }
        self.committed = committed;
        debug_assert_eq!(self.committed, 0);
    }
}

impl Arena {
    /// Creates an arena with the default (anonymous) mapper.
    /// `user_size` is a hint for the primary reservation and becomes
    /// the growth increment.
    pub fn create(class: ArenaClass, user_size: usize) -> Result<Arena, ArenaError> {
        Arena::create_with_mapper(class, user_size, get_mapper(None).expect("default mapper"))
    }

    pub fn create_with_mapper(
        class: ArenaClass,
        user_size: usize,
        mapper: &'static dyn Mapper,
    ) -> Result<Arena, ArenaError> {
        if user_size == 0 {
            return Err(ArenaError::Param);
        }
        Ok(Arena {
            inner: Mutex::new(ArenaInner::init(class, user_size, mapper)?),
        })
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap()
    }

    /// Total address space reserved, over all chunks.
    pub fn reserved(&self) -> usize {
        self.lock().reserved()
    }

    /// Bytes currently committed, tables included.
    pub fn committed(&self) -> usize {
        self.lock().committed
    }

    /// Bytes held in the hysteresis fund: committed, but free.
    pub fn spare_committed(&self) -> usize {
        self.lock().spare_committed
    }

    pub fn commit_limit(&self) -> usize {
        self.lock().commit_limit
    }

    /// Sets the soft cap on committed bytes.  Fails with `Param` if
    /// the cap is below what is already committed.
    pub fn commit_limit_set(&self, bytes: usize) -> Result<(), ArenaError> {
        let mut inner = self.lock();
        if bytes < inner.committed {
            return Err(ArenaError::Param);
        }
        inner.commit_limit = bytes;
        Ok(())
    }

    pub fn spare_commit_limit(&self) -> usize {
        self.lock().spare_commit_limit
    }

    /// Sets the cap on the hysteresis fund, purging immediately if the
    /// fund already exceeds it.
    pub fn spare_commit_limit_set(&self, bytes: usize) {
        let mut inner = self.lock();
        inner.spare_commit_limit = bytes;
        if inner.spare_committed > inner.spare_commit_limit {
            inner.purge_latent_pages();
        }
    }

    /// Registers a pool with this arena and returns its handle.
    pub fn pool_create(&self, name: Option<&str>) -> Pool {
        let mut inner = self.lock();
        let pool = Pool::from_index(inner.pools.len());
        inner.pools.push(PoolInfo {
            name: name.map(str::to_owned),
        });
        pool
    }

    /// The name the pool was created with, if any.
    pub fn pool_name(&self, pool: Pool) -> Option<String> {
        let inner = self.lock();
        assert!(pool.index() < inner.pools.len(), "pool of another arena");
        inner.pools[pool.index()].name.clone()
    }

    /// Flags the arena as being in an emergency (out-of-memory)
    /// collection; the collection-start policy clears this when a
    /// failed start should not poison the next attempt.
    pub fn set_emergency(&self, emergency: bool) {
        self.lock().emergency = emergency;
    }

    pub fn in_emergency(&self) -> bool {
        self.lock().emergency
    }

    /// Allocates `size` bytes (a multiple of the page size) of
    /// page-aligned tracts for `pool`, following `pref`'s zone
    /// preferences.  Returns the base address and the base tract.
    #[ensures(ret.is_ok() ->
              debug_allocation_map::mark_allocated(pool, ret.as_ref().unwrap().0, size).is_ok(),
              "Successful allocations do not overlap any live allocation.")]
    pub fn alloc(&self, pool: Pool, pref: &SegPref, size: usize) -> Result<(Addr, Tract), ArenaError> {
        self.lock().alloc_comm(pool, pref, size)
    }

    /// Returns a region obtained from `alloc` to the arena.  The base,
    /// size, and owning pool must match the original allocation.
    #[requires(debug_allocation_map::mark_released(pool, base, size).is_ok(),
               "Released regions match a live allocation of the same pool.")]
    pub fn free(&self, base: Addr, size: usize, pool: Pool) {
        self.lock().free_inner(base, size, pool)
    }

    /// The tract containing `addr`, if that page is allocated.
    pub fn tract_of_addr(&self, addr: Addr) -> Option<Tract> {
        self.lock().tract_of_addr_inner(addr)
    }

    /// Is `addr` inside any of the arena's reservations?
    pub fn is_reserved(&self, addr: Addr) -> bool {
        self.lock().chunk_of_addr(addr).is_some()
    }

    /// The lowest-addressed tract, to start an iteration.  Assumes no
    /// tract has base address zero, which holds because page zero is
    /// never part of a reservation.
    pub fn tract_first(&self) -> Option<Tract> {
        self.lock().tract_search(0)
    }

    /// The tract with the least base address strictly greater than
    /// `addr`.  The iteration is only stable while the arena is not
    /// mutated in between steps.
    pub fn tract_next(&self, addr: Addr) -> Option<Tract> {
        let mut inner = self.lock();
        assert!(is_aligned(addr, inner.alignment));
        inner.tract_search(addr)
    }

    /// The tract immediately after `tract`; both must be allocated and
    /// in the same chunk.
    pub fn tract_next_contig(&self, tract: Tract) -> Tract {
        self.lock().tract_next_contig_inner(tract)
    }

    /// Creates a generation chain for the collection-start policy.
    pub fn chain_create(&self, gens: Vec<GenParams>) -> ChainId {
        let mut inner = self.lock();
        inner.chains.push(Chain::new(gens));
        ChainId(inner.chains.len() - 1)
    }

    /// Records `bytes` of new allocation into `gen` of `chain`.
    pub fn chain_note_allocation(&self, chain: ChainId, gen: usize, bytes: usize) {
        let mut inner = self.lock();
        assert!(chain.0 < inner.chains.len(), "chain of another arena");
        inner.chains[chain.0].note_allocation(gen, bytes);
    }

    /// Sets the mortality estimate of the dynamic (top) generation.
    pub fn top_gen_mortality_set(&self, mortality: f64) {
        assert!((0.0..=1.0).contains(&mortality), "mortality out of range");
        self.lock().top_gen_mortality = mortality;
    }

    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    pub(crate) fn check_rep(&self) {
        self.lock()
            .check_rep_or_err()
            .expect("arena invariants hold");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_arena(class: ArenaClass, size: usize) -> Arena {
        Arena::create(class, size).expect("arena should build")
    }

    fn pref() -> SegPref {
        SegPref::default()
    }

    #[test]
    fn smoke_test() {
        let arena = test_arena(ArenaClass::Vm, 32 << 20);
        let pool = arena.pool_create(Some("smoke"));
        assert_eq!(arena.pool_name(pool).as_deref(), Some("smoke"));
        let page = arena.lock().alignment;

        assert_eq!(arena.reserved(), 32 << 20);
        assert!(arena.committed() > 0);
        assert_eq!(arena.spare_committed(), 0);

        let (base, tract) = arena.alloc(pool, &pref(), 2 * page).expect("should allocate");
        assert_eq!(tract.base(), base);
        assert_eq!(tract.pool(), pool);
        assert!(arena.is_reserved(base));
        // Tracts always land past the chunk's own tables.
        {
            let mut inner = arena.lock();
            let ci = inner.chunk_of_addr(base).expect("inside the arena");
            let index = inner.chunks[ci].index_of_addr(base);
            assert!(index >= inner.chunks[ci].ullage_pages());
        }
        assert_eq!(arena.tract_of_addr(base), Some(tract));
        assert_eq!(arena.tract_of_addr(base + page + 7).map(|t| t.base()), Some(base + page));
        arena.check_rep();

        arena.free(base, 2 * page, pool);
        assert_eq!(arena.tract_of_addr(base), None);
        assert_eq!(arena.spare_committed(), 2 * page);
        arena.check_rep();
    }

    // Allocate, free, and re-allocate: committed stays put, the
    // allocation table round-trips.
    #[test]
    fn round_trip_preserves_committed() {
        let arena = test_arena(ArenaClass::Vm, 16 << 20);
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let (base, _) = arena.alloc(pool, &pref(), 4 * page).expect("should allocate");
        let committed = arena.committed();

        arena.free(base, 4 * page, pool);
        assert_eq!(arena.committed(), committed);
        assert_eq!(arena.spare_committed(), 4 * page);

        let (base_again, _) = arena.alloc(pool, &pref(), 4 * page).expect("should allocate");
        assert_eq!(base_again, base);
        assert_eq!(arena.committed(), committed);
        assert_eq!(arena.spare_committed(), 0);
        arena.check_rep();
    }

    #[test]
    fn outside_addresses_are_unknown() {
        let arena = test_arena(ArenaClass::Vm, 8 << 20);

        assert!(!arena.is_reserved(0x1000));
        assert_eq!(arena.tract_of_addr(0x1000), None);

        // Inside the reservation, the table prefix holds no tracts.
        let base = arena.lock().chunks[0].base();
        assert!(arena.is_reserved(base));
        assert_eq!(arena.tract_of_addr(base), None);
    }

    #[test]
    fn iteration_visits_every_tract_in_address_order() {
        let arena = test_arena(ArenaClass::Vm, 16 << 20);
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let mut expected = Vec::new();
        let (a, _) = arena.alloc(pool, &pref(), 3 * page).expect("should allocate");
        let (b, _) = arena.alloc(pool, &pref(), page).expect("should allocate");
        let (c, _) = arena.alloc(pool, &pref(), 2 * page).expect("should allocate");
        for (base, pages) in [(a, 3), (b, 1), (c, 2)] {
            for i in 0..pages {
                expected.push(base + i * page);
            }
        }
        // Punch a hole so the iteration has to skip free pages.
        arena.free(b, page, pool);
        expected.retain(|&x| x != b);
        expected.sort_unstable();

        let mut visited = Vec::new();
        let mut cursor = arena.tract_first();
        while let Some(tract) = cursor {
            visited.push(tract.base());
            cursor = arena.tract_next(tract.base());
        }
        assert_eq!(visited, expected);

        // Contiguous stepping agrees with the bitmap.
        let first = arena.tract_of_addr(a).expect("allocated");
        let second = arena.tract_next_contig(first);
        assert_eq!(second.base(), a + page);
        arena.check_rep();
    }

    #[test]
    fn purge_is_idempotent() {
        let arena = test_arena(ArenaClass::Vm, 16 << 20);
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let (base, _) = arena.alloc(pool, &pref(), 8 * page).expect("should allocate");
        arena.free(base, 8 * page, pool);
        assert_eq!(arena.spare_committed(), 8 * page);
        let committed_with_spare = arena.committed();

        arena.spare_commit_limit_set(0);
        assert_eq!(arena.spare_committed(), 0);
        assert!(arena.committed() < committed_with_spare);
        let committed_after = arena.committed();

        // The second purge has nothing to do.
        arena.spare_commit_limit_set(0);
        assert_eq!(arena.spare_committed(), 0);
        assert_eq!(arena.committed(), committed_after);
        arena.check_rep();

        // And the pages are allocatable again.
        let (base_again, _) = arena.alloc(pool, &pref(), 8 * page).expect("should allocate");
        assert_eq!(base_again, base);
        arena.check_rep();
    }

    // Scenario: fill the primary chunk, then watch the next request
    // extend the arena with a fresh chunk.
    #[test]
    fn extension_grows_reserved_by_extend_by() {
        let arena = test_arena(ArenaClass::Vm, 8 << 20);
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let free_pages = {
            let inner = arena.lock();
            inner.chunks[0].pages() - inner.chunks[0].ullage_pages()
        };
        // Leave one page so the chunk is nearly, not exactly, full.
        let bulk = (free_pages - 1) * page;
        arena.alloc(pool, &pref(), bulk).expect("bulk alloc should succeed");

        let reserved_before = arena.reserved();
        let committed_before = arena.committed();

        let (base, _) = arena.alloc(pool, &pref(), 2 * page).expect("extension should succeed");

        assert!(arena.reserved() >= reserved_before + (8 << 20) + 2 * page);
        {
            let mut inner = arena.lock();
            assert_eq!(inner.chunks.len(), 2);
            let ci = inner.chunk_of_addr(base).expect("inside the arena");
            assert_eq!(ci, 1, "the new tract comes from the new chunk");
        }
        // Committed grew by the allocation plus the new chunk's table
        // overhead, nothing more.
        let overhead = {
            let inner = arena.lock();
            inner.chunks[1].mapped() - 2 * page
        };
        assert_eq!(arena.committed(), committed_before + 2 * page + overhead);
        arena.check_rep();
    }

    #[test]
    fn commit_limit_blocks_allocation() {
        let arena = test_arena(ArenaClass::Vm, 16 << 20);
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let committed = arena.committed();
        arena
            .commit_limit_set(committed + page)
            .expect("raising the limit is fine");

        assert_eq!(
            arena.alloc(pool, &pref(), 2 * page),
            Err(ArenaError::CommitLimit)
        );
        // The failure left no trace.
        assert_eq!(arena.committed(), committed);
        assert_eq!(arena.spare_committed(), 0);
        arena.check_rep();

        assert_eq!(
            arena.commit_limit_set(committed - page),
            Err(ArenaError::Param)
        );
    }

    #[derive(Debug)]
    struct CountingMapper {
        commits: AtomicUsize,
        uncommits: AtomicUsize,
    }

    #[contract_trait]
    impl Mapper for CountingMapper {
        fn page_size(&self) -> usize {
            crate::map::page_size()
        }

        fn reserve(&self, desired_size: usize) -> Result<(NonNull<c_void>, usize), i32> {
            let region = crate::map::reserve_region(desired_size)?;
            Ok((region, desired_size))
        }

        fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
            crate::map::release_region(base, size)
        }

        fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
            self.commits.fetch_add(1, Ordering::Relaxed);
            crate::map::commit_region(base, size)
        }

        fn uncommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
            self.uncommits.fetch_add(1, Ordering::Relaxed);
            crate::map::uncommit_region(base, size)
        }
    }

    // Scenario: free then immediately re-allocate.  The second
    // allocation must ride the hysteresis fast path: no OS calls.
    #[test]
    fn latent_reallocation_skips_the_mapper() {
        let mapper: &'static CountingMapper = Box::leak(Box::new(CountingMapper {
            commits: AtomicUsize::new(0),
            uncommits: AtomicUsize::new(0),
        }));
        let arena = Arena::create_with_mapper(ArenaClass::Vm, 16 << 20, mapper)
            .expect("arena should build");
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let (base, _) = arena.alloc(pool, &pref(), 16 * page).expect("should allocate");
        let committed = arena.committed();
        let commits_before = mapper.commits.load(Ordering::Relaxed);

        arena.free(base, 16 * page, pool);
        assert_eq!(arena.spare_committed(), 16 * page);

        let (base_again, _) = arena.alloc(pool, &pref(), 16 * page).expect("should allocate");
        assert_eq!(base_again, base);
        assert_eq!(arena.spare_committed(), 0);
        assert_eq!(arena.committed(), committed);
        assert_eq!(
            mapper.commits.load(Ordering::Relaxed),
            commits_before,
            "re-allocating latent pages must not call into the mapper"
        );
        assert_eq!(mapper.uncommits.load(Ordering::Relaxed), 0);
        arena.check_rep();
    }

    #[test]
    fn vmnz_never_grows() {
        let arena = test_arena(ArenaClass::VmNz, 1 << 20);
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let free_pages = {
            let inner = arena.lock();
            inner.chunks[0].pages() - inner.chunks[0].ullage_pages()
        };
        arena
            .alloc(pool, &pref(), free_pages * page)
            .expect("filling the chunk should succeed");

        assert_eq!(
            arena.alloc(pool, &pref(), page),
            Err(ArenaError::Resource)
        );
        assert_eq!(arena.reserved(), 1 << 20);
        arena.check_rep();
    }

    #[test]
    fn arenas_are_independent() {
        let a = test_arena(ArenaClass::Vm, 8 << 20);
        let b = test_arena(ArenaClass::Vm, 8 << 20);
        let pool_a = a.pool_create(None);
        let pool_b = b.pool_create(None);
        let page = a.lock().alignment;

        let (base_a, _) = a.alloc(pool_a, &pref(), page).expect("should allocate");
        let (base_b, _) = b.alloc(pool_b, &pref(), page).expect("should allocate");

        assert!(a.is_reserved(base_a));
        assert!(!a.is_reserved(base_b));
        assert!(b.is_reserved(base_b));
        assert!(!b.is_reserved(base_a));
    }

    #[test]
    #[should_panic(expected = "multiple of the arena page size")]
    fn misaligned_size_asserts() {
        let arena = test_arena(ArenaClass::Vm, 8 << 20);
        let pool = arena.pool_create(None);

        let _ = arena.alloc(pool, &pref(), 12345);
    }

    #[test]
    fn destroy_releases_everything() {
        let arena = test_arena(ArenaClass::Vm, 8 << 20);
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let (base, _) = arena.alloc(pool, &pref(), 4 * page).expect("should allocate");
        arena.free(base, 2 * page, pool);
        // Dropping purges the fund and releases all chunks; the debug
        // checks in ArenaInner::drop verify the accounting lands on 0.
        drop(arena);
    }
}

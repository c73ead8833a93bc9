//! Policy decisions: where to allocate, and when to start a trace.
//!
//! Allocation walks a ladder of zone sets, from the caller's exact
//! preference out to the universal set, stopping at the first set that
//! contains a free run.  The collection-start policy computes a
//! dynamic deferral criterion over the whole arena and, failing that,
//! looks for the generation chain most over its nursery capacity.

use crate::arena::{Arena, ArenaError, ArenaInner};
use crate::chain::ChainId;
use crate::config;
use crate::zone::RefSet;

/// A segment preference: where the caller would like its pages.
///
/// `zones` and `avoid` select and exclude zone stripes; `high` asks
/// for the top of candidate runs; collected preferences additionally
/// avoid the arena's blacklist; generational preferences draw their
/// zones from the arena's per-generation ledger instead of `zones`.
#[derive(Clone, Debug)]
pub struct SegPref {
    pub zones: RefSet,
    pub avoid: RefSet,
    pub high: bool,
    pub is_collected: bool,
    pub is_gen: bool,
    pub gen: usize,
}

impl Default for SegPref {
    fn default() -> SegPref {
        SegPref {
            zones: RefSet::UNIV,
            avoid: RefSet::EMPTY,
            high: false,
            is_collected: false,
            is_gen: false,
            gen: 0,
        }
    }
}

impl SegPref {
    /// Preference for collectable memory in generation `gen`.
    pub fn generational(gen: usize) -> SegPref {
        SegPref {
            is_collected: true,
            is_gen: true,
            gen,
            ..SegPref::default()
        }
    }
}

/// Clamps a preference's generation to the arena's ledger.
pub(crate) fn pref_gen(pref: &SegPref) -> usize {
    pref.gen.min(crate::arena::GEN_COUNT - 1)
}

/// Why a trace was started.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StartReason {
    /// The dynamic criterion fired: the arena no longer has headroom
    /// to defer a full collection.
    DynamicCriterion,
    /// A chain's generation 0 exceeded its capacity.
    ChainGen0Capacity,
}

/// A trace the policy decided to start.  The tracing engine above the
/// arena consumes this and reports back through
/// [`crate::Arena::trace_complete`].
#[derive(Clone, Debug)]
pub struct Trace {
    pub why: StartReason,
    /// Bytes condemned for this trace.
    pub condemned: usize,
    /// Expected fraction of the condemned bytes that will die.
    pub mortality: f64,
    /// Tracing work to hand the collector up front.
    pub work: f64,
    /// The condemned chain, for chain-triggered traces.
    pub chain: Option<ChainId>,
}

impl ArenaInner {
    /// Bytes still allocatable without exceeding the commit limit,
    /// counting spare pages as available.
    pub(crate) fn avail(&self) -> usize {
        let swap = self.reserved().min(self.commit_limit);
        swap.saturating_sub(self.committed) + self.spare_committed
    }

    /// The zoned allocation policy: plans A through D, then anywhere.
    /// Returns the chosen chunk and base page index.
    pub(crate) fn policy_alloc(
        &mut self,
        pref: &SegPref,
        size: usize,
    ) -> Result<(usize, usize), ArenaError> {
        let pref_zones = if pref.is_gen {
            self.gen_ref_set[pref_gen(pref)]
        } else {
            pref.zones
        };
        let avoid = if pref.is_collected {
            pref.avoid.union(self.blacklist)
        } else {
            pref.avoid
        };

        // Plan A: the requested zones, minus the ones to avoid.
        let zones = pref_zones.diff(avoid);
        if !zones.is_empty() {
            if let Some(found) = self.find_free_in_ref_set(size, zones, pref.high) {
                return Ok(found);
            }
        }

        // Plan B: add free zones that aren't avoided.
        let more_zones = pref_zones.union(self.free_set.diff(avoid));
        if more_zones != zones {
            if let Some(found) = self.find_free_in_ref_set(size, more_zones, pref.high) {
                return Ok(found);
            }
        }

        // Plan C: extend the arena, then try A and B again.
        if !more_zones.is_empty() {
            self.grow(size)?;
            if !zones.is_empty() {
                if let Some(found) = self.find_free_in_ref_set(size, zones, pref.high) {
                    return Ok(found);
                }
            }
            if more_zones != zones {
                if let Some(found) = self.find_free_in_ref_set(size, more_zones, pref.high) {
                    return Ok(found);
                }
            }
        }

        // Plan D: every zone that isn't avoided.  This mixes
        // generations and degrades the zone check's precision.
        let even_more_zones = RefSet::UNIV.diff(avoid);
        if even_more_zones != more_zones {
            log::warn!("allocation of {} bytes is mixing generation zones", size);
            if let Some(found) = self.find_free_in_ref_set(size, even_more_zones, pref.high) {
                return Ok(found);
            }
        }

        // Last resort: anywhere, blacklist included.  Collectable
        // objects placed here can be pinned by ambiguous bit patterns
        // for the life of the process.
        log::warn!("allocation of {} bytes is ignoring the zone blacklist", size);
        if let Some(found) = self.find_free_in_ref_set(size, RefSet::UNIV, pref.high) {
            return Ok(found);
        }

        Err(ArenaError::Resource)
    }

    /// The no-zones policy: search the universal set, never grow.
    pub(crate) fn policy_alloc_nz(
        &mut self,
        pref: &SegPref,
        size: usize,
    ) -> Result<(usize, usize), ArenaError> {
        self.find_free_in_ref_set(size, RefSet::UNIV, pref.high)
            .ok_or(ArenaError::Resource)
    }

    fn trace_slot_acquire(&mut self) -> Result<(), ()> {
        if self.active_traces >= config::TRACE_LIMIT {
            return Err(());
        }
        self.active_traces += 1;
        Ok(())
    }

    fn trace_slot_release(&mut self) {
        assert!(self.active_traces > 0);
        self.active_traces -= 1;
    }

    /// Considers starting a trace; returns it if one was started.
    ///
    /// Internal failures never escape: the attempt is unwound, the
    /// emergency flag cleared where appropriate, and `None` returned.
    pub(crate) fn start_trace_inner(&mut self) -> Option<Trace> {
        let mortality = self.top_gen_mortality;
        debug_assert!((0.0..=1.0).contains(&mortality));

        // Dynamic criterion.  The foundation is zero: we would be
        // condemning everything, so only the roots remain.
        let s_condemned = self.committed - self.spare_committed;
        let s_survivors = s_condemned as f64 * (1.0 - mortality);
        let t_trace_per_scan = s_survivors * (1.0 + config::TRACE_COPY_SCAN_RATIO);
        let s_cons_trace = s_survivors + t_trace_per_scan * config::TRACE_WORK_FACTOR;
        let dynamic_deferral = self.avail() as f64 - s_cons_trace;

        if dynamic_deferral < 0.0 {
            // Start a full collection.
            if self.trace_slot_acquire().is_err() {
                return None;
            }
            log::debug!(
                "dynamic criterion fired: condemning {} bytes",
                s_condemned
            );
            return Some(Trace {
                why: StartReason::DynamicCriterion,
                condemned: s_condemned,
                mortality,
                work: s_condemned as f64 * config::TRACE_WORK_FACTOR,
                chain: None,
            });
        }

        // Find the chain most over its capacity.
        let mut first_time = 0.0;
        let mut first_chain: Option<usize> = None;
        for (index, chain) in self.chains.iter().enumerate() {
            let time = chain.deferral_time();
            if time < first_time {
                first_time = time;
                first_chain = Some(index);
            }
        }

        if let Some(index) = first_chain {
            if self.trace_slot_acquire().is_err() {
                self.emergency = false;
                return None;
            }
            match self.chains[index].condemn_auto() {
                Ok((condemned, mortality)) => {
                    self.chains[index].active_traces += 1;
                    log::debug!(
                        "chain {} over capacity: condemning {} bytes",
                        index,
                        condemned
                    );
                    Some(Trace {
                        why: StartReason::ChainGen0Capacity,
                        condemned,
                        mortality,
                        work: condemned as f64 * config::TRACE_WORK_FACTOR,
                        chain: Some(ChainId(index)),
                    })
                }
                Err(()) => {
                    // Unlikely, but clear the emergency flag so the
                    // next attempt starts normally.
                    self.trace_slot_release();
                    self.emergency = false;
                    None
                }
            }
        } else {
            None
        }
    }
}

impl Arena {
    /// Considers starting a trace, on behalf of the embedder's
    /// quiescent points.
    pub fn start_trace(&self) -> Option<Trace> {
        self.lock().start_trace_inner()
    }

    /// Reports a trace returned by [`Self::start_trace`] finished,
    /// releasing its slot and its chain.
    pub fn trace_complete(&self, trace: Trace) {
        let mut inner = self.lock();
        inner.trace_slot_release();
        if let Some(ChainId(index)) = trace.chain {
            assert!(inner.chains[index].active_traces > 0);
            inner.chains[index].active_traces -= 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arena::ArenaClass;
    use crate::chain::GenParams;
    use crate::zone::{zone_of_addr, RefSet, WORD_BITS};

    fn arena_64m() -> Arena {
        Arena::create(ArenaClass::Vm, 64 << 20).expect("arena should build")
    }

    // Scenario: a plain preference for zone 3 is honored by plan A.
    #[test]
    fn plan_a_respects_the_preferred_zone() {
        let arena = arena_64m();
        let pool = arena.pool_create(None);
        let (page, zone_shift) = {
            let inner = arena.lock();
            (inner.alignment, inner.zone_shift)
        };

        let pref = SegPref {
            zones: RefSet::single(3),
            ..SegPref::default()
        };
        let (base, _) = arena.alloc(pool, &pref, 2 * page).expect("should allocate");

        assert_eq!(zone_of_addr(zone_shift, base), 3);
        assert_eq!(zone_of_addr(zone_shift, base + 2 * page - 1), 3);
        arena.check_rep();
    }

    // Scenario: collected allocations stay off the blacklist.
    #[test]
    fn collected_allocations_avoid_the_blacklist() {
        let arena = arena_64m();
        let pool = arena.pool_create(None);
        let (page, zone_shift, blacklist) = {
            let inner = arena.lock();
            (inner.alignment, inner.zone_shift, inner.blacklist)
        };

        assert_eq!(blacklist, RefSet::single(0).union(RefSet::single(WORD_BITS - 1)));

        let pref = SegPref {
            zones: RefSet::single(3),
            is_collected: true,
            ..SegPref::default()
        };
        let (base, _) = arena.alloc(pool, &pref, 2 * page).expect("should allocate");

        let placed = RefSet::of_range(zone_shift, base, base + 2 * page);
        assert!(placed.inter(blacklist).is_empty());
        assert_eq!(zone_of_addr(zone_shift, base), 3);
    }

    // A collected request whose only preferred zone is blacklisted
    // falls through plan A into the wider plans.
    #[test]
    fn blacklisted_preference_widens() {
        let arena = arena_64m();
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let pref = SegPref {
            zones: RefSet::single(0),
            is_collected: true,
            ..SegPref::default()
        };
        let (base, _) = arena.alloc(pool, &pref, page).expect("should allocate");
        assert!(arena.is_reserved(base));
        arena.check_rep();
    }

    // Generational allocations stake out zones: the generation ledger
    // gains them and the free set loses them.
    #[test]
    fn generational_allocation_updates_the_ledgers() {
        let arena = arena_64m();
        let pool = arena.pool_create(None);
        let (page, zone_shift) = {
            let inner = arena.lock();
            (inner.alignment, inner.zone_shift)
        };

        let pref = SegPref::generational(1);
        let (base, _) = arena.alloc(pool, &pref, 4 * page).expect("should allocate");
        let placed = RefSet::of_range(zone_shift, base, base + 4 * page);

        {
            let inner = arena.lock();
            assert!(placed.is_subset(inner.gen_ref_set[1]));
            assert!(inner.free_set.inter(placed).is_empty());
            assert!(placed.inter(inner.blacklist).is_empty());
        }
        arena.check_rep();

        // A second allocation for the same generation reuses its zones.
        let (base2, _) = arena.alloc(pool, &pref, page).expect("should allocate");
        let placed2 = RefSet::of_range(zone_shift, base2, base2 + page);
        let inner = arena.lock();
        assert!(placed2.is_subset(inner.gen_ref_set[1]));
    }

    #[test]
    fn high_preference_allocates_from_the_top() {
        let arena = arena_64m();
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        let low = arena
            .alloc(pool, &SegPref::default(), page)
            .expect("should allocate")
            .0;
        let high = arena
            .alloc(
                pool,
                &SegPref {
                    high: true,
                    ..SegPref::default()
                },
                page,
            )
            .expect("should allocate")
            .0;

        assert!(high > low);
        // The downward allocation fills from the chunk's top page.
        let inner = arena.lock();
        assert_eq!(high, inner.chunks[0].limit() - page);
    }

    #[test]
    fn no_trace_when_there_is_headroom() {
        let arena = arena_64m();

        assert!(arena.start_trace().is_none());
    }

    // Scenario: zero headroom trips the dynamic criterion and condemns
    // everything.
    #[test]
    fn dynamic_criterion_starts_a_full_collection() {
        let arena = Arena::create(ArenaClass::Vm, 16 << 20).expect("arena should build");
        let pool = arena.pool_create(None);
        let page = arena.lock().alignment;

        arena
            .alloc(pool, &SegPref::default(), 256 * page)
            .expect("should allocate");
        arena.top_gen_mortality_set(0.1);
        arena
            .commit_limit_set(arena.committed())
            .expect("limit matches committed");
        assert_eq!(arena.lock().avail(), 0);

        let trace = arena.start_trace().expect("the dynamic criterion fires");
        assert_eq!(trace.why, StartReason::DynamicCriterion);
        assert_eq!(trace.condemned, arena.committed());
        assert!((trace.mortality - 0.1).abs() < f64::EPSILON);
        assert!(trace.chain.is_none());

        // The only trace slot is taken until the embedder reports back.
        assert!(arena.start_trace().is_none());
        arena.trace_complete(trace);
    }

    // Scenario: a chain whose nursery is over capacity gets condemned.
    #[test]
    fn overfull_chain_starts_a_trace() {
        let arena = arena_64m();
        let chain = arena.chain_create(vec![
            GenParams::new(64 << 10, 0.8),
            GenParams::new(1 << 20, 0.4),
        ]);

        // Under capacity: nothing to do.
        arena.chain_note_allocation(chain, 0, 32 << 10);
        assert!(arena.start_trace().is_none());

        arena.chain_note_allocation(chain, 0, 64 << 10);
        let trace = arena.start_trace().expect("the chain is over capacity");
        assert_eq!(trace.why, StartReason::ChainGen0Capacity);
        assert_eq!(trace.chain, Some(chain));
        assert_eq!(trace.condemned, 96 << 10);
        assert!((trace.mortality - 0.8).abs() < f64::EPSILON);
        assert!((trace.work - (96 << 10) as f64 * 0.25).abs() < f64::EPSILON);

        // While the trace runs, the chain cannot be condemned again.
        arena.chain_note_allocation(chain, 0, 1 << 20);
        assert!(arena.start_trace().is_none());

        arena.trace_complete(trace);
        assert!(arena.start_trace().is_some());
    }

    // A start attempt that fails internally leaves no trace behind
    // and clears the emergency flag for the next attempt.
    #[test]
    fn failed_start_clears_the_emergency_flag() {
        let arena = arena_64m();
        let a = arena.chain_create(vec![GenParams::new(4 << 10, 0.5)]);
        let b = arena.chain_create(vec![GenParams::new(4 << 10, 0.5)]);

        arena.chain_note_allocation(a, 0, 64 << 10);
        let trace = arena.start_trace().expect("chain a is over capacity");
        assert_eq!(trace.chain, Some(a));

        // With the only trace slot taken, chain b's condemnation
        // cannot start; the attempt unwinds and resets the flag.
        arena.set_emergency(true);
        arena.chain_note_allocation(b, 0, 64 << 10);
        assert!(arena.start_trace().is_none());
        assert!(!arena.in_emergency());

        arena.trace_complete(trace);
    }

    // The policy picks the chain that is the most over capacity.
    #[test]
    fn most_negative_deferral_wins() {
        let arena = arena_64m();
        let a = arena.chain_create(vec![GenParams::new(1 << 20, 0.5)]);
        let b = arena.chain_create(vec![GenParams::new(1 << 20, 0.5)]);

        arena.chain_note_allocation(a, 0, (1 << 20) + 4096);
        arena.chain_note_allocation(b, 0, 3 << 20);

        let trace = arena.start_trace().expect("a chain is over capacity");
        assert_eq!(trace.chain, Some(b));
        arena.trace_complete(trace);
    }
}

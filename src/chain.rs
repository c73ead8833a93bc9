//! Generation chains.
//!
//! A chain is an ordered list of generations that the collector
//! condemns as a unit.  The arena only needs enough of the structure to
//! drive the collection-start policy: per-generation capacity,
//! mortality estimate, and a counter of bytes newly allocated into the
//! generation since it was last collected.

/// Per-generation parameters and accounting.
#[derive(Clone, Debug)]
pub struct GenParams {
    /// Bytes this generation is expected to hold before it is worth
    /// collecting.
    pub capacity: usize,
    /// Estimated fraction of condemned bytes that will die, in [0, 1].
    pub mortality: f64,
    /// Bytes allocated into this generation since its last collection.
    pub new_size: usize,
}

impl GenParams {
    pub fn new(capacity: usize, mortality: f64) -> GenParams {
        assert!((0.0..=1.0).contains(&mortality), "mortality out of range");
        GenParams {
            capacity,
            mortality,
            new_size: 0,
        }
    }
}

/// Identifies a chain within its arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChainId(pub(crate) usize);

pub(crate) struct Chain {
    pub gens: Vec<GenParams>,
    pub active_traces: usize,
}

impl Chain {
    pub(crate) fn new(gens: Vec<GenParams>) -> Chain {
        assert!(!gens.is_empty(), "a chain needs at least one generation");
        Chain {
            gens,
            active_traces: 0,
        }
    }

    /// How long collection of this chain can be deferred, in bytes of
    /// headroom left in generation zero.  Negative means the nursery is
    /// over capacity and the chain wants collecting; the policy picks
    /// the most negative chain.
    pub(crate) fn deferral_time(&self) -> f64 {
        if self.active_traces > 0 {
            return f64::MAX;
        }
        self.gens[0].capacity as f64 - self.gens[0].new_size as f64
    }

    /// Condemns the chain for a new trace: takes the longest prefix of
    /// generations that are over capacity (generation zero is over by
    /// the time we get here), and returns the condemned byte count and
    /// the size-weighted mortality estimate.
    pub(crate) fn condemn_auto(&mut self) -> Result<(usize, f64), ()> {
        if self.active_traces > 0 {
            return Err(());
        }

        let mut top = 0;
        while top + 1 < self.gens.len()
            && self.gens[top + 1].new_size >= self.gens[top + 1].capacity
        {
            top += 1;
        }

        let condemned: usize = self.gens[..=top].iter().map(|g| g.new_size).sum();
        if condemned == 0 {
            return Err(());
        }

        let weighted: f64 = self.gens[..=top]
            .iter()
            .map(|g| g.new_size as f64 * g.mortality)
            .sum();
        let mortality = weighted / condemned as f64;

        for gen in &mut self.gens[..=top] {
            gen.new_size = 0;
        }
        Ok((condemned, mortality))
    }

    pub(crate) fn note_allocation(&mut self, gen: usize, bytes: usize) {
        let gen = gen.min(self.gens.len() - 1);
        self.gens[gen].new_size += bytes;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deferral_counts_down_to_negative() {
        let mut chain = Chain::new(vec![GenParams::new(1 << 20, 0.8)]);

        assert_eq!(chain.deferral_time(), (1 << 20) as f64);
        chain.note_allocation(0, 1 << 19);
        assert_eq!(chain.deferral_time(), (1 << 19) as f64);
        chain.note_allocation(0, 1 << 20);
        assert!(chain.deferral_time() < 0.0);
    }

    #[test]
    fn busy_chain_defers_forever() {
        let mut chain = Chain::new(vec![GenParams::new(4096, 0.5)]);
        chain.note_allocation(0, 1 << 20);
        chain.active_traces = 1;

        assert_eq!(chain.deferral_time(), f64::MAX);
        assert!(chain.condemn_auto().is_err());
    }

    #[test]
    fn condemn_takes_over_capacity_prefix() {
        let mut chain = Chain::new(vec![
            GenParams::new(1 << 12, 0.9),
            GenParams::new(1 << 16, 0.5),
            GenParams::new(1 << 20, 0.1),
        ]);
        chain.note_allocation(0, 2 << 12);
        chain.note_allocation(1, 2 << 16);
        // Generation 2 is under capacity and stays out of the condemned set.
        chain.note_allocation(2, 1 << 10);

        let (condemned, mortality) = chain.condemn_auto().expect("condemn should succeed");
        assert_eq!(condemned, (2 << 12) + (2 << 16));
        assert!(mortality > 0.5 && mortality < 0.9);

        // The condemned generations restart their accounting.
        assert_eq!(chain.gens[0].new_size, 0);
        assert_eq!(chain.gens[1].new_size, 0);
        assert_eq!(chain.gens[2].new_size, 1 << 10);
    }

    #[test]
    fn allocations_past_the_last_gen_land_in_it() {
        let mut chain = Chain::new(vec![GenParams::new(4096, 0.5), GenParams::new(8192, 0.2)]);
        chain.note_allocation(7, 100);
        assert_eq!(chain.gens[1].new_size, 100);
    }
}

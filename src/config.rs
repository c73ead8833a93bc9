//! Tunable constants for the arena and the collection-start policy.

/// Estimated cost of scanning, relative to copying, per surviving byte.
pub(crate) const TRACE_COPY_SCAN_RATIO: f64 = 1.5;

/// Fraction of the expected total trace work handed to the collector
/// each time it polls.
pub(crate) const TRACE_WORK_FACTOR: f64 = 0.25;

/// Number of traces that may run concurrently.
pub(crate) const TRACE_LIMIT: usize = 1;

/// Default mortality estimate for the dynamic (top) generation.
pub(crate) const TOP_GEN_MORTALITY: f64 = 0.51;

/// Default cap on the hysteresis fund: freed pages stay mapped until
/// their total size exceeds this.
#[cfg(not(feature = "test_only_small_constants"))]
pub(crate) const SPARE_COMMIT_LIMIT_DEFAULT: usize = 10 << 20;

/// Shrunk cap, to exercise purge pressure in tests.
#[cfg(feature = "test_only_small_constants")]
pub(crate) const SPARE_COMMIT_LIMIT_DEFAULT: usize = 1 << 16;

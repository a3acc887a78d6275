//! Usage snapshots and collection statistics.

use std::time::{Duration, Instant};

/// Snapshot of the space's accounting, in words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Words occupied by objects.
    pub used_in_words: usize,
    /// Words of mapped page memory.
    pub capacity_in_words: usize,
    /// Words owned by objects but allocated outside the pages.
    pub external_in_words: usize,
}

impl SpaceUsage {
    /// Convenience constructor.
    #[must_use]
    pub const fn new(used_in_words: usize, capacity_in_words: usize) -> Self {
        Self {
            used_in_words,
            capacity_in_words,
            external_in_words: 0,
        }
    }
}

/// Type of old-space collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Objects reclaimed in place.
    MarkSweep = 1,
    /// Survivors slid together and empty pages released.
    MarkCompact = 2,
}

/// Internal helper for capturing phase durations.
///
/// ```
/// use rudo_oldgen::stats::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... mark phase work ...
/// timer.end_mark();
///
/// timer.start();
/// // ... sweep phase work ...
/// timer.end_sweep();
/// assert!(timer.compact.is_zero());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Mark phase time.
    pub mark: Duration,
    /// Blocking sweep time (excludes background sweeping).
    pub sweep: Duration,
    /// Compaction time.
    pub compact: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a timer with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    /// End the sweep phase and record its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }

    /// End the compaction phase and record its duration.
    pub fn end_compact(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.compact = start.elapsed();
        }
    }
}

/// Result of one [`PageSpace::collect_garbage`](crate::PageSpace::collect_garbage).
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    /// Sweep or compact.
    pub kind: CollectionKind,
    /// Usage when the collection started.
    pub before: SpaceUsage,
    /// Usage when the collection returned. A background sweep may still be
    /// lowering capacity.
    pub after: SpaceUsage,
    /// Start timestamp in microseconds (see [`crate::clock`]).
    pub start_micros: i64,
    /// End timestamp in microseconds.
    pub end_micros: i64,
    /// Words found reachable.
    pub marked_words: usize,
    /// Objects found reachable.
    pub marked_objects: usize,
    /// Objects slid to a new address. Always zero for a sweep.
    pub objects_moved: usize,
    /// Pages released to the OS before returning.
    pub pages_freed: usize,
    /// Pages handed to the background sweeper.
    pub pages_deferred: usize,
    /// Phase durations.
    pub phases: PhaseTimer,
}

impl CollectionStats {
    /// Wall time of the collection.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_micros(u64::try_from(self.end_micros - self.start_micros).unwrap_or(0))
    }
}

/// Cumulative statistics of a space.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceStats {
    /// Number of completed collections.
    pub collections: usize,
    /// Total time spent in collections, in microseconds.
    pub gc_time_micros: i64,
    /// Highest capacity observed, in words.
    pub high_water_capacity_in_words: usize,
    /// Highest usage observed, in words.
    pub high_water_used_in_words: usize,
    /// The most recent collection, if any.
    pub last_collection: Option<CollectionStats>,
    /// Measured marking throughput.
    pub mark_words_per_micro: usize,
    /// Pages released by background sweeps.
    pub background_pages_freed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_records_only_started_phases() {
        let mut timer = PhaseTimer::new();
        timer.end_mark();
        assert!(timer.mark.is_zero());

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_sweep();
        assert!(timer.sweep >= Duration::from_millis(1));
        assert!(timer.compact.is_zero());
    }

    #[test]
    fn test_collection_duration() {
        let stats = CollectionStats {
            start_micros: 1_000,
            end_micros: 3_500,
            ..CollectionStats::default()
        };
        assert_eq!(stats.duration(), Duration::from_micros(2_500));
        assert_eq!(stats.kind, CollectionKind::None);
    }
}

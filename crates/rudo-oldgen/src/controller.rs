//! Heap growth control.
//!
//! After every collection the controller looks at how much garbage was found
//! and how much time recent collections took, and sets the budget the space
//! may grow by before the next collection is requested:
//!
//! ```text
//! grow_target = after.used * growth_ratio / (100 - growth_ratio)
//!             capped at heap_growth_max_pages pages
//!             (cap doubled while the GC time share exceeds gc_time_ratio)
//!             never below half of the capacity this collection released
//! ```
//!
//! With a growth ratio of 20% the heap settles at about 80% utilization.

use crate::config::PageSpaceConfig;
use crate::history::CollectionHistory;
use crate::page::PAGE_SIZE_IN_WORDS;
use crate::stats::SpaceUsage;

/// Multiplier applied to the growth cap while collections take more than
/// `gc_time_ratio` percent of wall time.
pub const GC_TIME_RELAXATION: usize = 2;

/// Figures computed by the last [`GrowthController::evaluate_garbage_collection`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GrowthEvaluation {
    /// Share of the old capacity reclaimed, in `[0, 1]`.
    pub garbage_ratio: f64,
    /// Share of recent wall time spent collecting, in `[0, 1]`.
    pub gc_time_fraction: f64,
    /// Growth granted until the next collection, in words.
    pub grow_target_words: usize,
}

/// Decides when the old space needs a collection and how far it may grow.
#[derive(Debug, Clone)]
pub struct GrowthController {
    enabled: bool,
    heap_growth_ratio: usize,
    heap_growth_max_pages: usize,
    gc_time_ratio: usize,
    last_usage: SpaceUsage,
    grow_target_words: usize,
    idle_gc_threshold_in_words: usize,
    last_code_collection_in_us: i64,
    history: CollectionHistory,
    last_evaluation: Option<GrowthEvaluation>,
}

impl GrowthController {
    /// A controller with the ratios of `config`, enabled, with an initial
    /// budget of half the growth cap.
    #[must_use]
    pub fn new(config: &PageSpaceConfig) -> Self {
        Self {
            enabled: true,
            heap_growth_ratio: config.heap_growth_ratio,
            heap_growth_max_pages: config.heap_growth_max_pages,
            gc_time_ratio: config.gc_time_ratio,
            last_usage: SpaceUsage::default(),
            grow_target_words: config.heap_growth_max_pages / 2 * PAGE_SIZE_IN_WORDS,
            idle_gc_threshold_in_words: 0,
            last_code_collection_in_us: 0,
            history: CollectionHistory::new(),
            last_evaluation: None,
        }
    }

    /// Enable growth control and take `usage` as the baseline.
    pub fn init(&mut self, usage: SpaceUsage) {
        self.last_usage = usage;
        self.enabled = true;
    }

    /// Resume growth control.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Suspend growth control; the space then grows without collections.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Returns `true` while growth is controlled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Usage recorded after the last collection.
    #[must_use]
    pub const fn last_usage(&self) -> SpaceUsage {
        self.last_usage
    }

    /// Overwrite the baseline usage.
    pub fn set_last_usage(&mut self, usage: SpaceUsage) {
        self.last_usage = usage;
    }

    /// Growth granted since the last collection, in words.
    #[must_use]
    pub const fn grow_target_words(&self) -> usize {
        self.grow_target_words
    }

    /// Capacity above which idle-time collections are considered.
    #[must_use]
    pub const fn idle_gc_threshold_in_words(&self) -> usize {
        self.idle_gc_threshold_in_words
    }

    /// Timestamp of the last code collection attempt.
    #[must_use]
    pub const fn last_code_collection_in_us(&self) -> i64 {
        self.last_code_collection_in_us
    }

    /// Record a code collection attempt.
    pub fn set_last_code_collection_in_us(&mut self, micros: i64) {
        self.last_code_collection_in_us = micros;
    }

    /// Recent collection intervals.
    #[must_use]
    pub const fn history(&self) -> &CollectionHistory {
        &self.history
    }

    /// Figures of the last evaluation, `None` before the first collection.
    #[must_use]
    pub const fn last_evaluation(&self) -> Option<GrowthEvaluation> {
        self.last_evaluation
    }

    /// Returns `true` if capacity in `after` exceeds the granted budget.
    #[must_use]
    pub fn needs_garbage_collection(&self, after: SpaceUsage) -> bool {
        if !self.enabled || self.heap_growth_ratio >= 100 {
            return false;
        }
        after.capacity_in_words
            > self
                .last_usage
                .capacity_in_words
                .saturating_add(self.grow_target_words)
    }

    /// Returns `true` if a full collection of `current` is worth starting
    /// now and is expected to finish before `deadline_micros`.
    #[must_use]
    pub fn needs_idle_garbage_collection(
        &self,
        current: SpaceUsage,
        words_per_micro: usize,
        deadline_micros: i64,
        now_micros: i64,
    ) -> bool {
        if !self.enabled || self.heap_growth_ratio >= 100 {
            return false;
        }
        if current.capacity_in_words <= self.idle_gc_threshold_in_words {
            return false;
        }
        let remaining = deadline_micros.saturating_sub(now_micros);
        if remaining < 0 {
            return false;
        }
        let estimated = current.used_in_words / words_per_micro.max(1);
        i64::try_from(estimated).is_ok_and(|estimated| estimated <= remaining)
    }

    /// Update the budget from a finished collection.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate_garbage_collection(
        &mut self,
        before: SpaceUsage,
        after: SpaceUsage,
        start_micros: i64,
        end_micros: i64,
    ) -> GrowthEvaluation {
        self.history.add_entry(start_micros, end_micros);

        let garbage_ratio = if before.capacity_in_words == 0 {
            0.0
        } else {
            before.used_in_words.saturating_sub(after.used_in_words) as f64
                / before.capacity_in_words as f64
        };
        let gc_time_fraction = self.history.gc_time_fraction();

        let mut cap = self.heap_growth_max_pages.saturating_mul(PAGE_SIZE_IN_WORDS);
        if gc_time_fraction > self.gc_time_ratio as f64 / 100.0 {
            cap = cap.saturating_mul(GC_TIME_RELAXATION);
        }

        let grow_target = if self.heap_growth_ratio >= 100 {
            cap
        } else {
            let ratio = self.heap_growth_ratio;
            (after.used_in_words.saturating_mul(ratio) / (100 - ratio)).min(cap)
        };
        let freed = before
            .capacity_in_words
            .saturating_sub(after.capacity_in_words);
        self.grow_target_words = grow_target.max(freed / 2);

        self.idle_gc_threshold_in_words = after
            .capacity_in_words
            .saturating_add(self.grow_target_words / 2);
        self.last_usage = after;

        let evaluation = GrowthEvaluation {
            garbage_ratio,
            gc_time_fraction,
            grow_target_words: self.grow_target_words,
        };
        self.last_evaluation = Some(evaluation);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_growth_evaluation(
            after,
            garbage_ratio,
            gc_time_fraction,
            self.grow_target_words,
        );

        evaluation
    }
}

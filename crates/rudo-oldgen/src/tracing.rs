//! Collection tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collections, page traffic and growth
//! decisions of the page space.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::page::PageKind;
    use crate::stats::SpaceUsage;

    /// Phases of an old-space collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Trace live objects from the roots.
        Mark,
        /// Reclaim unmarked objects in place.
        Sweep,
        /// Slide survivors together.
        Compact,
    }

    /// Stable identifier for a collection.
    ///
    /// Correlates all events of one collection, including those emitted by
    /// its background sweeper. Starts at 1 and increases monotonically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectionId(pub u64);

    static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique collection ID.
    pub fn next_collection_id() -> CollectionId {
        CollectionId(NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for a whole collection.
    pub fn trace_collection(compact: bool, id: CollectionId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "oldgen_collect",
            compact = compact,
            collection_id = id.0
        )
        .entered()
    }

    /// Create a span for the background sweep of a collection.
    pub fn trace_background_sweep(id: CollectionId, pages: usize) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "oldgen_background_sweep",
            collection_id = id.0,
            pages = pages
        )
        .entered()
    }

    /// Log the start of a collection phase.
    pub fn log_phase_start(phase: GcPhase, used_in_words: usize) {
        tracing::debug!(phase = ?phase, used_in_words, "phase_start");
    }

    /// Log the end of a collection phase.
    pub fn log_phase_end(phase: GcPhase, used_in_words: usize) {
        tracing::debug!(phase = ?phase, used_in_words, "phase_end");
    }

    /// Log a page entering the space.
    pub fn log_page_allocated(kind: PageKind, base: usize, size_in_words: usize, is_large: bool) {
        tracing::trace!(?kind, base, size_in_words, is_large, "page_allocated");
    }

    /// Log a page leaving the space.
    pub fn log_page_freed(kind: PageKind, base: usize, size_in_words: usize) {
        tracing::trace!(?kind, base, size_in_words, "page_freed");
    }

    /// Log a growth request refused by policy.
    pub fn log_growth_denied(requested_words: usize, capacity_in_words: usize) {
        tracing::debug!(requested_words, capacity_in_words, "growth_denied");
    }

    /// Log the outcome of a growth controller evaluation.
    pub fn log_growth_evaluation(
        after: SpaceUsage,
        garbage_ratio: f64,
        gc_time_fraction: f64,
        grow_target_words: usize,
    ) {
        tracing::debug!(
            used_in_words = after.used_in_words,
            capacity_in_words = after.capacity_in_words,
            garbage_ratio,
            gc_time_fraction,
            grow_target_words,
            "growth_evaluated"
        );
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectionId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_collection_id() -> CollectionId {
        CollectionId(0)
    }
}

pub use internal::CollectionId;

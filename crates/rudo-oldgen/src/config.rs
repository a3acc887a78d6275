//! Construction-time configuration of a page space.

use std::time::Duration;

/// Default percentage of heap growth allowed between collections.
pub const DEFAULT_HEAP_GROWTH_RATIO: usize = 20;

/// Default maximum growth between collections, in pages.
pub const DEFAULT_HEAP_GROWTH_MAX_PAGES: usize = 280;

/// Default share (percent) of time spent collecting before the growth cap is
/// relaxed.
pub const DEFAULT_GC_TIME_RATIO: usize = 3;

/// Default minimum time between two code collection attempts.
pub const DEFAULT_CODE_COLLECTION_INTERVAL: Duration = Duration::from_secs(30);

/// How an allocation may grow the space when no existing memory fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Grow only within the budget granted by the growth controller.
    #[default]
    ControlGrowth,
    /// Ignore the growth controller; the hard capacity limit still applies.
    ///
    /// For allocations that must not fail mid-collection, such as promotion.
    ForceGrowth,
}

/// Tunables of a [`PageSpace`](crate::PageSpace).
///
/// Every space carries its own copy, so independent spaces in one process
/// can run different policies.
///
/// # Example
///
/// ```
/// use rudo_oldgen::PageSpaceConfig;
///
/// let config = PageSpaceConfig::default()
///     .with_max_capacity_in_words(1 << 20)
///     .with_concurrent_sweep(false);
/// assert_eq!(config.heap_growth_ratio, 20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpaceConfig {
    /// Hard capacity limit in words; `0` means unlimited.
    pub max_capacity_in_words: usize,
    /// External memory that triggers a collection, in words; `0` means unlimited.
    pub max_external_in_words: usize,
    /// Percentage of heap growth allowed between collections. `100` disables
    /// controller-triggered collections.
    pub heap_growth_ratio: usize,
    /// Cap on growth between collections, in pages.
    pub heap_growth_max_pages: usize,
    /// Percentage of time spent collecting above which the cap is relaxed.
    pub gc_time_ratio: usize,
    /// Keep executable pages read-execute outside allocation and collection.
    pub write_protect_code: bool,
    /// Sweep regular data pages on a background task after marking.
    pub concurrent_sweep: bool,
    /// Minimum time between two code collection attempts.
    pub code_collection_interval: Duration,
    /// Every code collection check succeeds.
    pub always_collect_code: bool,
}

impl Default for PageSpaceConfig {
    fn default() -> Self {
        Self {
            max_capacity_in_words: 0,
            max_external_in_words: 0,
            heap_growth_ratio: DEFAULT_HEAP_GROWTH_RATIO,
            heap_growth_max_pages: DEFAULT_HEAP_GROWTH_MAX_PAGES,
            gc_time_ratio: DEFAULT_GC_TIME_RATIO,
            write_protect_code: true,
            concurrent_sweep: true,
            code_collection_interval: DEFAULT_CODE_COLLECTION_INTERVAL,
            always_collect_code: false,
        }
    }
}

impl PageSpaceConfig {
    /// Set [`max_capacity_in_words`](Self::max_capacity_in_words).
    #[must_use]
    pub const fn with_max_capacity_in_words(mut self, words: usize) -> Self {
        self.max_capacity_in_words = words;
        self
    }

    /// Set [`max_external_in_words`](Self::max_external_in_words).
    #[must_use]
    pub const fn with_max_external_in_words(mut self, words: usize) -> Self {
        self.max_external_in_words = words;
        self
    }

    /// Set [`heap_growth_ratio`](Self::heap_growth_ratio).
    ///
    /// # Panics
    ///
    /// Panics if `percent` is above 100.
    #[must_use]
    pub const fn with_heap_growth_ratio(mut self, percent: usize) -> Self {
        assert!(percent <= 100, "heap growth ratio is a percentage");
        self.heap_growth_ratio = percent;
        self
    }

    /// Set [`heap_growth_max_pages`](Self::heap_growth_max_pages).
    #[must_use]
    pub const fn with_heap_growth_max_pages(mut self, pages: usize) -> Self {
        self.heap_growth_max_pages = pages;
        self
    }

    /// Set [`gc_time_ratio`](Self::gc_time_ratio).
    #[must_use]
    pub const fn with_gc_time_ratio(mut self, percent: usize) -> Self {
        self.gc_time_ratio = percent;
        self
    }

    /// Set [`write_protect_code`](Self::write_protect_code).
    #[must_use]
    pub const fn with_write_protect_code(mut self, enabled: bool) -> Self {
        self.write_protect_code = enabled;
        self
    }

    /// Set [`concurrent_sweep`](Self::concurrent_sweep).
    #[must_use]
    pub const fn with_concurrent_sweep(mut self, enabled: bool) -> Self {
        self.concurrent_sweep = enabled;
        self
    }

    /// Set [`code_collection_interval`](Self::code_collection_interval).
    #[must_use]
    pub const fn with_code_collection_interval(mut self, interval: Duration) -> Self {
        self.code_collection_interval = interval;
        self
    }

    /// Set [`always_collect_code`](Self::always_collect_code).
    #[must_use]
    pub const fn with_always_collect_code(mut self, enabled: bool) -> Self {
        self.always_collect_code = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PageSpaceConfig::default();
        assert_eq!(config.max_capacity_in_words, 0);
        assert_eq!(config.max_external_in_words, 0);
        assert_eq!(config.heap_growth_ratio, 20);
        assert_eq!(config.heap_growth_max_pages, 280);
        assert_eq!(config.gc_time_ratio, 3);
        assert!(config.write_protect_code);
        assert!(config.concurrent_sweep);
        assert_eq!(config.code_collection_interval, Duration::from_secs(30));
        assert!(!config.always_collect_code);
        assert_eq!(GrowthPolicy::default(), GrowthPolicy::ControlGrowth);
    }

    #[test]
    fn test_builders() {
        let config = PageSpaceConfig::default()
            .with_heap_growth_ratio(50)
            .with_heap_growth_max_pages(4)
            .with_write_protect_code(false)
            .with_always_collect_code(true);
        assert_eq!(config.heap_growth_ratio, 50);
        assert_eq!(config.heap_growth_max_pages, 4);
        assert!(!config.write_protect_code);
        assert!(config.always_collect_code);
    }

    #[test]
    #[should_panic(expected = "percentage")]
    fn test_growth_ratio_above_hundred_panics() {
        let _ = PageSpaceConfig::default().with_heap_growth_ratio(101);
    }
}

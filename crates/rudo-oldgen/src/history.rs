//! Ring buffer of recent collection intervals.

/// Number of collections remembered.
pub const HISTORY_LENGTH: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Entry {
    start: i64,
    end: i64,
}

/// The last [`HISTORY_LENGTH`] collections as `(start, end)` microsecond pairs.
///
/// Used to estimate the share of recent wall time spent collecting.
#[derive(Debug, Clone, Default)]
pub struct CollectionHistory {
    entries: [Entry; HISTORY_LENGTH],
    next: usize,
    len: usize,
}

impl CollectionHistory {
    /// An empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [Entry { start: 0, end: 0 }; HISTORY_LENGTH],
            next: 0,
            len: 0,
        }
    }

    /// Record a collection, overwriting the oldest entry once full.
    pub fn add_entry(&mut self, start: i64, end: i64) {
        debug_assert!(start <= end, "collection ends before it starts");
        self.entries[self.next] = Entry { start, end };
        self.next = (self.next + 1) % HISTORY_LENGTH;
        self.len = (self.len + 1).min(HISTORY_LENGTH);
    }

    /// Number of recorded collections.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` before the first collection.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn entry(&self, age: usize) -> Entry {
        debug_assert!(age < self.len);
        self.entries[(self.next + HISTORY_LENGTH - 1 - age) % HISTORY_LENGTH]
    }

    /// Share of the recorded window spent collecting, in `[0, 1]`.
    ///
    /// The window runs from the start of the oldest entry to the end of the
    /// newest. Fewer than two entries give `0.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn gc_time_fraction(&self) -> f64 {
        if self.len < 2 {
            return 0.0;
        }
        let newest = self.entry(0);
        let oldest = self.entry(self.len - 1);
        let window = newest.end - oldest.start;
        if window <= 0 {
            return 0.0;
        }
        let busy: i64 = (0..self.len)
            .map(|age| {
                let entry = self.entry(age);
                entry.end - entry.start
            })
            .sum();
        (busy as f64 / window as f64).clamp(0.0, 1.0)
    }
}

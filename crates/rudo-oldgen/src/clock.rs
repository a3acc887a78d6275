//! Monotonic microsecond timestamps.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds since the first call in this process.
///
/// Timestamps from different spaces are comparable.
#[must_use]
pub fn monotonic_micros() -> i64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    duration_micros(epoch.elapsed())
}

/// Saturating conversion of a duration to microseconds.
#[must_use]
pub fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

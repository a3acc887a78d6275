//! # Lock Ordering Discipline for Deadlock Prevention
//!
//! Every lock of the page space is an [`OrderedMutex`] tagged with a
//! [`LockOrder`]. Locks must be acquired in non-decreasing level:
//!
//! | Level | Lock        | Protects                                        |
//! |-------|-------------|-------------------------------------------------|
//! | 1     | `FreeList`  | a free list; the data list also owns the bump block |
//! | 2     | `Pages`     | page lists, page index, capacity                |
//! | 3     | `Controller`| growth controller and collection statistics     |
//! | 4     | `Tasks`     | background task monitor                         |
//!
//! Both free lists share level 1; when both are needed the data list is
//! taken first. Blocking on the task monitor is only allowed with no other
//! lock held, so sweeper tasks (which take levels 1 and 2) can always finish.
//!
//! In debug builds every acquisition is validated against the locks already
//! held by the current thread; a violation panics with
//! `"Lock ordering violation"`. Release builds compile the checks away.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

const MAX_LOCK_DEPTH: usize = 16;

thread_local!(static HELD_LEVELS: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// A free list (level 1).
    FreeList = 1,
    /// Page lists and capacity (level 2).
    Pages = 2,
    /// Growth controller and statistics (level 3).
    Controller = 3,
    /// Background task monitor (level 4).
    Tasks = 4,
}

impl LockOrder {
    /// Conceptual lock level; acquisition must never go down a level.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// Validate that `tag` may be acquired while holding locks up to `held_max`.
///
/// # Panics
///
/// Panics in debug builds when `tag` is below `held_max`.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, held_max: u8) {
    assert!(
        tag.level() >= held_max,
        "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding a level {held_max} lock",
        tag.level(),
    );
}

#[inline]
#[cfg(not(debug_assertions))]
pub const fn validate_lock_order(_tag: LockOrder, _held_max: u8) {
    // No-op in release builds
}

/// Highest lock level held by this thread, `0` if none.
#[must_use]
pub fn held_lock_level() -> u8 {
    HELD_LEVELS
        .try_with(|levels| levels.borrow().iter().copied().max().unwrap_or(0))
        .unwrap_or(0)
}

/// Assert (debug builds) that the current thread holds no ordered lock.
///
/// Called before blocking on the task monitor.
#[inline]
pub fn debug_assert_no_locks_held(operation: &str) {
    debug_assert!(
        held_lock_level() == 0,
        "Lock ordering violation: {operation} blocks while holding a level {} lock",
        held_lock_level()
    );
}

/// RAII record of one held lock for order validation.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validate and record the acquisition of `tag`.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag, held_lock_level());
            let _ = HELD_LEVELS.try_with(|levels| levels.borrow_mut().push(tag.level()));
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let level = self._tag.level();
        let _ = HELD_LEVELS.try_with(|levels| {
            let mut levels = levels.borrow_mut();
            if let Some(pos) = levels.iter().rposition(|held| *held == level) {
                levels.remove(pos);
            }
        });
    }
}

// ============================================================================
// OrderedMutex
// ============================================================================

/// A `parking_lot` mutex whose acquisitions are order-checked.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    order: LockOrder,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Create a mutex at the given lock level.
    pub const fn new(order: LockOrder, value: T) -> Self {
        Self {
            order,
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, validating the order first.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        let order = LockGuard::new(self.order);
        OrderedGuard {
            guard: self.inner.lock(),
            _order: order,
        }
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Guard returned by [`OrderedMutex::lock`].
///
/// Field order matters: the mutex is released before the order record.
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _order: LockGuard,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

//! Free lists of reusable chunks inside existing pages.
//!
//! Chunks are indexed by size (best fit) and by address (coalescing). Every
//! chunk is also formatted in memory as a free pseudo-object so that pages
//! stay walkable. The data free list additionally owns the bump block, which
//! makes its lock the "data lock" of the space.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::{bytes_to_words, HeapObject, MIN_OBJECT_SIZE, OBJECT_ALIGNMENT};
use crate::page::page_base_of;
use crate::sync::{LockOrder, OrderedGuard, OrderedMutex};

/// A `[top, end)` region of a data page reserved for bump allocation.
///
/// The remainder is left unformatted while allocation is in progress;
/// [`FreeListGuard::make_iterable`] formats it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BumpBlock {
    top: usize,
    end: usize,
}

impl BumpBlock {
    /// Bytes left in the block.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.end - self.top
    }

    /// Current allocation cursor.
    #[must_use]
    pub const fn top(&self) -> usize {
        self.top
    }

    /// End of the block.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }
}

#[derive(Debug, Default)]
struct FreeListState {
    by_size: BTreeMap<usize, BTreeSet<usize>>,
    by_addr: BTreeMap<usize, usize>,
    bump: BumpBlock,
}

impl FreeListState {
    fn insert(&mut self, addr: usize, size: usize) {
        self.by_size.entry(size).or_default().insert(addr);
        self.by_addr.insert(addr, size);
    }

    fn remove(&mut self, addr: usize, size: usize) {
        if let Some(bucket) = self.by_size.get_mut(&size) {
            bucket.remove(&addr);
            if bucket.is_empty() {
                self.by_size.remove(&size);
            }
        }
        self.by_addr.remove(&addr);
    }

    fn pop_bucket(&mut self, size: usize) -> Option<usize> {
        let bucket = self.by_size.get_mut(&size)?;
        let addr = bucket.pop_first()?;
        if bucket.is_empty() {
            self.by_size.remove(&size);
        }
        self.by_addr.remove(&addr);
        Some(addr)
    }
}

/// Free chunks of one page kind.
#[derive(Debug)]
pub struct FreeList {
    state: OrderedMutex<FreeListState>,
    free_words: AtomicUsize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    /// Create an empty free list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: OrderedMutex::new(LockOrder::FreeList, FreeListState::default()),
            free_words: AtomicUsize::new(0),
        }
    }

    /// Take the list's lock for a run of operations.
    pub fn lock(&self) -> FreeListGuard<'_> {
        FreeListGuard {
            state: self.state.lock(),
            free_words: &self.free_words,
        }
    }

    /// Words held in chunks. Readable while another thread holds the lock.
    #[must_use]
    pub fn free_words(&self) -> usize {
        self.free_words.load(Ordering::Relaxed)
    }

    /// Locking convenience for [`FreeListGuard::try_allocate`].
    pub fn try_allocate(&self, size: usize, exact_fit: bool) -> Option<usize> {
        self.lock().try_allocate(size, exact_fit)
    }

    /// Locking convenience for [`FreeListGuard::free`].
    pub fn free(&self, addr: usize, size: usize) {
        self.lock().free(addr, size);
    }
}

/// Exclusive access to a [`FreeList`].
pub struct FreeListGuard<'a> {
    state: OrderedGuard<'a, FreeListState>,
    free_words: &'a AtomicUsize,
}

impl FreeListGuard<'_> {
    /// Take a chunk of `size` bytes.
    ///
    /// With `exact_fit` only a chunk of exactly `size` bytes qualifies;
    /// otherwise the smallest fitting chunk is split and the remainder kept.
    /// The returned memory is unformatted.
    pub fn try_allocate(&mut self, size: usize, exact_fit: bool) -> Option<usize> {
        debug_assert_eq!(size % OBJECT_ALIGNMENT, 0);
        let chunk_size = if exact_fit {
            self.state.by_size.contains_key(&size).then_some(size)?
        } else {
            *self.state.by_size.range(size..).next()?.0
        };
        let addr = self.state.pop_bucket(chunk_size)?;
        self.free_words
            .fetch_sub(bytes_to_words(chunk_size), Ordering::Relaxed);

        let remainder = chunk_size - size;
        if remainder > 0 {
            debug_assert!(remainder >= MIN_OBJECT_SIZE);
            self.insert_formatted(addr + size, remainder);
        }
        Some(addr)
    }

    /// Take the largest chunk if it holds at least `min_size` bytes.
    ///
    /// Returns the chunk address and its whole size.
    pub fn try_allocate_large(&mut self, min_size: usize) -> Option<(usize, usize)> {
        let (&size, _) = self.state.by_size.last_key_value()?;
        if size < min_size {
            return None;
        }
        let addr = self.state.pop_bucket(size)?;
        self.free_words
            .fetch_sub(bytes_to_words(size), Ordering::Relaxed);
        Some((addr, size))
    }

    /// Return `[addr, addr + size)` to the list, merging with free neighbours
    /// on the same page.
    pub fn free(&mut self, addr: usize, size: usize) {
        assert!(
            size >= MIN_OBJECT_SIZE && size % OBJECT_ALIGNMENT == 0,
            "invalid free chunk of {size} bytes at {addr:#x}"
        );
        let page = page_base_of(addr);
        let mut start = addr;
        let mut total = size;

        let previous = self
            .state
            .by_addr
            .range(..addr)
            .next_back()
            .map(|(&a, &s)| (a, s));
        if let Some((prev_addr, prev_size)) = previous {
            if prev_addr + prev_size == addr && page_base_of(prev_addr) == page {
                self.state.remove(prev_addr, prev_size);
                self.free_words
                    .fetch_sub(bytes_to_words(prev_size), Ordering::Relaxed);
                start = prev_addr;
                total += prev_size;
            }
        }

        let next = addr + size;
        if page_base_of(next) == page {
            if let Some(&next_size) = self.state.by_addr.get(&next) {
                self.state.remove(next, next_size);
                self.free_words
                    .fetch_sub(bytes_to_words(next_size), Ordering::Relaxed);
                total += next_size;
            }
        }

        self.insert_formatted(start, total);
    }

    fn insert_formatted(&mut self, addr: usize, size: usize) {
        // SAFETY: chunks handed to the list are space-owned, writable memory.
        unsafe { HeapObject::format_free(addr, size) };
        self.state.insert(addr, size);
        self.free_words
            .fetch_add(bytes_to_words(size), Ordering::Relaxed);
    }

    /// Drop every chunk; the memory is left as is for the sweeper to rebuild.
    pub fn reset(&mut self) {
        self.state.by_size.clear();
        self.state.by_addr.clear();
        self.free_words.store(0, Ordering::Relaxed);
    }

    /// Number of chunks in the list.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.state.by_addr.len()
    }

    /// Returns `true` if `addr` starts a chunk of the list.
    #[must_use]
    pub fn contains_chunk(&self, addr: usize) -> bool {
        self.state.by_addr.contains_key(&addr)
    }

    // ------------------------------------------------------------------------
    // Bump block
    // ------------------------------------------------------------------------

    /// The current bump block.
    #[must_use]
    pub fn bump(&self) -> BumpBlock {
        self.state.bump
    }

    /// Carve `size` bytes off the bump block.
    pub fn bump_allocate(&mut self, size: usize) -> Option<usize> {
        let bump = &mut self.state.bump;
        if bump.remaining() < size {
            return None;
        }
        let result = bump.top;
        bump.top += size;
        Some(result)
    }

    /// Replace the bump block, returning the old remainder to the list.
    pub fn set_bump(&mut self, top: usize, end: usize) {
        debug_assert!(top <= end);
        debug_assert!(top == end || page_base_of(top) == page_base_of(end - 1));
        self.abandon_bump();
        self.state.bump = BumpBlock { top, end };
    }

    /// Return the unused bump remainder to the list. Idempotent.
    pub fn abandon_bump(&mut self) {
        let BumpBlock { top, end } = std::mem::take(&mut self.state.bump);
        if top < end {
            self.free(top, end - top);
        }
    }

    /// Format the bump remainder as a free chunk so the page can be walked.
    ///
    /// The remainder stays the bump block; it is not entered into the list.
    pub fn make_iterable(&mut self) {
        let BumpBlock { top, end } = self.state.bump;
        if top < end {
            // SAFETY: the bump remainder is unused, writable page memory.
            unsafe { HeapObject::format_free(top, end - top) };
        }
    }
}

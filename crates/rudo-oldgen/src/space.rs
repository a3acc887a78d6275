//! The old-generation page space.
//!
//! # Locking
//!
//! | Lock                        | Level | Guards                                |
//! |-----------------------------|-------|---------------------------------------|
//! | data free list ("data lock")| 1     | data chunks, bump block               |
//! | executable free list        | 1     | code chunks                           |
//! | pages                       | 2     | page lists, index, capacity           |
//! | controller, statistics      | 3     | growth controller, [`SpaceStats`]     |
//! | task monitor                | 4     | in-flight background sweeps           |
//!
//! `used_in_words` and `external_in_words` are atomics so that allocation
//! does not need the pages lock. Capacity is only changed under the pages
//! lock, and the growth check happens in the same critical section as the
//! increase, so two allocators can never both pass the check for the last
//! page of the budget.
//!
//! # Background sweeping
//!
//! With [`PageSpaceConfig::concurrent_sweep`], a collection only sweeps large
//! and executable pages itself. The data pages present at marking time are
//! handed to a sweeper task that walks them without locks: the free list was
//! emptied and the bump block abandoned, so no allocator touches those pages
//! until the task gives their chunks back. Anything that walks pages or
//! frees them waits for the task first.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::clock::{duration_micros, monotonic_micros};
use crate::compactor;
use crate::config::{GrowthPolicy, PageSpaceConfig};
use crate::controller::GrowthController;
use crate::freelist::{FreeList, FreeListGuard};
use crate::lists::{ListKind, PageLists};
use crate::marker::Marker;
use crate::object::{
    bytes_to_words, checked_object_size, is_object_aligned, HeapObject, ObjectTracer,
    ObjectVisitor, PointerVisitor, RootSet,
};
use crate::page::{
    large_page_size_in_words, page_base_of, Page, PageKind, ALLOCATABLE_PAGE_SIZE,
    PAGE_SIZE_IN_WORDS,
};
use crate::stats::{CollectionKind, CollectionStats, PhaseTimer, SpaceStats, SpaceUsage};
use crate::sweeper;
use crate::sync::{LockOrder, OrderedMutex};
use crate::task::{InlineRunner, TaskMonitor, TaskRunner, WorkerPool};
use crate::tracing::internal::{next_collection_id, CollectionId};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_start, GcPhase};

/// Marking throughput assumed before the first collection, in words per
/// microsecond.
pub const INITIAL_MARK_WORDS_PER_MICRO: usize = 20;

/// Snapshot of one page, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Start of the page's memory.
    pub base: usize,
    /// End of the page's memory.
    pub end: usize,
    /// Page category.
    pub kind: PageKind,
    /// Single-object page.
    pub is_large: bool,
    /// Externally supplied page.
    pub is_image: bool,
    /// Start of the object area.
    pub object_start: usize,
    /// End of the object area.
    pub object_end: usize,
    /// Live bytes found by the last sweep.
    pub used_in_bytes: usize,
    /// Current write protection.
    pub write_protected: bool,
}

impl PageInfo {
    fn of(page: &Page) -> Self {
        Self {
            base: page.base(),
            end: page.end(),
            kind: page.kind(),
            is_large: page.is_large(),
            is_image: page.is_image_page(),
            object_start: page.object_start(),
            object_end: page.object_end(),
            used_in_bytes: page.used_in_bytes(),
            write_protected: page.is_write_protected(),
        }
    }
}

/// The old-generation heap: pages, free lists, growth control and
/// collection.
///
/// A space is shared through an [`Arc`] so that background sweeper tasks can
/// keep it alive.
///
/// # Example
///
/// ```
/// use rudo_oldgen::{GrowthPolicy, NoPointers, PageKind, PageSpace, PageSpaceConfig};
///
/// let space = PageSpace::new(PageSpaceConfig::default(), NoPointers);
/// let object = space
///     .try_allocate(64, PageKind::Data, GrowthPolicy::ControlGrowth)
///     .expect("fresh space has room");
/// assert!(space.contains(object.as_ptr() as usize));
/// assert_eq!(space.used_in_words(), 64 / std::mem::size_of::<usize>());
///
/// let mut roots: Vec<usize> = Vec::new();
/// space.collect_garbage(false, &mut roots);
/// space.wait_for_tasks();
/// assert_eq!(space.used_in_words(), 0);
/// ```
pub struct PageSpace {
    config: PageSpaceConfig,
    tracer: Box<dyn ObjectTracer>,
    runner: Arc<dyn TaskRunner>,
    free_lists: [FreeList; PageKind::COUNT],
    pages: OrderedMutex<PageLists>,
    controller: OrderedMutex<GrowthController>,
    stats: OrderedMutex<SpaceStats>,
    tasks: Arc<TaskMonitor>,
    used_in_words: AtomicUsize,
    external_in_words: AtomicUsize,
    high_water_used: AtomicUsize,
    high_water_capacity: AtomicUsize,
    mark_words_per_micro: AtomicUsize,
    write_protected: AtomicBool,
}

impl std::fmt::Debug for PageSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSpace")
            .field("config", &self.config)
            .field("usage", &self.usage())
            .field("tasks", &self.tasks.count())
            .finish_non_exhaustive()
    }
}

impl PageSpace {
    /// Create a space whose background sweeps run on a private worker
    /// thread.
    ///
    /// Falls back to sweeping on the collecting thread when the worker
    /// cannot be spawned.
    pub fn new(config: PageSpaceConfig, tracer: impl ObjectTracer + 'static) -> Arc<Self> {
        let runner: Arc<dyn TaskRunner> = match WorkerPool::new(1) {
            Ok(pool) => Arc::new(pool),
            Err(_) => Arc::new(InlineRunner),
        };
        Self::with_task_runner(config, tracer, runner)
    }

    /// Create a space submitting background sweeps to `runner`.
    pub fn with_task_runner(
        config: PageSpaceConfig,
        tracer: impl ObjectTracer + 'static,
        runner: Arc<dyn TaskRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tracer: Box::new(tracer),
            runner,
            free_lists: [FreeList::new(), FreeList::new()],
            pages: OrderedMutex::new(LockOrder::Pages, PageLists::new()),
            controller: OrderedMutex::new(LockOrder::Controller, GrowthController::new(&config)),
            stats: OrderedMutex::new(LockOrder::Controller, SpaceStats::default()),
            tasks: Arc::new(TaskMonitor::new()),
            used_in_words: AtomicUsize::new(0),
            external_in_words: AtomicUsize::new(0),
            high_water_used: AtomicUsize::new(0),
            high_water_capacity: AtomicUsize::new(0),
            mark_words_per_micro: AtomicUsize::new(INITIAL_MARK_WORDS_PER_MICRO),
            write_protected: AtomicBool::new(false),
        })
    }

    /// The configuration the space was built with.
    #[must_use]
    pub const fn config(&self) -> &PageSpaceConfig {
        &self.config
    }

    fn free_list(&self, kind: PageKind) -> &FreeList {
        &self.free_lists[kind.index()]
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocate an object of `size` bytes (rounded up to the object
    /// alignment) with a formatted header.
    ///
    /// Tries the bump block (data only), then the free list, then a fresh
    /// page; requests of [`ALLOCATABLE_PAGE_SIZE`] or more get a dedicated
    /// large page. Returns `None` when the memory is not there, `size`
    /// exceeds [`MAX_OBJECT_SIZE`](crate::object::MAX_OBJECT_SIZE), or `policy` forbids growing; the caller
    /// collects and retries.
    ///
    /// # Panics
    ///
    /// Panics while the space is write protected.
    pub fn try_allocate(
        &self,
        size: usize,
        kind: PageKind,
        policy: GrowthPolicy,
    ) -> Option<NonNull<u8>> {
        let size = checked_object_size(size)?;
        if size >= ALLOCATABLE_PAGE_SIZE {
            return self.allocate_large_page(size, kind, policy);
        }
        let mut free_list = self.free_list(kind).lock();
        self.allocate_small(&mut free_list, size, kind, policy)
    }

    /// Allocate ignoring the growth controller.
    ///
    /// # Panics
    ///
    /// Panics if even forced growth fails: the hard capacity limit is
    /// reached or the OS is out of memory.
    pub fn allocate_forced(&self, size: usize, kind: PageKind) -> NonNull<u8> {
        self.try_allocate(size, kind, GrowthPolicy::ForceGrowth)
            .unwrap_or_else(|| {
                panic!(
                    "old space exhausted: cannot allocate {size} bytes of {kind:?} (capacity {} words, limit {} words)",
                    self.capacity_in_words(),
                    self.config.max_capacity_in_words
                )
            })
    }

    /// Allocate from the bump block, refilling it from the largest free
    /// chunk or a fresh page when it runs out.
    pub fn try_allocate_data_bump(&self, size: usize, policy: GrowthPolicy) -> Option<NonNull<u8>> {
        let mut free_list = self.free_list(PageKind::Data).lock();
        self.allocate_data_bump(&mut free_list, checked_object_size(size)?, policy)
    }

    /// Take the data lock for a run of allocations.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire_data_lock(&self) -> DataLock<'_> {
        DataLock {
            space: self,
            free_list: self.free_list(PageKind::Data).lock(),
        }
    }

    /// Give the unused rest of the bump block back to the free list.
    ///
    /// Calling this with no bump block is a no-op.
    pub fn abandon_bump_allocation(&self) {
        self.free_list(PageKind::Data).lock().abandon_bump();
    }

    fn assert_writable(&self) {
        assert!(
            !self.write_protected.load(Ordering::Relaxed),
            "allocation into a write-protected space"
        );
    }

    fn allocate_small(
        &self,
        free_list: &mut FreeListGuard<'_>,
        size: usize,
        kind: PageKind,
        policy: GrowthPolicy,
    ) -> Option<NonNull<u8>> {
        self.assert_writable();
        if kind == PageKind::Data {
            if let Some(addr) = free_list.bump_allocate(size) {
                return self.finish_allocation(addr, size);
            }
        }

        let protect_code = kind == PageKind::Executable && self.config.write_protect_code;
        if protect_code {
            self.pages.lock().write_protect_code(false, None);
        }
        let addr = free_list
            .try_allocate(size, false)
            .or_else(|| self.allocate_in_fresh_page(free_list, size, kind, policy));
        if protect_code {
            // The target page stays writable until the caller protects code.
            self.pages
                .lock()
                .write_protect_code(true, addr.map(page_base_of));
        }
        self.finish_allocation(addr?, size)
    }

    fn allocate_data_bump(
        &self,
        free_list: &mut FreeListGuard<'_>,
        size: usize,
        policy: GrowthPolicy,
    ) -> Option<NonNull<u8>> {
        if size >= ALLOCATABLE_PAGE_SIZE {
            return self.allocate_large_page(size, PageKind::Data, policy);
        }
        self.assert_writable();
        if free_list.bump().remaining() < size {
            if let Some((addr, chunk)) = free_list.try_allocate_large(size) {
                free_list.set_bump(addr, addr + chunk);
            } else {
                let addr =
                    self.allocate_in_fresh_page(free_list, size, PageKind::Data, policy)?;
                return self.finish_allocation(addr, size);
            }
        }
        let addr = free_list.bump_allocate(size)?;
        self.finish_allocation(addr, size)
    }

    /// Map a new regular page and carve `size` bytes from its start.
    ///
    /// The rest becomes the bump block (data) or a free chunk (code).
    fn allocate_in_fresh_page(
        &self,
        free_list: &mut FreeListGuard<'_>,
        size: usize,
        kind: PageKind,
        policy: GrowthPolicy,
    ) -> Option<usize> {
        let mut lists = self.pages.lock();
        if !self.can_grow(&lists, PAGE_SIZE_IN_WORDS, policy) {
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_growth_denied(PAGE_SIZE_IN_WORDS, lists.capacity_in_words());
            return None;
        }
        let page = Page::allocate(PAGE_SIZE_IN_WORDS, kind)?;
        let start = page.object_start();
        let end = page.object_end();
        lists.add(page, ListKind::regular(kind));
        self.high_water_capacity
            .fetch_max(lists.capacity_in_words(), Ordering::Relaxed);
        drop(lists);

        let rest = start + size;
        match kind {
            PageKind::Data => free_list.set_bump(rest, end),
            PageKind::Executable if rest < end => free_list.free(rest, end - rest),
            PageKind::Executable => {}
        }
        Some(start)
    }

    fn allocate_large_page(
        &self,
        size: usize,
        kind: PageKind,
        policy: GrowthPolicy,
    ) -> Option<NonNull<u8>> {
        self.assert_writable();
        let page_words = large_page_size_in_words(size);
        let mut lists = self.pages.lock();
        if !self.can_grow(&lists, page_words, policy) {
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_growth_denied(page_words, lists.capacity_in_words());
            return None;
        }
        let mut page = Page::allocate_large(page_words, kind)?;
        let start = page.object_start();
        page.set_object_end(start + size);
        page.set_used_in_bytes(size);
        // Walkers may see the page as soon as it is listed, and large
        // allocations hold no free-list lock, so the header goes in first.
        // SAFETY: the page is freshly mapped and not yet published.
        let object = unsafe { HeapObject::format(start, size) };
        lists.add(page, ListKind::Large);
        self.high_water_capacity
            .fetch_max(lists.capacity_in_words(), Ordering::Relaxed);
        drop(lists);
        self.account_allocation(size);
        NonNull::new(object.as_ptr())
    }

    /// Whether capacity may grow by `words`. Called under the pages lock,
    /// so the check and the increase that follows are one step.
    fn can_grow(&self, lists: &PageLists, words: usize, policy: GrowthPolicy) -> bool {
        let capacity = lists.capacity_in_words() + words;
        let limit = self.config.max_capacity_in_words;
        if limit != 0 && capacity > limit {
            return false;
        }
        match policy {
            GrowthPolicy::ForceGrowth => true,
            GrowthPolicy::ControlGrowth => {
                let after = SpaceUsage {
                    used_in_words: self.used_in_words(),
                    capacity_in_words: capacity,
                    external_in_words: self.external_in_words(),
                };
                !self.controller.lock().needs_garbage_collection(after)
            }
        }
    }

    fn account_allocation(&self, size: usize) {
        let words = bytes_to_words(size);
        let used = self.used_in_words.fetch_add(words, Ordering::Relaxed) + words;
        self.high_water_used.fetch_max(used, Ordering::Relaxed);
    }

    fn finish_allocation(&self, addr: usize, size: usize) -> Option<NonNull<u8>> {
        self.account_allocation(size);
        // SAFETY: `addr` was just carved out of writable page memory.
        let object = unsafe { HeapObject::format(addr, size) };
        NonNull::new(object.as_ptr())
    }

    /// Shrink the large object at `object` to `new_size` bytes, giving the
    /// tail pages back to the OS.
    ///
    /// # Panics
    ///
    /// Panics if `object` does not start a large page or `new_size` exceeds
    /// its current size.
    pub fn truncate_large_object(&self, object: NonNull<u8>, new_size: usize) {
        let addr = object.as_ptr() as usize;
        let new_size = checked_object_size(new_size).unwrap_or(usize::MAX);
        let mut lists = self.pages.lock();
        let Some(page) = lists
            .lookup(addr)
            .filter(|page| page.list == ListKind::Large && page.base == addr)
        else {
            panic!("{addr:#x} is not a large object");
        };
        let Some(page) = lists.page_mut(page) else {
            unreachable!("indexed page {addr:#x} is missing from its list");
        };
        // SAFETY: a large page starts with its object.
        let object = unsafe { HeapObject::from_addr(addr) };
        let old_size = object.size();
        assert!(
            new_size <= old_size,
            "cannot grow large object {addr:#x} from {old_size} to {new_size} bytes"
        );

        let protected = page.is_write_protected();
        if protected {
            page.write_protect(false);
        }
        object.set_size(new_size);
        let released = page.truncate(new_size);
        page.set_used_in_bytes(new_size);
        if protected {
            page.write_protect(true);
        }
        lists.shrink_page(addr, released);
        drop(lists);
        self.used_in_words
            .fetch_sub(bytes_to_words(old_size - new_size), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // External memory
    // ------------------------------------------------------------------------

    /// Account `size` bytes held by objects outside the pages.
    pub fn allocate_external(&self, size: usize) {
        self.external_in_words
            .fetch_add(bytes_to_words(size), Ordering::Relaxed);
    }

    /// Release external bytes accounted by [`allocate_external`](Self::allocate_external).
    pub fn free_external(&self, size: usize) {
        let words = bytes_to_words(size);
        let previous = self
            .external_in_words
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(words))
            })
            .unwrap_or(0);
        debug_assert!(previous >= words, "freeing more external memory than allocated");
    }

    /// Returns `true` if external memory is over its configured limit.
    #[must_use]
    pub fn needs_external_gc(&self) -> bool {
        let limit = self.config.max_external_in_words;
        limit != 0 && self.external_in_words() > limit
    }

    // ------------------------------------------------------------------------
    // Growth control
    // ------------------------------------------------------------------------

    /// Returns `true` if the space has grown past its budget or external
    /// memory is over its limit.
    #[must_use]
    pub fn needs_garbage_collection(&self) -> bool {
        let usage = self.usage();
        self.controller.lock().needs_garbage_collection(usage) || self.needs_external_gc()
    }

    /// Enable growth control with the current usage as the baseline.
    pub fn init_growth_control(&self) {
        let usage = self.usage();
        self.controller.lock().init(usage);
    }

    /// Enable or disable growth control, e.g. around bulk loading.
    pub fn set_growth_control_state(&self, enabled: bool) {
        let mut controller = self.controller.lock();
        if enabled {
            controller.enable();
        } else {
            controller.disable();
        }
    }

    /// Returns `true` while growth is controlled.
    #[must_use]
    pub fn growth_control_state(&self) -> bool {
        self.controller.lock().is_enabled()
    }

    /// A copy of the growth controller state.
    #[must_use]
    pub fn growth_controller(&self) -> GrowthController {
        self.controller.lock().clone()
    }

    /// Returns `true` if an idle-time mark-sweep is worthwhile and expected
    /// to finish before `deadline_micros` (see [`crate::clock`]).
    ///
    /// Always `false` while a background sweep is running.
    #[must_use]
    pub fn should_perform_idle_mark_sweep(&self, deadline_micros: i64) -> bool {
        if self.tasks.count() > 0 {
            return false;
        }
        let usage = self.usage();
        let words_per_micro = self.mark_words_per_micro.load(Ordering::Relaxed);
        self.controller.lock().needs_idle_garbage_collection(
            usage,
            words_per_micro,
            deadline_micros,
            monotonic_micros(),
        )
    }

    /// Rate limiter for code collection: `true` if the configured interval
    /// has passed since the last attempt, which this call then records.
    #[must_use]
    pub fn should_collect_code(&self) -> bool {
        let now = monotonic_micros();
        let mut controller = self.controller.lock();
        let interval = duration_micros(self.config.code_collection_interval);
        let due = self.config.always_collect_code
            || controller.last_code_collection_in_us() == 0
            || now - controller.last_code_collection_in_us() >= interval;
        if due {
            controller.set_last_code_collection_in_us(now.max(1));
        }
        due
    }

    // ------------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------------

    /// Block until no background sweep is running.
    pub fn wait_for_tasks(&self) {
        self.tasks.wait_idle();
    }

    /// Number of background sweeps in flight.
    #[must_use]
    pub fn sweeper_tasks(&self) -> usize {
        self.tasks.count()
    }

    /// Lock both free lists with no background sweep running.
    ///
    /// New sweeps are only started under both locks, so the space stays
    /// quiescent while the guards are held.
    fn lock_quiescent(&self) -> (FreeListGuard<'_>, FreeListGuard<'_>) {
        loop {
            self.tasks.wait_idle();
            let data = self.free_list(PageKind::Data).lock();
            let code = self.free_list(PageKind::Executable).lock();
            if self.tasks.count() == 0 {
                return (data, code);
            }
        }
    }

    /// Run a full collection.
    ///
    /// Marks everything reachable from `roots` and from objects on image
    /// pages, then reclaims the rest: by sliding compaction when `compact`,
    /// otherwise by sweeping, with regular data pages swept in the
    /// background if so configured. Returns once the space is usable again.
    ///
    /// With `compact`, every slot referencing a moved object is updated,
    /// including those in `roots`.
    pub fn collect_garbage(self: &Arc<Self>, compact: bool, roots: &mut dyn RootSet) -> CollectionStats {
        let id = next_collection_id();
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_collection(compact, id);

        let (mut data, mut code) = self.lock_quiescent();
        let start = monotonic_micros();
        let mut timer = PhaseTimer::new();

        let mut lists = self.pages.lock();
        let before = self.usage_locked(&lists);
        lists.write_protect_all(false);
        data.abandon_bump();
        data.reset();
        code.reset();

        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Mark, before.used_in_words);
        timer.start();
        let (marked_words, marked_objects) = {
            let mut marker = Marker::new(&lists, &*self.tracer);
            marker.mark_image_pages();
            marker.mark_roots(roots);
            marker.drain();
            (marker.marked_words(), marker.marked_objects())
        };
        timer.end_mark();
        self.used_in_words.store(marked_words, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Mark, marked_words);

        let mut pages_freed = 0;
        let mut objects_moved = 0;
        let mut deferred = Vec::new();
        if compact {
            #[cfg(feature = "tracing")]
            log_phase_start(GcPhase::Compact, marked_words);
            timer.start();
            let result = compactor::compact(&mut lists, &mut data, &mut code, &*self.tracer, roots);
            pages_freed += result.pages_released;
            objects_moved = result.objects_moved;
            pages_freed += sweeper::sweep_large_pages(&mut lists);
            timer.end_compact();
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Compact, marked_words);
        } else {
            #[cfg(feature = "tracing")]
            log_phase_start(GcPhase::Sweep, marked_words);
            timer.start();
            pages_freed += sweeper::sweep_large_pages(&mut lists);
            pages_freed += sweeper::sweep_pages(&mut lists, PageKind::Executable, &mut code);
            if self.config.concurrent_sweep && !lists.protected {
                deferred = lists
                    .data
                    .iter()
                    .map(|page| (page.object_start(), page.object_end()))
                    .collect();
            } else {
                pages_freed += sweeper::sweep_pages(&mut lists, PageKind::Data, &mut data);
            }
            timer.end_sweep();
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Sweep, marked_words);
        }

        if lists.protected {
            lists.write_protect_all(true);
        } else if self.config.write_protect_code {
            lists.write_protect_code(true, None);
        }
        let after = self.usage_locked(&lists);
        // Registered before the locks go, so no collection can slip in
        // between and free the deferred pages.
        let sweep_token = (!deferred.is_empty()).then(|| self.tasks.begin());
        drop(lists);
        drop(code);
        drop(data);

        let end = monotonic_micros();
        self.controller
            .lock()
            .evaluate_garbage_collection(before, after, start, end);
        let mark_micros = duration_micros(timer.mark);
        if mark_micros > 0 {
            let speed = usize::try_from(i64::try_from(marked_words).unwrap_or(i64::MAX) / mark_micros)
                .unwrap_or(0)
                .max(1);
            self.mark_words_per_micro.store(speed, Ordering::Relaxed);
        }

        let collection = CollectionStats {
            kind: if compact {
                CollectionKind::MarkCompact
            } else {
                CollectionKind::MarkSweep
            },
            before,
            after,
            start_micros: start,
            end_micros: end,
            marked_words,
            marked_objects,
            objects_moved,
            pages_freed,
            pages_deferred: deferred.len(),
            phases: timer,
        };
        {
            let mut stats = self.stats.lock();
            stats.collections += 1;
            stats.gc_time_micros += end - start;
            stats.last_collection = Some(collection);
        }

        if let Some(token) = sweep_token {
            let space = Arc::clone(self);
            self.runner.run(Box::new(move || {
                let _token = token;
                space.sweep_deferred(deferred, id);
            }));
        }
        collection
    }

    fn sweep_deferred(&self, pages: Vec<(usize, usize)>, id: CollectionId) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_background_sweep(id, pages.len());
        #[cfg(not(feature = "tracing"))]
        let _ = id;

        let mut released = 0;
        for (start, end) in pages {
            // SAFETY: deferred pages stay alive and untouched by allocators
            // until their chunks are handed back below.
            let swept = unsafe { sweeper::sweep_region(start, end) };
            let mut free_list = self.free_list(PageKind::Data).lock();
            let mut lists = self.pages.lock();
            let Some(page) = lists.lookup(start) else {
                continue;
            };
            if swept.live_bytes == 0 {
                if let Some(position) = lists.position(page) {
                    lists.release(ListKind::Data, position);
                    released += 1;
                }
                continue;
            }
            if let Some(page) = lists.page_mut(page) {
                page.set_used_in_bytes(swept.live_bytes);
            }
            drop(lists);
            for (addr, size) in swept.free_chunks {
                free_list.free(addr, size);
            }
        }
        self.stats.lock().background_pages_freed += released;
    }

    // ------------------------------------------------------------------------
    // Protection
    // ------------------------------------------------------------------------

    /// Write protect (or unprotect) every page the space owns.
    ///
    /// Data pages become read-only and code pages read-execute. While
    /// protected, allocation panics.
    pub fn write_protect(&self, read_only: bool) {
        let (mut data, _code) = self.lock_quiescent();
        if read_only {
            // Walking a protected page must not need a header write.
            data.abandon_bump();
        }
        let mut lists = self.pages.lock();
        lists.write_protect_all(read_only);
        lists.protected = read_only;
        self.write_protected.store(read_only, Ordering::Relaxed);
    }

    /// Write protect (or unprotect) executable pages only.
    pub fn write_protect_code(&self, read_only: bool) {
        let _code = self.free_list(PageKind::Executable).lock();
        self.pages.lock().write_protect_code(read_only, None);
    }

    /// Returns `true` while the whole space is write protected.
    #[must_use]
    pub fn is_write_protected(&self) -> bool {
        self.write_protected.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Image pages
    // ------------------------------------------------------------------------

    /// Register an externally supplied region of walkable objects.
    ///
    /// Image pages are never allocated in, swept or freed, and do not count
    /// towards capacity. Their objects are roots of every collection.
    ///
    /// # Safety
    ///
    /// `[start, start + size)` must hold formatted objects, stay valid for
    /// the life of the space, and be writable if its objects reference
    /// objects of the space (compaction rewrites those slots).
    pub unsafe fn setup_image_page(&self, start: NonNull<u8>, size: usize, executable: bool) {
        let kind = if executable {
            PageKind::Executable
        } else {
            PageKind::Data
        };
        // SAFETY: forwarded from the caller.
        let page = unsafe { Page::image(start.as_ptr() as usize, size, kind) };
        self.pages.lock().add(page, ListKind::Image);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Current accounting.
    #[must_use]
    pub fn usage(&self) -> SpaceUsage {
        let lists = self.pages.lock();
        self.usage_locked(&lists)
    }

    fn usage_locked(&self, lists: &PageLists) -> SpaceUsage {
        SpaceUsage {
            used_in_words: self.used_in_words(),
            capacity_in_words: lists.capacity_in_words(),
            external_in_words: self.external_in_words(),
        }
    }

    /// Words occupied by objects.
    #[must_use]
    pub fn used_in_words(&self) -> usize {
        self.used_in_words.load(Ordering::Relaxed)
    }

    /// Words of mapped page memory.
    #[must_use]
    pub fn capacity_in_words(&self) -> usize {
        self.pages.lock().capacity_in_words()
    }

    /// Words held outside the pages.
    #[must_use]
    pub fn external_in_words(&self) -> usize {
        self.external_in_words.load(Ordering::Relaxed)
    }

    /// Returns `true` if `addr` lies in any page, image pages included.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.pages.lock().contains(addr)
    }

    /// Returns `true` if `addr` lies in a page of `kind`.
    #[must_use]
    pub fn contains_kind(&self, addr: usize, kind: PageKind) -> bool {
        self.pages
            .lock()
            .lookup(addr)
            .is_some_and(|page| page.kind == kind)
    }

    /// Returns `true` if `addr` lies in a data page.
    #[must_use]
    pub fn data_contains(&self, addr: usize) -> bool {
        self.contains_kind(addr, PageKind::Data)
    }

    /// Returns `true` if `addr` is an aligned address inside the object area
    /// of some page.
    #[must_use]
    pub fn is_valid_address(&self, addr: usize) -> bool {
        if !is_object_aligned(addr) {
            return false;
        }
        let lists = self.pages.lock();
        lists
            .lookup(addr)
            .and_then(|page| lists.page(page))
            .is_some_and(|page| addr >= page.object_start() && addr < page.object_end())
    }

    /// Base of the page holding the object starting at `addr`, by masking.
    ///
    /// Valid for every object on a page the space allocated; not for image
    /// pages.
    #[must_use]
    pub const fn page_of(addr: usize) -> usize {
        page_base_of(addr)
    }

    /// Snapshot of the page whose memory holds `addr`.
    #[must_use]
    pub fn page_containing(&self, addr: usize) -> Option<PageInfo> {
        let lists = self.pages.lock();
        let page = lists.lookup(addr)?;
        lists.page(page).map(PageInfo::of)
    }

    /// Snapshots of every page, in list order.
    #[must_use]
    pub fn pages(&self) -> Vec<PageInfo> {
        self.pages.lock().pages().map(PageInfo::of).collect()
    }

    /// Number of pages, image pages included.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().page_count()
    }

    /// Words currently held by the free list of `kind`.
    #[must_use]
    pub fn free_words(&self, kind: PageKind) -> usize {
        self.free_list(kind).free_words()
    }

    // ------------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------------

    /// Run `f` over the page lists with every page walkable.
    fn with_iterable_pages<R>(&self, f: impl FnOnce(&PageLists) -> R) -> R {
        let (mut data, _code) = self.lock_quiescent();
        data.make_iterable();
        let lists = self.pages.lock();
        f(&*lists)
    }

    /// Visit every object and free chunk of every page.
    pub fn visit_objects(&self, visitor: &mut dyn ObjectVisitor) {
        self.with_iterable_pages(|lists| {
            for page in lists.pages() {
                page.visit_objects(visitor);
            }
        });
    }

    /// Visit every object and free chunk of the pages the space owns.
    pub fn visit_objects_no_image_pages(&self, visitor: &mut dyn ObjectVisitor) {
        self.with_iterable_pages(|lists| {
            for page in lists.pages().filter(|page| !page.is_image_page()) {
                page.visit_objects(visitor);
            }
        });
    }

    /// Visit every object of the image pages.
    pub fn visit_objects_image_pages(&self, visitor: &mut dyn ObjectVisitor) {
        self.with_iterable_pages(|lists| {
            for page in &lists.image {
                page.visit_objects(visitor);
            }
        });
    }

    /// Report every pointer slot of every object.
    pub fn visit_object_pointers(&self, visitor: &mut dyn PointerVisitor) {
        self.with_iterable_pages(|lists| {
            for page in lists.pages() {
                page.visit_object_pointers(&*self.tracer, visitor);
            }
        });
    }

    /// First object on a page of `kind` matching `predicate`.
    pub fn find_object(
        &self,
        kind: PageKind,
        mut predicate: impl FnMut(HeapObject) -> bool,
    ) -> Option<HeapObject> {
        self.with_iterable_pages(|lists| {
            lists
                .pages()
                .filter(|page| page.kind() == kind)
                .find_map(|page| page.find_object(&mut predicate))
        })
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    /// Cumulative statistics.
    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        let mut stats = *self.stats.lock();
        stats.high_water_capacity_in_words = self.high_water_capacity.load(Ordering::Relaxed);
        stats.high_water_used_in_words = self.high_water_used.load(Ordering::Relaxed);
        stats.mark_words_per_micro = self.mark_words_per_micro.load(Ordering::Relaxed);
        stats
    }

    /// Number of completed collections.
    #[must_use]
    pub fn collections(&self) -> usize {
        self.stats.lock().collections
    }

    /// Total time spent collecting, in microseconds.
    #[must_use]
    pub fn gc_time_micros(&self) -> i64 {
        self.stats.lock().gc_time_micros
    }
}

// ============================================================================
// DataLock
// ============================================================================

/// Exclusive use of the data free list and bump block; see
/// [`PageSpace::acquire_data_lock`].
///
/// Other data allocations block until the lock is dropped.
pub struct DataLock<'a> {
    space: &'a PageSpace,
    free_list: FreeListGuard<'a>,
}

impl DataLock<'_> {
    /// Like [`PageSpace::try_allocate`] for data, without retaking the lock.
    pub fn try_allocate(&mut self, size: usize, policy: GrowthPolicy) -> Option<NonNull<u8>> {
        let size = checked_object_size(size)?;
        if size >= ALLOCATABLE_PAGE_SIZE {
            return self.space.allocate_large_page(size, PageKind::Data, policy);
        }
        self.space
            .allocate_small(&mut self.free_list, size, PageKind::Data, policy)
    }

    /// Like [`PageSpace::try_allocate_data_bump`], without retaking the lock.
    pub fn try_allocate_bump(&mut self, size: usize, policy: GrowthPolicy) -> Option<NonNull<u8>> {
        self.space
            .allocate_data_bump(&mut self.free_list, checked_object_size(size)?, policy)
    }

    /// Allocation for promoted objects: an exact free-list fit first, so
    /// survivors fill holes, then the bump block.
    pub fn try_allocate_promo(&mut self, size: usize, policy: GrowthPolicy) -> Option<NonNull<u8>> {
        let size = checked_object_size(size)?;
        if size < ALLOCATABLE_PAGE_SIZE {
            self.space.assert_writable();
            if let Some(addr) = self.free_list.try_allocate(size, true) {
                return self.space.finish_allocation(addr, size);
            }
        }
        self.space
            .allocate_data_bump(&mut self.free_list, size, policy)
    }

    /// Bytes left in the bump block.
    #[must_use]
    pub fn bump_remaining(&self) -> usize {
        self.free_list.bump().remaining()
    }

    /// Give the bump remainder back to the free list.
    pub fn abandon_bump_allocation(&mut self) {
        self.free_list.abandon_bump();
    }
}

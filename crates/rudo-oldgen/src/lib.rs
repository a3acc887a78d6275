//! An old-generation page space for a tracing garbage collector.
//!
//! `rudo-oldgen` manages the pages that long-lived objects live on: it maps
//! and releases pages, serves allocations from a bump block, size-ordered
//! free lists or dedicated large pages, and reclaims memory by **Mark-Sweep**
//! or sliding **Mark-Compact**. A growth controller decides, after every
//! collection, how far the space may grow before the next one.
//!
//! # Features
//!
//! - **Three allocation paths**: bump allocation for fresh data, best-fit
//!   free lists for holes, dedicated pages for objects of 64 KiB or more
//! - **Growth control**: budgets derived from the survival rate and the
//!   share of time spent collecting, with an idle-time trigger
//! - **Background sweeping**: data pages can be swept on a worker thread
//!   while mutators keep allocating
//! - **Write protection**: executable pages stay read-execute between
//!   allocations; the whole space can be frozen
//! - **Image pages**: externally supplied object regions, traced as roots
//!
//! # Quick Start
//!
//! ```
//! use rudo_oldgen::{GrowthPolicy, HeapObject, ObjectTracer, PageKind, PageSpace, PageSpaceConfig, PointerVisitor};
//!
//! /// Every payload word is a pointer slot.
//! struct AllPointers;
//!
//! unsafe impl ObjectTracer for AllPointers {
//!     fn trace(&self, object: HeapObject, visitor: &mut dyn PointerVisitor) {
//!         for i in 0..object.payload_words() {
//!             visitor.visit_slot(object.slot(i));
//!         }
//!     }
//! }
//!
//! let space = PageSpace::new(PageSpaceConfig::default(), AllPointers);
//! let parent = space.allocate_forced(32, PageKind::Data);
//! let child = space.allocate_forced(32, PageKind::Data);
//! let _garbage = space.allocate_forced(32, PageKind::Data);
//!
//! // SAFETY: both objects were just allocated by the space.
//! let (parent, child) = unsafe {
//!     (
//!         HeapObject::from_addr(parent.as_ptr() as usize),
//!         HeapObject::from_addr(child.as_ptr() as usize),
//!     )
//! };
//! for i in 0..parent.payload_words() {
//!     parent.write_word(i, 0);
//!     child.write_word(i, 0);
//! }
//! parent.write_word(0, child.addr());
//!
//! let mut roots = vec![parent.addr()];
//! let stats = space.collect_garbage(true, &mut roots);
//! assert_eq!(stats.after.used_in_words, 2 * 32 / std::mem::size_of::<usize>());
//! ```
//!
//! # Thread Safety
//!
//! [`PageSpace`] is `Send + Sync` and shared through an `Arc`. Collections
//! must not run concurrently with mutators that read objects; allocation and
//! background sweeping may overlap.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod freelist;
pub mod history;
pub mod object;
pub mod page;
pub mod stats;
pub mod sync;
pub mod task;

/// Structured tracing for collections (with the `tracing` feature).
pub mod tracing;

mod compactor;
mod lists;
mod marker;
mod space;
mod sweeper;

pub use config::{GrowthPolicy, PageSpaceConfig};
pub use controller::{GrowthController, GrowthEvaluation};
pub use freelist::{BumpBlock, FreeList};
pub use history::CollectionHistory;
pub use object::{HeapObject, NoPointers, ObjectTracer, ObjectVisitor, PointerVisitor, RootSet, Slot};
pub use page::{Page, PageKind, ALLOCATABLE_PAGE_SIZE, PAGE_SIZE};
pub use space::{DataLock, PageInfo, PageSpace};
pub use stats::{CollectionKind, CollectionStats, SpaceStats, SpaceUsage};
pub use task::{InlineRunner, TaskRunner, WorkerPool};

//! Heap object headers and the tracing capability consumed by the space.
//!
//! The page space only needs to know three things about an object: its size,
//! whether it is marked, and whether it is a free chunk. Those live in a
//! single header word at the start of every object:
//!
//! ```text
//! +--------------------------------------------+------+------+
//! | size in bytes (multiple of OBJECT_ALIGNMENT) | free | mark |
//! +--------------------------------------------+------+------+
//! ```
//!
//! Everything after the header is payload owned by the object model, which
//! reports pointer slots through [`ObjectTracer`].

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// `log2(WORD_SIZE)`.
pub const WORD_SIZE_LOG2: u32 = WORD_SIZE.trailing_zeros();

/// Alignment of every object and free chunk.
pub const OBJECT_ALIGNMENT: usize = 2 * WORD_SIZE;

/// Smallest object (header plus one word).
pub const MIN_OBJECT_SIZE: usize = OBJECT_ALIGNMENT;

const MARK_BIT: usize = 1;
const FREE_BIT: usize = 1 << 1;
const TAG_MASK: usize = OBJECT_ALIGNMENT - 1;

/// Largest object size the space accepts. Larger requests fail rather than
/// overflow the page arithmetic.
pub const MAX_OBJECT_SIZE: usize = (usize::MAX >> 1) & !TAG_MASK;

/// Round `size` up to the object alignment, or `None` above [`MAX_OBJECT_SIZE`].
#[must_use]
pub const fn checked_object_size(size: usize) -> Option<usize> {
    if size > MAX_OBJECT_SIZE {
        None
    } else {
        Some(round_up_object_size(size))
    }
}

/// Round `size` up to the object alignment, with a floor of [`MIN_OBJECT_SIZE`].
///
/// `size` must not exceed [`MAX_OBJECT_SIZE`]; see [`checked_object_size`].
#[must_use]
pub const fn round_up_object_size(size: usize) -> usize {
    let size = (size + TAG_MASK) & !TAG_MASK;
    if size < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        size
    }
}

/// Convert a byte count to words, truncating.
#[must_use]
pub const fn bytes_to_words(bytes: usize) -> usize {
    bytes >> WORD_SIZE_LOG2
}

/// Convert a word count to bytes.
#[must_use]
pub const fn words_to_bytes(words: usize) -> usize {
    words << WORD_SIZE_LOG2
}

/// Returns `true` if `addr` is a plausible object start.
#[must_use]
pub const fn is_object_aligned(addr: usize) -> bool {
    addr != 0 && addr & TAG_MASK == 0
}

// ============================================================================
// HeapObject
// ============================================================================

/// Handle to an object (or free chunk) living in a page of the space.
///
/// A `HeapObject` is only meaningful while the page holding it is alive and
/// the object has not been moved by compaction. Creating one from a raw
/// address is `unsafe`; the space hands out valid handles.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapObject(NonNull<usize>);

// SAFETY: a handle is just an address; all access goes through the header
// protocol and the space's locking.
unsafe impl Send for HeapObject {}
unsafe impl Sync for HeapObject {}

impl std::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapObject({:#x})", self.addr())
    }
}

impl HeapObject {
    /// Wrap an existing object start.
    ///
    /// # Safety
    ///
    /// `addr` must be the start of a formatted object or free chunk inside a
    /// live page, and must stay so for as long as the handle is used.
    #[must_use]
    pub const unsafe fn from_addr(addr: usize) -> Self {
        // SAFETY: caller guarantees `addr` is a non-null object start.
        Self(unsafe { NonNull::new_unchecked(addr as *mut usize) })
    }

    /// Write a fresh, unmarked object header of `size` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size)` must be writable memory owned by the space.
    pub(crate) unsafe fn format(addr: usize, size: usize) -> Self {
        debug_assert!(is_object_aligned(addr));
        debug_assert_eq!(size & TAG_MASK, 0);
        debug_assert!(size >= MIN_OBJECT_SIZE);
        unsafe {
            let object = Self::from_addr(addr);
            object.set_header(size);
            object
        }
    }

    /// Write a free-chunk header of `size` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// Same as [`HeapObject::format`].
    pub(crate) unsafe fn format_free(addr: usize, size: usize) -> Self {
        debug_assert!(is_object_aligned(addr));
        debug_assert_eq!(size & TAG_MASK, 0);
        debug_assert!(size >= MIN_OBJECT_SIZE);
        unsafe {
            let object = Self::from_addr(addr);
            object.set_header(size | FREE_BIT);
            object
        }
    }

    /// Address of the header word.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Raw pointer to the header word.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    /// The header word, viewed atomically: a background sweeper clears mark
    /// bits while mutators read sizes.
    fn header_cell(self) -> &'static AtomicUsize {
        // SAFETY: the handle invariant keeps the header word valid and
        // aligned; every access to it goes through this view.
        unsafe { AtomicUsize::from_ptr(self.0.as_ptr()) }
    }

    /// Raw header word.
    #[must_use]
    pub fn header(self) -> usize {
        self.header_cell().load(Ordering::Relaxed)
    }

    fn set_header(self, value: usize) {
        // Writes to protected pages fault, which is a caller bug.
        self.header_cell().store(value, Ordering::Relaxed);
    }

    /// Total size including the header, in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        self.header() & !TAG_MASK
    }

    /// Returns `true` for free-list chunks.
    #[must_use]
    pub fn is_free(self) -> bool {
        self.header() & FREE_BIT != 0
    }

    /// Returns `true` if the mark bit is set.
    #[must_use]
    pub fn is_marked(self) -> bool {
        self.header() & MARK_BIT != 0
    }

    pub(crate) fn set_marked(self) {
        self.header_cell().fetch_or(MARK_BIT, Ordering::Relaxed);
    }

    pub(crate) fn clear_mark(self) {
        self.header_cell().fetch_and(!MARK_BIT, Ordering::Relaxed);
    }

    pub(crate) fn set_size(self, size: usize) {
        debug_assert_eq!(size & TAG_MASK, 0);
        self.set_header(size | (self.header() & TAG_MASK));
    }

    /// Number of payload words following the header.
    #[must_use]
    pub fn payload_words(self) -> usize {
        bytes_to_words(self.size()) - 1
    }

    fn word_ptr(self, index: usize) -> *mut usize {
        assert!(
            index < self.payload_words(),
            "payload word {index} out of bounds for {self:?} ({} words)",
            self.payload_words()
        );
        // SAFETY: bounds checked against the header size above.
        unsafe { self.0.as_ptr().add(1 + index) }
    }

    /// Read payload word `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is past the end of the payload.
    #[must_use]
    pub fn read_word(self, index: usize) -> usize {
        // SAFETY: `word_ptr` checks bounds.
        unsafe { self.word_ptr(index).read() }
    }

    /// Write payload word `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is past the end of the payload.
    pub fn write_word(self, index: usize, value: usize) {
        // SAFETY: `word_ptr` checks bounds.
        unsafe { self.word_ptr(index).write(value) }
    }

    /// Slot view of payload word `index`, for reporting to a [`PointerVisitor`].
    ///
    /// # Panics
    ///
    /// Panics if `index` is past the end of the payload.
    #[must_use]
    pub fn slot(&self, index: usize) -> Slot<'_> {
        // SAFETY: bounds checked, and the word stays valid while the handle does.
        unsafe { Slot::from_raw(self.word_ptr(index)) }
    }
}

// ============================================================================
// Slots and visitors
// ============================================================================

/// A word that may hold a reference into the space.
///
/// Compaction rewrites slots in place, so a slot is a mutable location rather
/// than a value.
pub struct Slot<'a> {
    ptr: NonNull<usize>,
    _marker: PhantomData<&'a mut usize>,
}

impl<'a> Slot<'a> {
    /// Slot backed by a Rust-owned word, e.g. a root.
    pub fn from_mut(word: &'a mut usize) -> Self {
        Self {
            ptr: NonNull::from(word),
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes for `'a`.
    pub const unsafe fn from_raw(ptr: *mut usize) -> Self {
        Self {
            // SAFETY: caller guarantees validity, hence non-null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            _marker: PhantomData,
        }
    }

    /// Current value of the slot.
    #[must_use]
    pub fn load(&self) -> usize {
        // SAFETY: validity is part of the constructor contracts.
        unsafe { self.ptr.as_ptr().read() }
    }

    /// Overwrite the slot.
    pub fn store(&self, value: usize) {
        // SAFETY: validity is part of the constructor contracts.
        unsafe { self.ptr.as_ptr().write(value) }
    }
}

/// Receives every pointer slot reported by a tracer or root set.
pub trait PointerVisitor {
    /// Visit one slot. The slot may hold `0` or a value outside the space.
    fn visit_slot(&mut self, slot: Slot<'_>);
}

impl<F: FnMut(Slot<'_>)> PointerVisitor for F {
    fn visit_slot(&mut self, slot: Slot<'_>) {
        self(slot);
    }
}

/// Receives objects during heap iteration.
pub trait ObjectVisitor {
    /// Visit one object or free chunk.
    fn visit_object(&mut self, object: HeapObject);
}

impl<F: FnMut(HeapObject)> ObjectVisitor for F {
    fn visit_object(&mut self, object: HeapObject) {
        self(object);
    }
}

/// The object model's "visit all pointers in this object" capability.
///
/// # Safety
///
/// Implementations **MUST** report every payload slot that may reference an
/// object in the space. A missed slot lets the collector free or move a live
/// object. Reported slots must lie inside the payload of `object`.
pub unsafe trait ObjectTracer: Send + Sync {
    /// Report the pointer slots of `object`.
    fn trace(&self, object: HeapObject, visitor: &mut dyn PointerVisitor);
}

/// Tracer for object models whose old-space objects never hold references.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPointers;

// SAFETY: objects of this model have no pointer slots.
unsafe impl ObjectTracer for NoPointers {
    fn trace(&self, _object: HeapObject, _visitor: &mut dyn PointerVisitor) {}
}

/// The mutator's roots.
pub trait RootSet {
    /// Report every root slot.
    fn visit_roots(&mut self, visitor: &mut dyn PointerVisitor);
}

impl RootSet for [usize] {
    fn visit_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        for root in self.iter_mut() {
            visitor.visit_slot(Slot::from_mut(root));
        }
    }
}

impl RootSet for Vec<usize> {
    fn visit_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        self.as_mut_slice().visit_roots(visitor);
    }
}

impl<const N: usize> RootSet for [usize; N] {
    fn visit_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        self.as_mut_slice().visit_roots(visitor);
    }
}

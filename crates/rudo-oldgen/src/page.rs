//! Pages: the unit of allocation, iteration, protection and reclamation.
//!
//! Every page the space allocates is aligned to [`PAGE_SIZE`], so the page
//! holding any object start is recovered by masking the address with
//! [`PAGE_MASK`]. Image pages are supplied from outside, are not aligned and
//! are never freed.

use std::collections::HashMap;
use std::marker::PhantomData;

use sys_alloc::{Mmap, MmapOptions, Protection};

use crate::object::{
    is_object_aligned, words_to_bytes, HeapObject, ObjectTracer, ObjectVisitor, PointerVisitor,
    OBJECT_ALIGNMENT, WORD_SIZE,
};

// ============================================================================
// Constants
// ============================================================================

/// Size of a regular page.
pub const PAGE_SIZE: usize = 256 * 1024;

/// [`PAGE_SIZE`] in words.
pub const PAGE_SIZE_IN_WORDS: usize = PAGE_SIZE / WORD_SIZE;

/// Mask recovering a page base from an object start.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Requests of at least this many bytes get a dedicated large page.
pub const ALLOCATABLE_PAGE_SIZE: usize = 64 * 1024;

/// Base address of the page holding the object starting at `addr`.
///
/// Not valid for objects on image pages.
#[must_use]
pub const fn page_base_of(addr: usize) -> usize {
    addr & PAGE_MASK
}

/// Size in words of the large page needed for an object of `size` bytes.
#[must_use]
pub fn large_page_size_in_words(size: usize) -> usize {
    let os_page = sys_alloc::page_size();
    size.div_ceil(os_page) * os_page / WORD_SIZE
}

// ============================================================================
// PageKind
// ============================================================================

/// Category of a page; each has its own page list and free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Ordinary objects.
    Data = 0,
    /// Installed machine code.
    Executable = 1,
}

impl PageKind {
    /// Number of page kinds.
    pub const COUNT: usize = 2;

    /// Index into per-kind arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

// ============================================================================
// ForwardingPage
// ============================================================================

/// Relocation targets of the objects of one page during compaction.
///
/// Maps the offset of an object within its page to its new address.
#[derive(Debug, Default)]
pub struct ForwardingPage {
    targets: HashMap<usize, usize>,
}

impl ForwardingPage {
    /// Record that the object at `offset` moves to `new_addr`.
    pub fn insert(&mut self, offset: usize, new_addr: usize) {
        self.targets.insert(offset, new_addr);
    }

    /// New address of the object at `offset`, if it moves.
    #[must_use]
    pub fn lookup(&self, offset: usize) -> Option<usize> {
        self.targets.get(&offset).copied()
    }

    /// Number of recorded relocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns `true` if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

// ============================================================================
// Page
// ============================================================================

enum Memory {
    Owned(Mmap),
    Image { start: usize, len: usize },
}

/// A contiguous memory region holding a run of heap objects.
pub struct Page {
    memory: Memory,
    kind: PageKind,
    is_large: bool,
    object_end: usize,
    used_in_bytes: usize,
    forwarding: Option<Box<ForwardingPage>>,
    write_protected: bool,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.memory_len())
            .field("kind", &self.kind)
            .field("is_large", &self.is_large)
            .field("is_image", &self.is_image_page())
            .field("used_in_bytes", &self.used_in_bytes)
            .finish_non_exhaustive()
    }
}

impl Page {
    /// Reserve a new page of at least `size_in_words` words.
    ///
    /// Returns `None` when the OS refuses the mapping.
    #[must_use]
    pub fn allocate(size_in_words: usize, kind: PageKind) -> Option<Self> {
        let os_page = sys_alloc::page_size();
        let len = words_to_bytes(size_in_words).max(os_page).div_ceil(os_page) * os_page;
        // SAFETY: the mapping is owned by the returned page.
        let mmap = unsafe { MmapOptions::new().len(len).align(PAGE_SIZE).map_anon() }.ok()?;
        debug_assert_eq!(mmap.ptr() as usize & !PAGE_MASK, 0);

        let object_end = mmap.end();
        Some(Self {
            memory: Memory::Owned(mmap),
            kind,
            is_large: false,
            object_end,
            used_in_bytes: 0,
            forwarding: None,
            write_protected: false,
        })
    }

    /// Reserve a dedicated page for one object of `size_in_words` words.
    #[must_use]
    pub fn allocate_large(size_in_words: usize, kind: PageKind) -> Option<Self> {
        let mut page = Self::allocate(size_in_words, kind)?;
        page.is_large = true;
        Some(page)
    }

    /// Wrap an externally supplied region.
    ///
    /// # Safety
    ///
    /// `[start, start + len)` must hold walkable objects and stay valid and
    /// unchanged for the life of the page.
    pub unsafe fn image(start: usize, len: usize, kind: PageKind) -> Self {
        assert!(
            is_object_aligned(start),
            "image page {start:#x} is not object aligned"
        );
        Self {
            memory: Memory::Image { start, len },
            kind,
            is_large: false,
            object_end: start + len,
            used_in_bytes: len,
            forwarding: None,
            write_protected: true,
        }
    }

    /// Start of the page's memory.
    #[must_use]
    pub fn base(&self) -> usize {
        match &self.memory {
            Memory::Owned(mmap) => mmap.ptr() as usize,
            Memory::Image { start, .. } => *start,
        }
    }

    /// Length of the page's memory.
    #[must_use]
    pub fn memory_len(&self) -> usize {
        match &self.memory {
            Memory::Owned(mmap) => mmap.len(),
            Memory::Image { len, .. } => *len,
        }
    }

    /// Memory length in words; what the page contributes to capacity.
    #[must_use]
    pub fn size_in_words(&self) -> usize {
        self.memory_len() / WORD_SIZE
    }

    /// First address past the page's memory.
    #[must_use]
    pub fn end(&self) -> usize {
        self.base() + self.memory_len()
    }

    /// Returns `true` if `addr` lies inside the page's memory.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.end()
    }

    /// Address of the first object.
    #[must_use]
    pub fn object_start(&self) -> usize {
        self.base()
    }

    /// End of the object area.
    #[must_use]
    pub const fn object_end(&self) -> usize {
        self.object_end
    }

    pub(crate) fn set_object_end(&mut self, value: usize) {
        debug_assert_eq!(value % OBJECT_ALIGNMENT, 0);
        debug_assert!(value <= self.end());
        self.object_end = value;
    }

    /// Bytes of live objects found by the last sweep.
    #[must_use]
    pub const fn used_in_bytes(&self) -> usize {
        self.used_in_bytes
    }

    pub(crate) fn set_used_in_bytes(&mut self, value: usize) {
        debug_assert_eq!(value % OBJECT_ALIGNMENT, 0);
        self.used_in_bytes = value;
    }

    /// Page category.
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        self.kind
    }

    /// Returns `true` for single-object pages.
    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.is_large
    }

    /// Returns `true` for externally supplied pages.
    #[must_use]
    pub const fn is_image_page(&self) -> bool {
        matches!(self.memory, Memory::Image { .. })
    }

    /// Returns `true` while the page is write protected.
    #[must_use]
    pub const fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    /// Iterate every object and free chunk on the page.
    ///
    /// # Panics
    ///
    /// The iterator panics on a header that cannot be walked, which means the
    /// page is not iterable (e.g. an unformatted bump remainder).
    #[must_use]
    pub fn objects(&self) -> Objects<'_> {
        // SAFETY: the object area stays valid while `self` is borrowed.
        unsafe { Objects::over(self.object_start(), self.object_end()) }
    }

    /// Visit every object and free chunk.
    pub fn visit_objects(&self, visitor: &mut dyn ObjectVisitor) {
        for object in self.objects() {
            visitor.visit_object(object);
        }
    }

    /// Report the pointer slots of every object (free chunks skipped).
    pub fn visit_object_pointers(&self, tracer: &dyn ObjectTracer, visitor: &mut dyn PointerVisitor) {
        for object in self.objects().filter(|object| !object.is_free()) {
            tracer.trace(object, visitor);
        }
    }

    /// First object (free chunks skipped) matching `predicate`.
    pub fn find_object(&self, mut predicate: impl FnMut(HeapObject) -> bool) -> Option<HeapObject> {
        self.objects()
            .filter(|object| !object.is_free())
            .find(|object| predicate(*object))
    }

    /// Toggle write protection.
    ///
    /// Executable pages become read-execute when protected, data pages
    /// read-only. Unprotected pages are read-write.
    ///
    /// # Panics
    ///
    /// Panics for image pages and when the OS refuses the change.
    pub fn write_protect(&mut self, read_only: bool) {
        let Memory::Owned(mmap) = &self.memory else {
            panic!("image page {:#x} cannot be re-protected", self.base());
        };
        let protection = match (read_only, self.kind) {
            (false, _) => Protection::ReadWrite,
            (true, PageKind::Data) => Protection::ReadOnly,
            (true, PageKind::Executable) => Protection::ReadExecute,
        };
        if let Err(err) = mmap.protect(protection) {
            panic!("failed to protect page {:#x}: {err}", self.base());
        }
        self.write_protected = read_only;
    }

    /// Relocation table, present only during compaction.
    #[must_use]
    pub fn forwarding_page(&self) -> Option<&ForwardingPage> {
        self.forwarding.as_deref()
    }

    /// Attach an empty relocation table.
    pub fn allocate_forwarding_page(&mut self) -> &mut ForwardingPage {
        self.forwarding.insert(Box::default())
    }

    /// Drop the relocation table.
    pub fn free_forwarding_page(&mut self) {
        self.forwarding = None;
    }

    /// Shrink a large page to fit an object of `new_object_size` bytes.
    ///
    /// Returns the number of bytes given back to the OS.
    ///
    /// # Panics
    ///
    /// Panics for pages that are not large pages.
    pub(crate) fn truncate(&mut self, new_object_size: usize) -> usize {
        assert!(self.is_large, "only large pages can be truncated");
        let object_start = self.object_start();
        let Memory::Owned(mmap) = &mut self.memory else {
            unreachable!("large pages are never image pages");
        };
        let old_len = mmap.len();
        if let Err(err) = mmap.truncate(new_object_size) {
            panic!("failed to truncate page {object_start:#x}: {err}");
        }
        let released = old_len - mmap.len();
        self.object_end = object_start + new_object_size;
        released
    }
}

/// Iterator over the objects of a page; see [`Page::objects`].
pub struct Objects<'a> {
    cursor: usize,
    end: usize,
    _page: PhantomData<&'a Page>,
}

impl Objects<'_> {
    /// Walk `[start, end)` without borrowing the page holding it.
    ///
    /// # Safety
    ///
    /// The range must be the object area of a live page and stay so while
    /// the iterator is used.
    pub(crate) const unsafe fn over(start: usize, end: usize) -> Self {
        Self {
            cursor: start,
            end,
            _page: PhantomData,
        }
    }
}

impl Iterator for Objects<'_> {
    type Item = HeapObject;

    fn next(&mut self) -> Option<HeapObject> {
        if self.cursor >= self.end {
            return None;
        }
        // SAFETY: the cursor is inside the object area, on an object boundary.
        let object = unsafe { HeapObject::from_addr(self.cursor) };
        let size = object.size();
        assert!(
            size != 0 && self.cursor + size <= self.end,
            "page {:#x} is not iterable: bad header {:#x} at {:#x}",
            page_base_of(self.cursor),
            object.header(),
            self.cursor
        );
        self.cursor += size;
        Some(object)
    }
}

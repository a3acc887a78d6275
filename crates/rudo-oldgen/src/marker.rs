//! Transitive marking.
//!
//! Slots are followed when they hold an object-aligned address inside a page
//! the space owns. Objects on image pages are never marked; they are traced
//! as roots instead, which keeps everything they reference alive.

use crate::lists::PageLists;
use crate::object::{
    bytes_to_words, is_object_aligned, HeapObject, ObjectTracer, RootSet, Slot,
};

pub(crate) struct Marker<'a> {
    lists: &'a PageLists,
    tracer: &'a dyn ObjectTracer,
    worklist: Vec<HeapObject>,
    marked_words: usize,
    marked_objects: usize,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(lists: &'a PageLists, tracer: &'a dyn ObjectTracer) -> Self {
        Self {
            lists,
            tracer,
            worklist: Vec::new(),
            marked_words: 0,
            marked_objects: 0,
        }
    }

    fn mark_value(&mut self, value: usize) {
        if !is_object_aligned(value) || !self.lists.contains_owned(value) {
            return;
        }
        // SAFETY: slots referencing the space hold object starts.
        let object = unsafe { HeapObject::from_addr(value) };
        if object.is_free() || object.is_marked() {
            return;
        }
        object.set_marked();
        self.marked_words += bytes_to_words(object.size());
        self.marked_objects += 1;
        self.worklist.push(object);
    }

    pub(crate) fn mark_roots(&mut self, roots: &mut dyn RootSet) {
        roots.visit_roots(&mut |slot: Slot<'_>| self.mark_value(slot.load()));
    }

    /// Trace every object on image pages.
    pub(crate) fn mark_image_pages(&mut self) {
        let lists = self.lists;
        let tracer = self.tracer;
        for page in &lists.image {
            page.visit_object_pointers(tracer, &mut |slot: Slot<'_>| self.mark_value(slot.load()));
        }
    }

    /// Trace until nothing new is reachable.
    pub(crate) fn drain(&mut self) {
        let tracer = self.tracer;
        while let Some(object) = self.worklist.pop() {
            tracer.trace(object, &mut |slot: Slot<'_>| self.mark_value(slot.load()));
        }
    }

    pub(crate) const fn marked_words(&self) -> usize {
        self.marked_words
    }

    pub(crate) const fn marked_objects(&self) -> usize {
        self.marked_objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::ListKind;
    use crate::object::{PointerVisitor, WORD_SIZE};
    use crate::page::{Page, PageKind, PAGE_SIZE, PAGE_SIZE_IN_WORDS};

    /// Word 0 of the payload is a pointer slot.
    struct FirstWord;

    unsafe impl ObjectTracer for FirstWord {
        fn trace(&self, object: HeapObject, visitor: &mut dyn PointerVisitor) {
            visitor.visit_slot(object.slot(0));
        }
    }

    #[test]
    fn test_marks_transitively_from_roots() {
        let page = Page::allocate(PAGE_SIZE_IN_WORDS, PageKind::Data).expect("page");
        let base = page.object_start();
        let size = 4 * WORD_SIZE;
        let (a, b, c) = unsafe {
            (
                HeapObject::format(base, size),
                HeapObject::format(base + size, size),
                HeapObject::format(base + 2 * size, size),
            )
        };
        unsafe { HeapObject::format_free(base + 3 * size, PAGE_SIZE - 3 * size) };
        a.write_word(0, b.addr());
        b.write_word(0, a.addr());
        c.write_word(0, 0);

        let mut lists = PageLists::new();
        lists.add(page, ListKind::Data);

        let mut roots = vec![a.addr(), 0x10, usize::MAX & !0xf];
        let mut marker = Marker::new(&lists, &FirstWord);
        marker.mark_roots(&mut roots);
        marker.drain();

        assert!(a.is_marked());
        assert!(b.is_marked());
        assert!(!c.is_marked());
        assert_eq!(marker.marked_objects(), 2);
        assert_eq!(marker.marked_words(), 2 * bytes_to_words(size));
    }
}

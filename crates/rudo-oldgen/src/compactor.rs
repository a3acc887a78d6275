//! Sliding mark-compact for regular pages.
//!
//! Survivors of each regular list are slid towards the start of the list,
//! keeping their order. Compaction runs in three passes over marked objects:
//!
//! 1. **Plan**: assign every survivor its new address and record it in the
//!    forwarding page of the page it currently lives on.
//! 2. **Update**: rewrite every slot that references a moving object: roots,
//!    survivors of all lists (large pages included) and image page objects.
//! 3. **Move**: copy survivors to their new addresses in address order,
//!    clearing their marks. Page tails become free chunks; pages left
//!    without survivors are released.
//!
//! Large pages never move. Forwarding pages are dropped at the end.

use std::collections::HashMap;

use crate::freelist::FreeListGuard;
use crate::lists::{ListKind, PageLists};
use crate::object::{is_object_aligned, HeapObject, ObjectTracer, RootSet, Slot};
use crate::page::{page_base_of, Page, PageKind};

/// Counters of one compaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompactionResult {
    pub(crate) objects_moved: usize,
    pub(crate) pages_released: usize,
}

/// Compact both regular lists.
///
/// Every survivor must be marked; marks of regular pages are cleared,
/// marks on large pages are left for the large page sweep.
pub(crate) fn compact(
    lists: &mut PageLists,
    data: &mut FreeListGuard<'_>,
    code: &mut FreeListGuard<'_>,
    tracer: &dyn ObjectTracer,
    roots: &mut dyn RootSet,
) -> CompactionResult {
    let data_tops = plan(&mut lists.data);
    let code_tops = plan(&mut lists.executable);

    update_pointers(lists, tracer, roots);

    let mut result = CompactionResult::default();
    result.objects_moved += move_objects(&lists.data);
    result.objects_moved += move_objects(&lists.executable);

    result.pages_released += finish_list(lists, PageKind::Data, &data_tops, data);
    result.pages_released += finish_list(lists, PageKind::Executable, &code_tops, code);
    result
}

/// Assign new addresses. Returns, per page, the end of the survivors slid
/// onto it, or `None` if it receives none.
fn plan(pages: &mut [Page]) -> Vec<Option<usize>> {
    let mut tops = vec![None; pages.len()];
    let Some(first) = pages.first() else {
        return tops;
    };
    let mut destination = 0;
    let mut top = first.object_start();

    for source in 0..pages.len() {
        let base = pages[source].base();
        let mut moves = Vec::new();
        for object in pages[source].objects() {
            if object.is_free() || !object.is_marked() {
                continue;
            }
            let size = object.size();
            if top + size > pages[destination].object_end() {
                destination += 1;
                top = pages[destination].object_start();
            }
            debug_assert!(destination <= source);
            moves.push((object.addr() - base, top));
            top += size;
            tops[destination] = Some(top);
        }
        let forwarding = pages[source].allocate_forwarding_page();
        for (offset, new_addr) in moves {
            forwarding.insert(offset, new_addr);
        }
    }
    tops
}

/// New address of the object at `value`, if it moves.
fn forward(lists: &PageLists, bases: &HashMap<usize, ListKind>, value: usize) -> Option<usize> {
    if !is_object_aligned(value) {
        return None;
    }
    let base = page_base_of(value);
    let list = *bases.get(&base)?;
    let page = lists.list(list).iter().find(|page| page.base() == base)?;
    page.forwarding_page()?.lookup(value - base)
}

fn update_pointers(lists: &PageLists, tracer: &dyn ObjectTracer, roots: &mut dyn RootSet) {
    let bases: HashMap<usize, ListKind> = lists
        .data
        .iter()
        .map(|page| (page.base(), ListKind::Data))
        .chain(
            lists
                .executable
                .iter()
                .map(|page| (page.base(), ListKind::Executable)),
        )
        .collect();
    let mut visitor = |slot: Slot<'_>| {
        if let Some(new_addr) = forward(lists, &bases, slot.load()) {
            slot.store(new_addr);
        }
    };

    roots.visit_roots(&mut visitor);
    for page in lists.data.iter().chain(&lists.executable).chain(&lists.large) {
        for object in page.objects() {
            if !object.is_free() && object.is_marked() {
                tracer.trace(object, &mut visitor);
            }
        }
    }
    for page in &lists.image {
        page.visit_object_pointers(tracer, &mut visitor);
    }
}

fn move_objects(pages: &[Page]) -> usize {
    let mut moved = 0;
    for page in pages {
        let Some(forwarding) = page.forwarding_page() else {
            continue;
        };
        let base = page.base();
        // Collected before copying: copies overwrite headers behind the cursor.
        let survivors: Vec<(usize, usize)> = page
            .objects()
            .filter(|object| !object.is_free() && object.is_marked())
            .map(|object| (object.addr(), object.size()))
            .collect();
        for (addr, size) in survivors {
            let Some(new_addr) = forwarding.lookup(addr - base) else {
                continue;
            };
            // SAFETY: `addr` is a survivor recorded during planning.
            unsafe { HeapObject::from_addr(addr) }.clear_mark();
            if new_addr != addr {
                debug_assert!(new_addr < addr || page_base_of(new_addr) != base);
                // SAFETY: both ranges lie in pages of this list and the
                // destination never overlaps a survivor not yet moved.
                unsafe {
                    std::ptr::copy(addr as *const u8, new_addr as *mut u8, size);
                }
                moved += 1;
            }
        }
    }
    moved
}

/// Free page tails, release emptied pages and drop forwarding pages.
fn finish_list(
    lists: &mut PageLists,
    kind: PageKind,
    tops: &[Option<usize>],
    free_list: &mut FreeListGuard<'_>,
) -> usize {
    let list = ListKind::regular(kind);
    let mut released = 0;
    for (position, top) in tops.iter().enumerate().rev() {
        let Some(top) = *top else {
            lists.release(list, position);
            released += 1;
            continue;
        };
        let page = &mut lists.list_mut(list)[position];
        page.free_forwarding_page();
        page.set_used_in_bytes(top - page.object_start());
        if top < page.object_end() {
            free_list.free(top, page.object_end() - top);
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freelist::FreeList;
    use crate::object::{PointerVisitor, WORD_SIZE};
    use crate::page::{PAGE_SIZE, PAGE_SIZE_IN_WORDS};

    struct FirstWord;

    unsafe impl ObjectTracer for FirstWord {
        fn trace(&self, object: HeapObject, visitor: &mut dyn PointerVisitor) {
            visitor.visit_slot(object.slot(0));
        }
    }

    fn formatted_page(objects: usize, size: usize) -> Page {
        let page = Page::allocate(PAGE_SIZE_IN_WORDS, PageKind::Data).expect("page");
        let base = page.object_start();
        for i in 0..objects {
            let object = unsafe { HeapObject::format(base + i * size, size) };
            object.write_word(0, 0);
        }
        unsafe { HeapObject::format_free(base + objects * size, PAGE_SIZE - objects * size) };
        page
    }

    #[test]
    fn test_survivors_slide_to_the_front() {
        let size = 4 * WORD_SIZE;
        let mut lists = PageLists::new();
        lists.add(formatted_page(4, size), ListKind::Data);
        lists.add(formatted_page(4, size), ListKind::Data);
        let first = lists.data[0].object_start();
        let second = lists.data[1].object_start();

        // Survivors: object 3 of the first page, object 1 of the second.
        let a = unsafe { HeapObject::from_addr(first + 3 * size) };
        let b = unsafe { HeapObject::from_addr(second + size) };
        a.write_word(0, b.addr());
        a.write_word(1, 0xaaaa);
        b.write_word(1, 0xbbbb);
        a.set_marked();
        b.set_marked();

        let data_list = FreeList::new();
        let code_list = FreeList::new();
        let mut data = data_list.lock();
        let mut code = code_list.lock();
        let mut roots = vec![a.addr()];
        let result = compact(&mut lists, &mut data, &mut code, &FirstWord, &mut roots);

        assert_eq!(result.objects_moved, 2);
        assert_eq!(result.pages_released, 1);
        assert_eq!(lists.data.len(), 1);
        assert_eq!(roots, vec![first]);

        let a = unsafe { HeapObject::from_addr(first) };
        let b = unsafe { HeapObject::from_addr(first + size) };
        assert!(!a.is_marked());
        assert!(!b.is_marked());
        assert_eq!(a.read_word(0), b.addr());
        assert_eq!(a.read_word(1), 0xaaaa);
        assert_eq!(b.read_word(1), 0xbbbb);

        assert_eq!(lists.data[0].used_in_bytes(), 2 * size);
        assert!(lists.data[0].forwarding_page().is_none());
        assert!(data.contains_chunk(first + 2 * size));
        assert_eq!(lists.data[0].objects().count(), 3);
    }
}

//! Sweeping: reclaiming unmarked objects in place.
//!
//! A page is swept by walking its object area, clearing the mark bit of
//! every survivor and merging each run of dead objects and free chunks into
//! one free chunk. Pages without survivors are released to the OS.

use crate::freelist::FreeListGuard;
use crate::lists::{ListKind, PageLists};
use crate::page::{Objects, PageKind};

/// Result of sweeping one object area.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SweptRegion {
    pub(crate) live_bytes: usize,
    pub(crate) free_chunks: Vec<(usize, usize)>,
}

/// Sweep `[start, end)`.
///
/// # Safety
///
/// The range must be the object area of a live, writable, iterable page
/// that no other thread walks or allocates in meanwhile.
pub(crate) unsafe fn sweep_region(start: usize, end: usize) -> SweptRegion {
    let mut swept = SweptRegion::default();
    let mut run: Option<(usize, usize)> = None;
    // SAFETY: forwarded from the caller.
    for object in unsafe { Objects::over(start, end) } {
        if !object.is_free() && object.is_marked() {
            object.clear_mark();
            swept.live_bytes += object.size();
            if let Some(chunk) = run.take() {
                swept.free_chunks.push(chunk);
            }
            continue;
        }
        match &mut run {
            Some((_, size)) => *size += object.size(),
            None => run = Some((object.addr(), object.size())),
        }
    }
    if let Some(chunk) = run {
        swept.free_chunks.push(chunk);
    }
    swept
}

/// Sweep every regular page of `kind`, rebuilding `free_list`.
///
/// Returns the number of pages released.
pub(crate) fn sweep_pages(
    lists: &mut PageLists,
    kind: PageKind,
    free_list: &mut FreeListGuard<'_>,
) -> usize {
    let list = ListKind::regular(kind);
    let mut released = 0;
    let mut position = 0;
    while position < lists.list(list).len() {
        let page = &mut lists.list_mut(list)[position];
        // SAFETY: the caller holds the pages lock and the free list of
        // `kind`, and collections unprotect pages before sweeping.
        let swept = unsafe { sweep_region(page.object_start(), page.object_end()) };
        if swept.live_bytes == 0 {
            lists.release(list, position);
            released += 1;
            continue;
        }
        page.set_used_in_bytes(swept.live_bytes);
        for (addr, size) in swept.free_chunks {
            free_list.free(addr, size);
        }
        position += 1;
    }
    released
}

/// Release every large page whose object is unmarked; clear the mark of the
/// others.
///
/// Returns the number of pages released.
pub(crate) fn sweep_large_pages(lists: &mut PageLists) -> usize {
    let mut released = 0;
    let mut position = 0;
    while position < lists.large.len() {
        let page = &mut lists.large[position];
        let live = page.find_object(|object| object.is_marked());
        if let Some(object) = live {
            object.clear_mark();
            page.set_used_in_bytes(object.size());
            position += 1;
        } else {
            lists.release(ListKind::Large, position);
            released += 1;
        }
    }
    released
}

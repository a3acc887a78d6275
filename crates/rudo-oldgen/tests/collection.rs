//! Mark-sweep and mark-compact collections.

mod common;

use std::ptr::NonNull;

use common::{alloc, inline_space, object_at, object_size, Counted};
use rudo_oldgen::object::WORD_SIZE;
use rudo_oldgen::{
    CollectionKind, GrowthPolicy, HeapObject, PageKind, PageSpace, PageSpaceConfig,
    ALLOCATABLE_PAGE_SIZE, PAGE_SIZE,
};

fn blocking_config() -> PageSpaceConfig {
    PageSpaceConfig::default().with_concurrent_sweep(false)
}

#[test]
fn test_mark_sweep_keeps_reachable_cycle() {
    let space = inline_space(blocking_config());
    let a = alloc(&space, &[0], 2, 100);
    let b = alloc(&space, &[a.addr()], 2, 200);
    a.write_word(1, b.addr());
    let c = alloc(&space, &[0], 2, 300);
    let d = alloc(&space, &[c.addr()], 2, 400);
    c.write_word(1, d.addr());
    space.allocate_forced(ALLOCATABLE_PAGE_SIZE, PageKind::Data);
    space.allocate_forced(64, PageKind::Executable);
    assert_eq!(space.page_count(), 3);

    let mut roots = vec![a.addr()];
    let stats = space.collect_garbage(false, &mut roots);

    let live_words = 2 * object_size(1, 2) / WORD_SIZE;
    assert_eq!(stats.kind, CollectionKind::MarkSweep);
    assert_eq!(stats.marked_words, live_words);
    assert_eq!(stats.marked_objects, 2);
    assert_eq!(stats.objects_moved, 0);
    assert_eq!(stats.after.used_in_words, live_words);
    assert_eq!(space.used_in_words(), live_words);
    assert_eq!(stats.pages_freed, 2);
    assert_eq!(space.page_count(), 1);

    assert_eq!(roots, vec![a.addr()]);
    assert!(!a.is_marked());
    assert!(!b.is_marked());
    assert_eq!(a.read_word(1), b.addr());
    assert_eq!(b.read_word(1), a.addr());
    assert_eq!(a.read_word(2), 100);
    assert_eq!(b.read_word(3), 201);
    assert!(object_at(c.addr()).is_free());
    assert!(space.free_words(PageKind::Data) > 0);
}

#[test]
fn test_mark_sweep_reuses_holes() {
    let space = inline_space(blocking_config());
    let live = alloc(&space, &[], 6, 0);
    let dead = alloc(&space, &[], 6, 0);
    let fence = alloc(&space, &[], 6, 0);

    let mut roots = vec![live.addr(), fence.addr()];
    space.collect_garbage(false, &mut roots);

    let reused = space
        .try_allocate(object_size(0, 6), PageKind::Data, GrowthPolicy::ControlGrowth)
        .expect("allocation");
    assert_eq!(reused.as_ptr() as usize, dead.addr());
}

#[test]
fn test_compaction_slides_survivors_and_rewrites_slots() {
    let space = inline_space(blocking_config());
    let first = alloc(&space, &[], 4, 0);
    let a = alloc(&space, &[0], 4, 10);
    let _garbage = alloc(&space, &[], 4, 0);
    let b = alloc(&space, &[], 4, 20);
    a.write_word(1, b.addr());
    let base = first.addr();

    let mut roots = vec![a.addr(), 0, 12345];
    let stats = space.collect_garbage(true, &mut roots);
    assert_eq!(stats.kind, CollectionKind::MarkCompact);
    assert_eq!(stats.marked_objects, 2);
    assert_eq!(stats.objects_moved, 2);

    let a_size = object_size(1, 4);
    assert_eq!(roots, vec![base, 0, 12345]);
    let a = object_at(base);
    let b = object_at(base + a_size);
    assert_eq!(a.read_word(1), b.addr());
    assert_eq!(a.read_word(2), 10);
    assert_eq!(b.read_word(1), 20);
    assert!(!a.is_marked());
    assert!(!b.is_marked());

    let words = (a_size + object_size(0, 4)) / WORD_SIZE;
    assert_eq!(space.used_in_words(), words);
    let info = space.page_containing(base).expect("page");
    assert_eq!(info.used_in_bytes, words * WORD_SIZE);

    // The tail is one free chunk serving the next allocation.
    let next = alloc(&space, &[], 1, 0);
    assert_eq!(next.addr(), b.addr() + object_size(0, 4));
}

#[test]
fn test_compaction_releases_emptied_pages() {
    let space = inline_space(blocking_config());
    let size = object_size(0, 126);
    let per_page = PAGE_SIZE / size;
    let objects: Vec<HeapObject> = (0..per_page + per_page / 2)
        .map(|i| alloc(&space, &[], 126, i))
        .collect();
    assert_eq!(space.page_count(), 2);
    let base = PageSpace::page_of(objects[0].addr());
    let survivor = objects[objects.len() - 1];
    assert_ne!(PageSpace::page_of(survivor.addr()), base);

    let mut roots = vec![survivor.addr()];
    let stats = space.collect_garbage(true, &mut roots);

    assert_eq!(roots, vec![base]);
    assert_eq!(object_at(base).read_word(1), objects.len() - 1);
    assert_eq!(stats.pages_freed, 1);
    assert_eq!(space.page_count(), 1);
    assert_eq!(space.used_in_words(), size / WORD_SIZE);
}

#[test]
fn test_large_objects_survive_and_pin_their_referents() {
    let space = inline_space(blocking_config());
    let _garbage = alloc(&space, &[], 2, 0);
    let small = alloc(&space, &[], 2, 7);
    let large = space.allocate_forced(ALLOCATABLE_PAGE_SIZE, PageKind::Data);
    let large = object_at(large.as_ptr() as usize);
    large.write_word(0, 1);
    large.write_word(1, small.addr());
    let unreachable = space.allocate_forced(2 * ALLOCATABLE_PAGE_SIZE, PageKind::Data);
    let unreachable = unreachable.as_ptr() as usize;

    let mut roots = vec![large.addr()];
    space.collect_garbage(true, &mut roots);

    assert_eq!(roots, vec![large.addr()]);
    assert!(!large.is_marked());
    let moved = large.read_word(1);
    assert_eq!(moved, PageSpace::page_of(small.addr()));
    assert_eq!(object_at(moved).read_word(1), 7);
    assert!(!space.contains(unreachable));

    let mut roots: Vec<usize> = Vec::new();
    space.collect_garbage(false, &mut roots);
    assert_eq!(space.page_count(), 0);
    assert_eq!(space.capacity_in_words(), 0);
}

#[repr(C, align(16))]
struct Image([usize; 8]);

/// Two image objects: the first references `target`.
fn leak_image(target: usize) -> (NonNull<u8>, usize) {
    let size = 4 * WORD_SIZE;
    let image = Box::leak(Box::new(Image([
        size, 1, target, 0, //
        size, 0, 0, 0,
    ])));
    let start = NonNull::from(&mut image.0).cast::<u8>();
    (start, std::mem::size_of::<Image>())
}

#[test]
fn test_image_objects_are_roots() {
    let space = inline_space(blocking_config());
    let _garbage = alloc(&space, &[], 2, 0);
    let target = alloc(&space, &[], 2, 42);
    let base = PageSpace::page_of(target.addr());
    let capacity = space.capacity_in_words();

    let (start, len) = leak_image(target.addr());
    // SAFETY: the image is leaked, formatted and writable.
    unsafe { space.setup_image_page(start, len, false) };
    let image_addr = start.as_ptr() as usize;
    assert!(space.contains(image_addr));
    assert_eq!(space.capacity_in_words(), capacity);
    assert!(space.page_containing(image_addr).expect("page").is_image);

    let mut roots: Vec<usize> = Vec::new();
    space.collect_garbage(true, &mut roots);

    let image = object_at(image_addr);
    assert!(!image.is_marked());
    assert_eq!(image.read_word(1), base);
    assert_eq!(object_at(base).read_word(1), 42);
    assert_eq!(space.used_in_words(), object_size(0, 2) / WORD_SIZE);

    let mut count = 0;
    space.visit_objects_image_pages(&mut |_object: HeapObject| count += 1);
    assert_eq!(count, 2);
    let mut owned = 0;
    space.visit_objects_no_image_pages(&mut |object: HeapObject| {
        if !object.is_free() {
            owned += 1;
        }
    });
    assert_eq!(owned, 1);
}

#[test]
fn test_background_sweep_releases_pages() {
    let space = PageSpace::new(PageSpaceConfig::default(), Counted);
    let size = object_size(0, 126);
    let per_page = PAGE_SIZE / size;
    let objects: Vec<HeapObject> = (0..3 * per_page)
        .map(|i| alloc(&space, &[], 126, i))
        .collect();
    assert_eq!(space.page_count(), 3);
    let survivor = objects[per_page + 3];

    let mut roots = vec![survivor.addr()];
    let stats = space.collect_garbage(false, &mut roots);
    assert_eq!(stats.pages_deferred, 3);
    assert_eq!(stats.after.used_in_words, size / WORD_SIZE);

    // Allocation proceeds while the sweep may still be running.
    let fresh: Vec<usize> = (0..16).map(|i| alloc(&space, &[], 2, i).addr()).collect();

    space.wait_for_tasks();
    assert_eq!(space.sweeper_tasks(), 0);
    assert!(space.stats().background_pages_freed >= 1);
    assert!(space.contains(survivor.addr()));
    assert!(!survivor.is_marked());
    assert_eq!(survivor.read_word(1), per_page + 3);
    for addr in fresh {
        assert!(space.contains(addr));
        assert!(!object_at(addr).is_free());
    }

    // Freed memory of the swept pages is allocatable again.
    assert!(space.free_words(PageKind::Data) > 0);
}

#[test]
fn test_collections_wait_for_background_sweeps() {
    let space = PageSpace::new(PageSpaceConfig::default(), Counted);
    let mut roots: Vec<usize> = Vec::new();
    for round in 0..5 {
        for i in 0..1000 {
            let object = alloc(&space, &[], 4, i);
            if i % 100 == 0 {
                roots.push(object.addr());
            }
        }
        space.collect_garbage(round % 2 == 1, &mut roots);
    }
    space.wait_for_tasks();

    assert_eq!(space.collections(), 5);
    assert_eq!(space.growth_controller().history().len(), 4);
    for &root in &roots {
        let object = object_at(root);
        assert!(!object.is_free());
        assert_eq!(object.read_word(1) % 100, 0);
    }
    let mut live = 0;
    space.visit_objects(&mut |object: HeapObject| {
        if !object.is_free() {
            live += 1;
        }
    });
    assert_eq!(live, roots.len());
}

#[test]
fn test_write_protected_space_still_collects() {
    let space = inline_space(PageSpaceConfig::default());
    let live = alloc(&space, &[], 2, 5);
    let _garbage = alloc(&space, &[], 2, 6);
    space.write_protect(true);
    assert!(space.is_write_protected());
    assert!(space.pages().iter().all(|page| page.write_protected));
    assert_eq!(live.read_word(1), 5);

    let mut roots = vec![live.addr()];
    let stats = space.collect_garbage(false, &mut roots);
    assert_eq!(stats.pages_deferred, 0);
    assert!(space.pages().iter().all(|page| page.write_protected));

    space.write_protect(false);
    assert!(!space.is_write_protected());
    assert!(space.pages().iter().all(|page| !page.write_protected));
    let next = alloc(&space, &[], 2, 0);
    assert!(space.contains(next.addr()));
}

#[test]
fn test_code_pages_protected_after_collection() {
    let space = inline_space(blocking_config());
    let code = space.allocate_forced(64, PageKind::Executable).as_ptr() as usize;
    let mut roots = vec![code];
    space.collect_garbage(false, &mut roots);
    assert!(space.page_containing(code).expect("page").write_protected);
    assert_eq!(object_at(code).size(), 64);
}

#[test]
fn test_find_object_and_pointer_visit() {
    let space = inline_space(blocking_config());
    let target = alloc(&space, &[], 1, 77);
    let holder = alloc(&space, &[target.addr()], 0, 0);

    let found = space
        .find_object(PageKind::Data, |object| {
            !object.is_free() && object.payload_words() > 1 && object.read_word(1) == 77
        })
        .expect("found");
    assert_eq!(found, target);
    assert!(space.find_object(PageKind::Executable, |_| true).is_none());

    let mut slots = Vec::new();
    space.visit_object_pointers(&mut |slot: rudo_oldgen::Slot<'_>| slots.push(slot.load()));
    assert_eq!(slots, vec![target.addr()]);
    assert!(space.is_valid_address(holder.addr()));
}

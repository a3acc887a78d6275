//! Growth control, idle collections and code collection pacing.

mod common;

use std::time::Duration;

use common::{alloc, inline_space};
use rudo_oldgen::clock::monotonic_micros;
use rudo_oldgen::page::PAGE_SIZE_IN_WORDS;
use rudo_oldgen::{GrowthPolicy, PageKind, PageSpaceConfig};

/// Fill pages with 1 KiB objects until the controller refuses to grow.
fn fill_until_denied(space: &rudo_oldgen::PageSpace) -> usize {
    let mut count = 0;
    while space
        .try_allocate(1024, PageKind::Data, GrowthPolicy::ControlGrowth)
        .is_some()
    {
        count += 1;
        assert!(count < 100_000, "growth was never denied");
    }
    count
}

#[test]
fn test_controlled_growth_stops_at_budget() {
    let config = PageSpaceConfig::default()
        .with_heap_growth_max_pages(4)
        .with_concurrent_sweep(false);
    let space = inline_space(config);
    assert!(space.growth_control_state());
    assert_eq!(space.growth_controller().grow_target_words(), 2 * PAGE_SIZE_IN_WORDS);

    fill_until_denied(&space);
    assert_eq!(space.capacity_in_words(), 2 * PAGE_SIZE_IN_WORDS);
    assert!(!space.needs_garbage_collection());

    // Forced growth goes past the budget and asks for a collection.
    space
        .try_allocate(1024, PageKind::Data, GrowthPolicy::ForceGrowth)
        .expect("forced growth");
    assert_eq!(space.capacity_in_words(), 3 * PAGE_SIZE_IN_WORDS);
    assert!(space.needs_garbage_collection());

    // Nothing survives: the budget falls back to half the freed capacity.
    let mut roots: Vec<usize> = Vec::new();
    let stats = space.collect_garbage(false, &mut roots);
    assert_eq!(stats.after.capacity_in_words, 0);
    let controller = space.growth_controller();
    assert_eq!(controller.grow_target_words(), 3 * PAGE_SIZE_IN_WORDS / 2);
    assert_eq!(controller.last_usage(), stats.after);
    assert!(!space.needs_garbage_collection());

    fill_until_denied(&space);
    assert_eq!(space.capacity_in_words(), PAGE_SIZE_IN_WORDS);
}

#[test]
fn test_disabled_growth_control_never_denies() {
    let config = PageSpaceConfig::default().with_heap_growth_max_pages(2);
    let space = inline_space(config);
    space.set_growth_control_state(false);
    assert!(!space.growth_control_state());

    for _ in 0..4 {
        space
            .try_allocate(PAGE_SIZE_IN_WORDS * 8, PageKind::Data, GrowthPolicy::ControlGrowth)
            .expect("uncontrolled growth");
    }
    assert!(!space.needs_garbage_collection());

    space.init_growth_control();
    assert!(space.growth_control_state());
    assert_eq!(space.growth_controller().last_usage(), space.usage());
}

#[test]
fn test_full_growth_ratio_never_collects() {
    let config = PageSpaceConfig::default()
        .with_heap_growth_ratio(100)
        .with_heap_growth_max_pages(2);
    let space = inline_space(config);
    for _ in 0..4 {
        space
            .try_allocate(PAGE_SIZE_IN_WORDS * 8, PageKind::Data, GrowthPolicy::ControlGrowth)
            .expect("growth");
    }
    assert!(!space.needs_garbage_collection());
    assert!(!space.should_perform_idle_mark_sweep(monotonic_micros() + 1_000_000));
}

#[test]
fn test_growth_budget_follows_survivors() {
    let config = PageSpaceConfig::default().with_concurrent_sweep(false);
    let space = inline_space(config);
    let mut roots = Vec::new();
    for i in 0..2000 {
        let object = alloc(&space, &[], 30, i);
        if i % 2 == 0 {
            roots.push(object.addr());
        }
    }
    let stats = space.collect_garbage(false, &mut roots);

    let evaluation = space
        .growth_controller()
        .last_evaluation()
        .expect("evaluated");
    let used = stats.after.used_in_words;
    assert_eq!(used, stats.before.used_in_words / 2);
    assert_eq!(evaluation.grow_target_words, used * 20 / 80);
    assert!(evaluation.garbage_ratio > 0.0);
    assert_eq!(
        space.growth_controller().idle_gc_threshold_in_words(),
        stats.after.capacity_in_words + evaluation.grow_target_words / 2
    );
}

#[test]
fn test_idle_mark_sweep_needs_time_and_growth() {
    let space = inline_space(PageSpaceConfig::default());
    // Nothing allocated: capacity does not exceed the idle threshold.
    assert!(!space.should_perform_idle_mark_sweep(monotonic_micros() + 1_000_000));

    alloc(&space, &[], 4, 0);
    assert!(space.should_perform_idle_mark_sweep(monotonic_micros() + 1_000_000));
    assert!(!space.should_perform_idle_mark_sweep(monotonic_micros() - 1));
}

#[test]
fn test_code_collection_is_rate_limited() {
    let config =
        PageSpaceConfig::default().with_code_collection_interval(Duration::from_secs(3600));
    let space = inline_space(config);
    assert!(space.should_collect_code());
    assert!(!space.should_collect_code());

    let config = config.with_always_collect_code(true);
    let space = inline_space(config);
    assert!(space.should_collect_code());
    assert!(space.should_collect_code());

    let config = PageSpaceConfig::default().with_code_collection_interval(Duration::ZERO);
    let space = inline_space(config);
    assert!(space.should_collect_code());
    assert!(space.should_collect_code());
}

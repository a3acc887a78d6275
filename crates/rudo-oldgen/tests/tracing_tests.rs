//! Integration tests for the `tracing` feature.
//!
//! A capturing layer records the message of every event emitted while a
//! space allocates, grows and collects.

#![cfg(feature = "tracing")]

mod common;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::Registry;

use common::{alloc, inline_space};
use rudo_oldgen::{GrowthPolicy, PageKind, PageSpaceConfig};

#[derive(Clone, Default)]
struct Messages(Arc<Mutex<Vec<String>>>);

impl Messages {
    fn count(&self, message: &str) -> usize {
        self.0.lock().iter().filter(|m| *m == message).count()
    }
}

struct MessageField(Option<String>);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Messages {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageField(None);
        event.record(&mut message);
        if let Some(message) = message.0 {
            self.0.lock().push(message);
        }
    }
}

fn capture(f: impl FnOnce()) -> Messages {
    let messages = Messages::default();
    let subscriber = Registry::default().with(messages.clone());
    tracing::subscriber::with_default(subscriber, f);
    messages
}

#[test]
fn test_collection_emits_phase_events() {
    let messages = capture(|| {
        let space = inline_space(PageSpaceConfig::default());
        let live = alloc(&space, &[], 4, 0);
        alloc(&space, &[], 4, 0);
        let mut roots = vec![live.addr()];
        space.collect_garbage(false, &mut roots);
        space.collect_garbage(true, &mut roots);
    });

    assert_eq!(messages.count("phase_start"), 4);
    assert_eq!(messages.count("phase_end"), 4);
    assert_eq!(messages.count("growth_evaluated"), 2);
    assert_eq!(messages.count("page_allocated"), 1);
}

#[test]
fn test_page_traffic_and_denials_are_logged() {
    let messages = capture(|| {
        let config = PageSpaceConfig::default()
            .with_heap_growth_max_pages(2)
            .with_concurrent_sweep(false);
        let space = inline_space(config);
        space.allocate_forced(256 * 1024, PageKind::Data);
        assert!(space
            .try_allocate(256 * 1024, PageKind::Data, GrowthPolicy::ControlGrowth)
            .is_none());
        let mut roots: Vec<usize> = Vec::new();
        space.collect_garbage(false, &mut roots);
    });

    assert_eq!(messages.count("page_allocated"), 1);
    assert_eq!(messages.count("page_freed"), 1);
    assert_eq!(messages.count("growth_denied"), 1);
}

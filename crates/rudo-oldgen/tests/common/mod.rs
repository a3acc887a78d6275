//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use rudo_oldgen::object::{round_up_object_size, WORD_SIZE};
use rudo_oldgen::{
    GrowthPolicy, HeapObject, InlineRunner, ObjectTracer, PageKind, PageSpace, PageSpaceConfig,
    PointerVisitor,
};

/// Object model of the tests: payload word 0 holds a count `n`, payload
/// words `1..=n` are pointer slots, the rest is plain data.
pub struct Counted;

// SAFETY: every slot `1..=n` is reported, and `n` is clamped to the payload.
unsafe impl ObjectTracer for Counted {
    fn trace(&self, object: HeapObject, visitor: &mut dyn PointerVisitor) {
        let slots = object.read_word(0).min(object.payload_words() - 1);
        for i in 1..=slots {
            visitor.visit_slot(object.slot(i));
        }
    }
}

/// Space whose background sweeps run inline on the collecting thread.
pub fn inline_space(config: PageSpaceConfig) -> Arc<PageSpace> {
    PageSpace::with_task_runner(config, Counted, Arc::new(InlineRunner))
}

/// Size in bytes of an object with `slots` pointer slots and `data` data words.
pub const fn object_size(slots: usize, data: usize) -> usize {
    round_up_object_size((2 + slots + data) * WORD_SIZE)
}

/// Allocate a data object holding `pointers`, followed by `data` words
/// numbered from `seed`.
pub fn alloc(space: &PageSpace, pointers: &[usize], data: usize, seed: usize) -> HeapObject {
    let size = object_size(pointers.len(), data);
    let ptr = space
        .try_allocate(size, PageKind::Data, GrowthPolicy::ForceGrowth)
        .expect("allocation");
    // SAFETY: freshly allocated by the space.
    let object = unsafe { HeapObject::from_addr(ptr.as_ptr() as usize) };
    object.write_word(0, pointers.len());
    for (i, &pointer) in pointers.iter().enumerate() {
        object.write_word(1 + i, pointer);
    }
    for i in 0..data {
        object.write_word(1 + pointers.len() + i, seed + i);
    }
    object
}

/// Handle to the object at `addr`.
pub fn object_at(addr: usize) -> HeapObject {
    // SAFETY: the tests only pass addresses of live objects.
    unsafe { HeapObject::from_addr(addr) }
}

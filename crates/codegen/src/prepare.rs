//! Frame-layout requests for the conversion.
//!
//! Reserves one loop-counter word and one predicate-file save slot per
//! nesting level below the root, enough packed words to hold every excess
//! predicate spill bit the allocator assigned, and a scratch save word
//! around call sites. Placement of the slots is left to the frame-layout
//! component.

use singlepath_ir::{frame::WORD_BITS, FrameLayout, Function, ScopeTree};

use crate::alloc::RegAlloc;

pub fn prepare_frame(func: &Function, tree: &ScopeTree, ra: &RegAlloc) -> FrameLayout {
    let mut frame = FrameLayout::new();

    let max_depth = tree.pre_order().map(|scope| tree.depth(scope)).max().unwrap_or(0);
    for _ in 0..max_depth {
        frame.add_counter_slot();
    }
    for _ in 0..max_depth {
        frame.add_file_save_slot();
    }

    let spill_bits: u32 = tree
        .pre_order()
        .map(|scope| ra.info(scope).needed_spill_slots())
        .sum();
    for _ in 0..spill_bits.div_ceil(WORD_BITS) {
        frame.add_spill_word();
    }

    if func.has_calls() {
        frame.add_call_save_slot();
    }

    frame
}

//! Frame-layout requests produced by the conversion.
//!
//! The conversion does not place stack objects; it records fixed-size slot
//! requests that the frame-layout component materializes later. Slots fall
//! into four groups: loop-counter words (one per nesting depth), predicate
//! file save slots (one per nesting depth), excess predicate spill words
//! (packed bit bundles) and the call-site scratch save word.

use cranelift_entity::PrimaryMap;

use crate::FrameSlot;

/// Bytes per machine word; spill words pack one predicate per bit.
pub const WORD_BYTES: u32 = 4;

/// Predicate bits per spill word.
pub const WORD_BITS: u32 = WORD_BYTES * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotData {
    pub bytes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    slots: PrimaryMap<FrameSlot, SlotData>,
    counters: Vec<FrameSlot>,
    file_saves: Vec<FrameSlot>,
    spill_words: Vec<FrameSlot>,
    call_save: Option<FrameSlot>,
}

impl FrameLayout {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_slot(&mut self, bytes: u32) -> FrameSlot {
        self.slots.push(SlotData { bytes })
    }

    pub fn add_counter_slot(&mut self) -> FrameSlot {
        let slot = self.make_slot(WORD_BYTES);
        self.counters.push(slot);
        slot
    }

    pub fn add_file_save_slot(&mut self) -> FrameSlot {
        // The predicate file fits in a byte.
        let slot = self.make_slot(1);
        self.file_saves.push(slot);
        slot
    }

    pub fn add_spill_word(&mut self) -> FrameSlot {
        let slot = self.make_slot(WORD_BYTES);
        self.spill_words.push(slot);
        slot
    }

    pub fn add_call_save_slot(&mut self) -> FrameSlot {
        let slot = self.make_slot(WORD_BYTES);
        self.call_save = Some(slot);
        slot
    }

    /// The loop-counter slot for a scope at nesting `depth` (>= 1).
    pub fn counter_slot(&self, depth: u32) -> FrameSlot {
        self.counters[depth as usize - 1]
    }

    /// The predicate-file save slot for a scope at nesting `depth` (>= 1).
    pub fn file_save_slot(&self, depth: u32) -> FrameSlot {
        self.file_saves[depth as usize - 1]
    }

    /// Resolves a unified spill-slot index to its packed word and bit.
    pub fn spill_word(&self, slot_index: u32) -> (FrameSlot, u32) {
        (
            self.spill_words[(slot_index / WORD_BITS) as usize],
            slot_index % WORD_BITS,
        )
    }

    pub fn call_save_slot(&self) -> Option<FrameSlot> {
        self.call_save
    }

    pub fn slot_bytes(&self, slot: FrameSlot) -> u32 {
        self.slots[slot].bytes
    }

    /// Total number of requested slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn counter_slot_count(&self) -> usize {
        self.counters.len()
    }

    pub fn file_save_slot_count(&self) -> usize {
        self.file_saves.len()
    }

    pub fn spill_word_count(&self) -> usize {
        self.spill_words.len()
    }
}

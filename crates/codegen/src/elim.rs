//! Redundant-load elimination.
//!
//! The conversion funnels all spill traffic through one scratch register,
//! so consecutive reloads of the same frame slot are common. A forward
//! dataflow over the linearized function tracks which slot's content the
//! scratch register currently holds, as a bit set over slot indices: a
//! block's entry set is the intersection of its predecessors' exit sets
//! (a slot is available only if it is available on every path), and an
//! unconditional load of slot `s` narrows the running set to `{s}`.
//! Iterated to a fixed point; a load whose slot is already in the running
//! set at its position is removed.
//!
//! The symmetric backward analysis for redundant stores is intentionally
//! absent: it is unsound across loop back-edges.

use rustc_hash::FxHashMap;
use singlepath_ir::{BlockId, FrameLayout, FrameSlot, Function, InstId, InstKind};

use crate::{bitset::BitSet, MachineSpec, SinglePathStats};

/// Removes provably redundant unconditional loads of the scratch register.
/// `seeds` are analysis-only loads that are removed no matter what.
pub fn eliminate_redundant_loads(
    func: &mut Function,
    frame: &FrameLayout,
    spec: &MachineSpec,
    seeds: Vec<InstId>,
    stats: &mut SinglePathStats,
) -> u32 {
    let universe = frame.slot_count();
    let order: Vec<BlockId> = func.layout().collect();

    let mut entry_sets: FxHashMap<BlockId, BitSet<FrameSlot>> = FxHashMap::default();
    let mut exit_sets: FxHashMap<BlockId, BitSet<FrameSlot>> = FxHashMap::default();
    let mut at_load: FxHashMap<InstId, BitSet<FrameSlot>> = FxHashMap::default();

    let mut changed = true;
    while changed {
        changed = false;
        for &block in &order {
            let mut live = if func.pred_num_of(block) > 0 {
                let mut acc = BitSet::full(universe);
                for pred in func.preds_of(block) {
                    match exit_sets.get(pred) {
                        Some(set) => acc.intersect_with(set),
                        None => acc.clear(),
                    }
                }
                acc
            } else {
                BitSet::new()
            };

            if entry_sets.get(&block) != Some(&live) {
                entry_sets.insert(block, live.clone());
                changed = true;
            }

            for &inst in func.insts_of(block) {
                if let Some(slot) = unconditional_load(func, spec, inst) {
                    at_load.insert(inst, live.clone());
                    live.reset_to(slot);
                }
            }

            if exit_sets.get(&block) != Some(&live) {
                exit_sets.insert(block, live);
                changed = true;
            }
        }
    }

    let mut removed = 0;
    for &block in &order {
        let insts: Vec<InstId> = func.insts_of(block).to_vec();
        for inst in insts {
            let Some(slot) = unconditional_load(func, spec, inst) else {
                continue;
            };
            let redundant = at_load
                .get(&inst)
                .map(|set| set.contains(slot))
                .unwrap_or(false);
            if redundant || seeds.contains(&inst) {
                func.remove_inst(block, inst);
                removed += 1;
            }
        }
    }

    stats.eliminated_loads += removed;
    removed
}

fn unconditional_load(func: &Function, spec: &MachineSpec, inst: InstId) -> Option<FrameSlot> {
    let data = func.inst(inst);
    match data.kind {
        InstKind::LoadSlot { dst, slot } if dst == spec.scratch_gpr && data.guard.is_always() => {
            Some(slot)
        }
        _ => None,
    }
}

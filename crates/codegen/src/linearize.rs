//! CFG linearization.
//!
//! A fold over the scope tree replaces the branch structure with physical
//! sequencing: member blocks are appended in topological order, nested
//! scopes recurse between a generated preheader (file save, header
//! predicate hand-off, loop-counter initialization) and a generated latch
//! (header predicate reload, counter decrement, conditional back-edge),
//! plus a postloop block restoring the predicate file where needed. All
//! emitted blocks are chained by fall-through; the loop back-edges are the
//! only surviving control transfers.
//!
//! A final pass splices every single-predecessor block into its
//! predecessor, removing the jump-only seams the emission leaves behind.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use singlepath_ir::{
    BlockId, FrameLayout, Function, Guard, InstData, InstId, InstKind, PReg, ScopeId, ScopeTree,
};

use crate::{
    alloc::{Location, RegAlloc},
    error::ConvertError,
    MachineSpec, SinglePathStats,
};

/// Linearizes `func` in place. Returns the synthetic seed loads that the
/// redundant-load eliminator must remove unconditionally.
pub fn linearize(
    func: &mut Function,
    tree: &ScopeTree,
    ra: &RegAlloc,
    spec: &MachineSpec,
    frame: &FrameLayout,
    stats: &mut SinglePathStats,
) -> Result<Vec<InstId>, ConvertError> {
    let live_outs = compute_live_out_pregs(func, tree);
    let mut emitter = Emitter {
        func,
        tree,
        ra,
        spec,
        frame,
        stats,
        live_outs,
        last: None,
        order: Vec::new(),
        seeds: Vec::new(),
    };
    emitter.walk(tree.root())?;

    let Emitter {
        func, order, seeds, ..
    } = emitter;
    func.set_layout(order);
    Ok(seeds)
}

/// Physical predicate registers live out of each scope into its successor
/// blocks. Collected before emission destroys the edges.
fn compute_live_out_pregs(
    func: &Function,
    tree: &ScopeTree,
) -> FxHashMap<ScopeId, SmallVec<[PReg; 4]>> {
    let mut result = FxHashMap::default();
    for scope in tree.pre_order() {
        let members: Vec<BlockId> = tree
            .pre_order_from(scope)
            .flat_map(|sub| tree.blocks(sub).iter().copied())
            .collect();
        let in_scope: FxHashSet<BlockId> = members.iter().copied().collect();

        let mut pregs: SmallVec<[PReg; 4]> = SmallVec::new();
        for block in &members {
            for succ in func.succs_of(*block) {
                if in_scope.contains(succ) {
                    continue;
                }
                for preg in func.live_in_pregs(*succ) {
                    if !pregs.contains(preg) {
                        pregs.push(*preg);
                    }
                }
            }
        }
        result.insert(scope, pregs);
    }
    result
}

struct Emitter<'a> {
    func: &'a mut Function,
    tree: &'a ScopeTree,
    ra: &'a RegAlloc,
    spec: &'a MachineSpec,
    frame: &'a FrameLayout,
    stats: &'a mut SinglePathStats,
    live_outs: FxHashMap<ScopeId, SmallVec<[PReg; 4]>>,
    last: Option<BlockId>,
    order: Vec<BlockId>,
    seeds: Vec<InstId>,
}

impl Emitter<'_> {
    fn walk(&mut self, scope: ScopeId) -> Result<(), ConvertError> {
        self.enter_scope(scope)?;
        for &block in self.tree.blocks(scope) {
            match self.tree.subheader_child(scope, block) {
                Some(child) => self.walk(child)?,
                None => self.next_block(block),
            }
        }
        self.exit_scope(scope);
        Ok(())
    }

    /// Appends `block` to the emission: strips its branches, disconnects it
    /// and chains it behind the previously emitted block.
    fn next_block(&mut self, block: BlockId) {
        while let Some(inst) = self.func.last_inst_of(block) {
            if !self.func.inst(inst).kind.is_branch() {
                break;
            }
            self.func.remove_inst(block, inst);
            self.stats.removed_branches += 1;
        }
        self.func.clear_succs(block);

        if let Some(last) = self.last {
            self.func.add_edge(last, block);
        }
        self.last = Some(block);
        self.order.push(block);
    }

    fn append(&mut self, block: BlockId, kind: InstKind) -> InstId {
        self.stats.inserted_insts += 1;
        self.func.append_inst(block, InstData::synth(kind))
    }

    fn append_guarded(&mut self, block: BlockId, kind: InstKind, guard: Guard) -> InstId {
        self.stats.inserted_insts += 1;
        self.func
            .append_inst(block, InstData::synth_guarded(kind, guard))
    }

    /// Emits the preheader of a nested scope.
    fn enter_scope(&mut self, scope: ScopeId) -> Result<(), ConvertError> {
        if self.tree.is_top_level(scope) {
            return Ok(());
        }

        let info = self.ra.info(scope);
        let depth = self.tree.depth(scope);
        let scratch = self.spec.scratch_gpr;
        let header = self.tree.header(scope);
        let pre = self.func.make_block();

        if info.needs_file_save() {
            let word = self.frame.file_save_slot(depth);
            self.append(pre, InstKind::ReadPredFile { dst: scratch });
            // Seed load so the eliminator sees the slot as resident; it is
            // removed unconditionally afterwards.
            let seed = self.append(pre, InstKind::LoadSlot { dst: scratch, slot: word });
            self.seeds.push(seed);
            self.append(pre, InstKind::StoreSlot { slot: word, src: scratch });
        }

        // Hand the header predicate's initial value down from the parent.
        let parent = self.tree.parent(scope).expect("nested scope has a parent");
        let parent_info = self.ra.info(parent);
        let parent_loads = parent_info.load_locs(header);
        let parent_regs = parent_info.use_regs(header);
        let child_regs = info.use_regs(header);
        for pred in self.tree.guards(scope, header) {
            let Some(target_idx) = child_regs.get(pred) else {
                continue;
            };
            let target = self.spec.preg(*target_idx);
            match parent_loads.get(pred) {
                Some(Location::Slot(slot)) => {
                    let (word, bit) = self.frame.spill_word(*slot);
                    self.append(pre, InstKind::LoadSlot { dst: scratch, slot: word });
                    self.append(
                        pre,
                        InstKind::BitTest {
                            dst: target,
                            src: scratch,
                            bit,
                        },
                    );
                }
                Some(Location::Reg(reg)) => {
                    let src = self.spec.preg(*reg);
                    self.append(
                        pre,
                        InstKind::PredMov {
                            dst: target,
                            src: Guard::reg(src),
                        },
                    );
                }
                None => {
                    let parent_reg = parent_regs
                        .get(pred)
                        .map(|reg| self.spec.preg(*reg))
                        .unwrap_or(PReg::TRUE);
                    if target != parent_reg {
                        self.append(
                            pre,
                            InstKind::PredMov {
                                dst: target,
                                src: Guard::reg(parent_reg),
                            },
                        );
                    }
                }
            }
        }

        // Initialize the loop counter.
        match self.tree.loop_bound(scope) {
            Some(bound) => {
                let counter = self.frame.counter_slot(depth);
                self.append(pre, InstKind::LoadImm { dst: scratch, imm: bound });
                let seed = self.append(pre, InstKind::LoadSlot { dst: scratch, slot: counter });
                self.seeds.push(seed);
                self.append(pre, InstKind::StoreSlot { slot: counter, src: scratch });
                self.stats.loop_counters += 1;
            }
            None => {
                return Err(ConvertError::MissingLoopBound {
                    func: self.func.name.clone(),
                    header,
                })
            }
        }

        self.next_block(pre);
        Ok(())
    }

    /// Emits the latch (and postloop, if the file was saved) of a nested
    /// scope.
    fn exit_scope(&mut self, scope: ScopeId) {
        if self.tree.is_top_level(scope) {
            return;
        }

        let info = self.ra.info(scope);
        let depth = self.tree.depth(scope);
        let scratch = self.spec.scratch_gpr;
        let temp = self.spec.temp_preg();
        let header = self.tree.header(scope);

        let latch = self.func.make_block();
        // Weave the latch in before adding the back-edge, or the branch
        // would be stripped again.
        self.next_block(latch);

        // Reload the header predicate where the next iteration expects it.
        let child_regs = info.use_regs(header);
        for (pred, loc) in info.load_locs(header) {
            let target = self.spec.preg(child_regs[&pred]);
            match loc {
                Location::Slot(slot) => {
                    let (word, bit) = self.frame.spill_word(slot);
                    self.append(latch, InstKind::LoadSlot { dst: scratch, slot: word });
                    self.append(
                        latch,
                        InstKind::BitTest {
                            dst: target,
                            src: scratch,
                            bit,
                        },
                    );
                }
                Location::Reg(reg) => {
                    let src = self.spec.preg(reg);
                    self.append(
                        latch,
                        InstKind::PredMov {
                            dst: target,
                            src: Guard::reg(src),
                        },
                    );
                }
            }
        }

        // Decrement the counter and branch back while it is positive.
        let counter = self.frame.counter_slot(depth);
        self.append(latch, InstKind::LoadSlot { dst: scratch, slot: counter });
        self.append(
            latch,
            InstKind::SubImm {
                dst: scratch,
                src: scratch,
                imm: 1,
            },
        );
        self.append(latch, InstKind::TestGtZero { dst: temp, src: scratch });
        self.append(latch, InstKind::StoreSlot { slot: counter, src: scratch });
        self.append_guarded(latch, InstKind::Branch { target: header }, Guard::reg(temp));
        self.func.add_edge(latch, header);

        if info.needs_file_save() {
            let post = self.func.make_block();
            let word = self.frame.file_save_slot(depth);
            self.append(post, InstKind::LoadSlot { dst: scratch, slot: word });

            // Merge predicate registers that outlive the loop into the
            // saved file before restoring it.
            let live_outs = self.live_outs.get(&scope).cloned().unwrap_or_default();
            for preg in live_outs {
                self.append(
                    post,
                    InstKind::BitCopy {
                        dst: scratch,
                        src: scratch,
                        bit: u32::from(preg.0),
                        cond: Guard::reg(preg),
                    },
                );
            }
            self.append(post, InstKind::WritePredFile { src: scratch });
            self.next_block(post);
        }
    }
}

/// Splices single-predecessor blocks into their predecessor, walking the
/// emission order. A predecessor that just gained the loop back-edge
/// (two successors) starts a new merge base.
pub fn merge_blocks(func: &mut Function, tree: &mut ScopeTree) {
    let order: Vec<BlockId> = func.layout().collect();
    if order.is_empty() {
        return;
    }

    let mut base = order[0];
    let mut i = 1;
    while i < order.len() {
        let block = order[i];
        if func.pred_num_of(block) == 1 && func.preds_of(block)[0] == base {
            func.splice(base, block);
            tree.merge_blocks(base, block);
            if func.succ_num_of(base) > 1 {
                i += 1;
                if i < order.len() {
                    base = order[i];
                }
            }
        } else {
            base = block;
        }
        i += 1;
    }
}

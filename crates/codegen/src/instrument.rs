//! Code instrumentation.
//!
//! Rewrites instruction guards to the allocated predicate registers,
//! special-cases calls, inserts the spill/reload code the allocator
//! recorded, clears slot-resident predicates at scope entry and lowers the
//! per-edge predicate definitions.

use std::collections::BTreeMap;

use singlepath_ir::{
    BlockId, FrameLayout, Function, FunctionKind, Guard, InstData, InstKind, PReg, Pred, ScopeId,
    ScopeTree,
};

use crate::{
    alloc::{Location, RAInfo, RegAlloc},
    error::ConvertError,
    MachineSpec, SinglePathStats,
};

pub struct Instrumentor<'a> {
    pub func: &'a mut Function,
    pub tree: &'a ScopeTree,
    pub ra: &'a RegAlloc,
    pub spec: &'a MachineSpec,
    pub frame: &'a FrameLayout,
    pub stats: &'a mut SinglePathStats,
}

/// One lowered definition, ordered so that no definition clobbers the guard
/// or condition of a later one in the same block.
#[derive(Debug, Clone)]
enum DefOp {
    Simple {
        target: Location,
        /// Physical register when `target` is register-located.
        target_reg: Option<PReg>,
        guard: PReg,
        cond: Guard,
        first: bool,
    },
    /// Two definitions from complementary conditions targeting each other's
    /// registers, lowered as a register exchange plus two self-guarded
    /// definitions.
    Swap {
        p1: PReg,
        p2: PReg,
        cond1: Guard,
        cond2: Guard,
    },
}

impl DefOp {
    /// Whether this definition writes the register `guard` is read from.
    fn overwrites_guard(&self, guard: PReg) -> bool {
        if guard == PReg::TRUE {
            return false;
        }
        match self {
            Self::Simple { target_reg, .. } => *target_reg == Some(guard),
            Self::Swap { p1, p2, .. } => *p1 == guard || *p2 == guard,
        }
    }

}

impl<'a> Instrumentor<'a> {
    pub fn run(&mut self) -> Result<(), ConvertError> {
        let scopes: Vec<ScopeId> = self.tree.pre_order().collect();

        for scope in &scopes {
            self.apply_guards(*scope);
        }
        for scope in &scopes {
            self.insert_definitions(*scope)?;
            self.init_stack_locations(*scope);
        }
        Ok(())
    }

    fn phys_regs(&self, info: &RAInfo, block: BlockId) -> BTreeMap<Pred, PReg> {
        info.use_regs(block)
            .into_iter()
            .map(|(pred, reg)| (pred, self.spec.preg(reg)))
            .collect()
    }

    /// Rewrites the guards of every instruction owned by `scope`.
    fn apply_guards(&mut self, scope: ScopeId) {
        let info = self.ra.info(scope);
        let temp = self.spec.temp_preg();

        for &block in self.tree.blocks(scope) {
            // Subheaders are guarded when their own scope is processed.
            if self.tree.subheader_child(scope, block).is_some() {
                continue;
            }
            let use_regs = self.phys_regs(info, block);

            let mut idx = 0;
            loop {
                let insts = self.func.insts_of(block);
                if idx >= insts.len() {
                    break;
                }
                let inst = insts[idx];
                let data = self.func.inst(inst).clone();
                if data.kind.is_terminator() {
                    break;
                }
                if data.frame_setup || data.synthetic {
                    idx += 1;
                    continue;
                }
                let Some(lpred) = self.tree.inst_pred(inst) else {
                    idx += 1;
                    continue;
                };
                let preg = use_regs.get(&lpred).copied().unwrap_or(PReg::TRUE);

                if data.kind.is_call() {
                    // The call itself cannot be guarded: hand the guard to
                    // the callee in the reserved temporary, and preserve the
                    // caller-saved scratch around the call.
                    debug_assert!(data.guard.is_always());
                    self.func.insert_inst(
                        block,
                        idx,
                        InstData::synth(InstKind::PredMov {
                            dst: temp,
                            src: Guard::reg(preg),
                        }),
                    );
                    if let Some(save) = self.frame.call_save_slot() {
                        self.func.insert_inst(
                            block,
                            idx + 1,
                            InstData::synth(InstKind::StoreSlot {
                                slot: save,
                                src: self.spec.call_saved_gpr,
                            }),
                        );
                        self.func.insert_inst(
                            block,
                            idx + 3,
                            InstData::synth(InstKind::LoadSlot {
                                dst: self.spec.call_saved_gpr,
                                slot: save,
                            }),
                        );
                        self.stats.inserted_insts += 3;
                        idx += 4;
                    } else {
                        self.stats.inserted_insts += 1;
                        idx += 2;
                    }
                    continue;
                }

                if data.kind.is_predicable() && preg != PReg::TRUE {
                    if data.guard.is_always() {
                        self.func.inst_mut(inst).guard = Guard::reg(preg);
                    } else if data.guard != Guard::reg(preg) {
                        // Earlier, finer-grained predication: guard by the
                        // conjunction of both.
                        self.func.insert_inst(
                            block,
                            idx,
                            InstData::synth(InstKind::PredAnd {
                                dst: temp,
                                lhs: Guard::reg(preg),
                                rhs: data.guard,
                            }),
                        );
                        self.func.inst_mut(inst).guard = Guard::reg(temp);
                        self.stats.inserted_insts += 1;
                        idx += 1;
                    }
                }
                idx += 1;
            }

            if !self.tree.is_header(scope, block) && info.has_spill_load(block) {
                self.insert_use_spill_load(info, block, &use_regs);
            }

            // A reachable function picks its top-level guard up from the
            // caller once the frame is set up.
            if self.func.kind == FunctionKind::Reachable
                && self.tree.is_top_level(scope)
                && self.tree.is_header(scope, block)
            {
                if let Some(pred) = self.tree.header_pred(scope) {
                    if let Some(reg) = use_regs.get(&pred) {
                        let at = self.func.frame_setup_end(block);
                        self.func.insert_inst(
                            block,
                            at,
                            InstData::synth(InstKind::PredMov {
                                dst: *reg,
                                src: Guard::reg(temp),
                            }),
                        );
                        self.stats.inserted_insts += 1;
                    }
                }
            }
        }
    }

    /// Materializes slot-resident guard predicates at the top of `block`,
    /// spilling evicted register contents first.
    fn insert_use_spill_load(
        &mut self,
        info: &RAInfo,
        block: BlockId,
        use_regs: &BTreeMap<Pred, PReg>,
    ) {
        let scratch = self.spec.scratch_gpr;
        let loads = info.load_locs(block);
        let spills = info.spill_locs(block);
        debug_assert!(spills.keys().all(|pred| loads.contains_key(pred)));

        let mut at = 0;
        for (pred, load) in loads {
            let target = use_regs[&pred];

            if let Some(spill) = spills.get(&pred) {
                // The register still holds the evicted predicate: store it
                // into the evictee's slot before the reload clobbers it.
                let (word, bit) = self.frame.spill_word(*spill);
                self.func.insert_inst(
                    block,
                    at,
                    InstData::synth(InstKind::LoadSlot { dst: scratch, slot: word }),
                );
                self.func.insert_inst(
                    block,
                    at + 1,
                    InstData::synth(InstKind::BitCopy {
                        dst: scratch,
                        src: scratch,
                        bit,
                        cond: Guard::reg(target),
                    }),
                );
                self.func.insert_inst(
                    block,
                    at + 2,
                    InstData::synth(InstKind::StoreSlot { slot: word, src: scratch }),
                );
                at += 3;
                self.stats.inserted_insts += 3;
            }

            match load {
                Location::Slot(slot) => {
                    let (word, bit) = self.frame.spill_word(slot);
                    self.func.insert_inst(
                        block,
                        at,
                        InstData::synth(InstKind::LoadSlot { dst: scratch, slot: word }),
                    );
                    self.func.insert_inst(
                        block,
                        at + 1,
                        InstData::synth(InstKind::BitTest {
                            dst: target,
                            src: scratch,
                            bit,
                        }),
                    );
                    at += 2;
                    self.stats.inserted_insts += 2;
                }
                Location::Reg(reg) => {
                    self.func.insert_inst(
                        block,
                        at,
                        InstData::synth(InstKind::PredMov {
                            dst: target,
                            src: Guard::reg(self.spec.preg(reg)),
                        }),
                    );
                    at += 1;
                    self.stats.inserted_insts += 1;
                }
            }
        }
    }

    /// Clears the slot bits of every slot-defined predicate of `scope` once
    /// at scope entry, so definitions can merge single bits.
    fn init_stack_locations(&mut self, scope: ScopeId) {
        let info = self.ra.info(scope);
        let scratch = self.spec.scratch_gpr;
        let header_pred = self.tree.header_pred(scope);

        let mut masks: BTreeMap<_, u32> = BTreeMap::new();
        for pred in self.tree.scope_preds(scope) {
            // The header predicate carries the live loop condition.
            if Some(pred) == header_pred {
                continue;
            }
            if let Some(Location::Slot(slot)) = info.def_loc(pred) {
                let (word, bit) = self.frame.spill_word(slot);
                *masks.entry(word).or_insert(0) |= 1 << bit;
            }
        }

        let header = self.tree.header(scope);
        let mut at = if self.tree.is_top_level(scope) {
            self.func.frame_setup_end(header)
        } else {
            0
        };
        for (word, mask) in masks {
            self.func.insert_inst(
                header,
                at,
                InstData::synth(InstKind::LoadSlot { dst: scratch, slot: word }),
            );
            self.func.insert_inst(
                header,
                at + 1,
                InstData::synth(InstKind::AndImm {
                    dst: scratch,
                    src: scratch,
                    imm: !mask,
                }),
            );
            self.func.insert_inst(
                header,
                at + 2,
                InstData::synth(InstKind::StoreSlot { slot: word, src: scratch }),
            );
            at += 3;
            self.stats.inserted_insts += 3;
        }
    }

    /// Lowers the edge definitions of every member block of `scope`.
    fn insert_definitions(&mut self, scope: ScopeId) -> Result<(), ConvertError> {
        for &block in self.tree.blocks(scope).to_vec().iter() {
            let defs = self.tree.defs(scope, block).to_vec();
            if defs.is_empty() {
                continue;
            }

            let info = self.ra.info(scope);
            // Loop-exit definitions on a subheader find their guards in the
            // child scope's registers at runtime.
            let sub = self.tree.subheader_child(scope, block);
            let guard_info = sub.map(|child| self.ra.info(child)).unwrap_or(info);
            let use_regs = self.phys_regs(guard_info, block);

            let mut ordered: Vec<DefOp> = Vec::new();
            for def in &defs {
                let target = info
                    .def_loc(def.pred)
                    .expect("defined predicate has a location");
                let target_reg = match target {
                    Location::Reg(reg) => Some(self.spec.preg(reg)),
                    Location::Slot(_) => None,
                };
                let op = DefOp::Simple {
                    target,
                    target_reg,
                    guard: use_regs.get(&def.guard).copied().unwrap_or(PReg::TRUE),
                    cond: def.cond,
                    first: info.is_first_def(block, def.pred),
                };
                self.place_def(&mut ordered, op, block)?;
            }

            self.emit_defs(block, sub, &ordered);
        }
        Ok(())
    }

    /// Inserts `op` into `ordered` so no definition overwrites the guard of
    /// a later one, detecting register-exchange pairs.
    fn place_def(
        &self,
        ordered: &mut Vec<DefOp>,
        op: DefOp,
        block: BlockId,
    ) -> Result<(), ConvertError> {
        let DefOp::Simple {
            target,
            target_reg,
            guard,
            cond,
            mut first,
        } = op
        else {
            unreachable!("definitions enter as simple");
        };

        let mut insert_at: Option<usize> = None;
        for i in 0..ordered.len() {
            let y = ordered[i].clone();
            match y {
                DefOp::Swap { p1, p2, .. } => {
                    if y.overwrites_guard(guard) {
                        insert_at = Some(i);
                    }
                    if target_reg == Some(p1) || target_reg == Some(p2) {
                        // A third definition entangled with an exchange pair
                        // cannot be ordered.
                        return Err(ConvertError::UnsupportedDefinition {
                            func: self.func.name.clone(),
                            block,
                        });
                    }
                }
                DefOp::Simple {
                    target: y_target,
                    target_reg: y_target_reg,
                    guard: y_guard,
                    cond: y_cond,
                    ..
                } => {
                    // Mutually exclusive conditions targeting each other's
                    // registers: fold both into one exchange.
                    if let (Some(x_reg), Some(y_reg)) = (target_reg, y_target_reg) {
                        if y_guard == x_reg
                            && guard == y_reg
                            && cond.preg == y_cond.preg
                            && cond.negated != y_cond.negated
                        {
                            ordered.remove(i);
                            ordered.push(DefOp::Swap {
                                p1: y_reg,
                                p2: x_reg,
                                cond1: y_cond,
                                cond2: cond,
                            });
                            return Ok(());
                        }
                    }

                    let shares_target = y_target == target;
                    if y.overwrites_guard(guard) && insert_at.is_none() {
                        insert_at = Some(i);
                        if shares_target {
                            // x now runs before y, so y is no longer first.
                            set_first(&mut ordered[i], false);
                        }
                    } else if shares_target {
                        if insert_at.is_none() {
                            first = false;
                        } else {
                            set_first(&mut ordered[i], false);
                        }
                    }
                }
            }
        }

        let op = DefOp::Simple {
            target,
            target_reg,
            guard,
            cond,
            first,
        };
        match insert_at {
            Some(at) => ordered.insert(at, op),
            None => ordered.push(op),
        }
        Ok(())
    }

    fn emit_defs(&mut self, block: BlockId, sub: Option<ScopeId>, ordered: &[DefOp]) {
        let mut at = self.func.terminator_index(block);
        for op in ordered {
            match op {
                DefOp::Swap {
                    p1,
                    p2,
                    cond1,
                    cond2,
                } => {
                    // Exchange the two register values, then let each
                    // register guard its own definition.
                    for (dst, other) in [(p1, p2), (p2, p1), (p1, p2)] {
                        self.func.insert_inst(
                            block,
                            at,
                            InstData::synth(InstKind::PredXor {
                                dst: *dst,
                                lhs: *dst,
                                rhs: *other,
                            }),
                        );
                        at += 1;
                        self.stats.inserted_insts += 1;
                    }
                    for (reg, cond) in [(p1, cond1), (p2, cond2)] {
                        self.func.insert_inst(
                            block,
                            at,
                            InstData::synth(InstKind::PredAnd {
                                dst: *reg,
                                lhs: Guard::reg(*reg),
                                rhs: *cond,
                            }),
                        );
                        at += 1;
                        self.stats.inserted_insts += 1;
                    }
                }
                DefOp::Simple {
                    target,
                    target_reg,
                    guard,
                    cond,
                    first,
                } => {
                    at = self.emit_simple_def(
                        block, sub, at, *target, *target_reg, *guard, *cond, *first,
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_simple_def(
        &mut self,
        block: BlockId,
        sub: Option<ScopeId>,
        mut at: usize,
        target: Location,
        target_reg: Option<PReg>,
        guard: PReg,
        cond: Guard,
        first: bool,
    ) -> usize {
        let scratch = self.spec.scratch_gpr;
        match target {
            Location::Reg(_) => {
                let target_reg = target_reg.expect("register-located definition");
                let child_saves = sub
                    .map(|child| self.ra.info(child).needs_file_save())
                    .unwrap_or(false);
                if child_saves {
                    // The loop body saves/restores the register file, so a
                    // loop-exit definition must go into the saved word or
                    // the restore would clobber it.
                    let child = sub.unwrap();
                    let word = self.frame.file_save_slot(self.tree.depth(child));
                    let bit = u32::from(target_reg.0);
                    self.func.insert_inst(
                        block,
                        at,
                        InstData::synth(InstKind::LoadSlot { dst: scratch, slot: word }),
                    );
                    self.func.insert_inst(
                        block,
                        at + 1,
                        InstData::synth_guarded(
                            InstKind::BitCopy {
                                dst: scratch,
                                src: scratch,
                                bit,
                                cond,
                            },
                            Guard::reg(guard),
                        ),
                    );
                    self.func.insert_inst(
                        block,
                        at + 2,
                        InstData::synth(InstKind::StoreSlot { slot: word, src: scratch }),
                    );
                    self.stats.inserted_insts += 3;
                    at + 3
                } else {
                    // First definition overwrites unconditionally with
                    // guard & cond; later ones only update under the guard
                    // so other paths' values survive. Subheader definitions
                    // re-execute every iteration and must never clobber.
                    let use_pmov = !first || sub.is_some();
                    let data = if use_pmov {
                        InstData::synth_guarded(
                            InstKind::PredMov {
                                dst: target_reg,
                                src: cond,
                            },
                            Guard::reg(guard),
                        )
                    } else {
                        InstData::synth(InstKind::PredAnd {
                            dst: target_reg,
                            lhs: Guard::reg(guard),
                            rhs: cond,
                        })
                    };
                    self.func.insert_inst(block, at, data);
                    self.stats.inserted_insts += 1;
                    at + 1
                }
            }
            Location::Slot(slot) => {
                let (word, bit) = self.frame.spill_word(slot);
                self.func.insert_inst(
                    block,
                    at,
                    InstData::synth(InstKind::LoadSlot { dst: scratch, slot: word }),
                );
                self.func.insert_inst(
                    block,
                    at + 1,
                    InstData::synth_guarded(
                        InstKind::BitCopy {
                            dst: scratch,
                            src: scratch,
                            bit,
                            cond,
                        },
                        Guard::reg(guard),
                    ),
                );
                self.func.insert_inst(
                    block,
                    at + 2,
                    InstData::synth(InstKind::StoreSlot { slot: word, src: scratch }),
                );
                self.stats.inserted_insts += 3;
                at + 3
            }
        }
    }
}

fn set_first(op: &mut DefOp, value: bool) {
    if let DefOp::Simple { first, .. } = op {
        *first = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc::RegAlloc, prepare::prepare_frame, MachineSpec, SinglePathStats};
    use singlepath_ir::{builder::FunctionBuilder, Definition, Gpr, InstId};

    const ALWAYS: Pred = Pred(0);
    const COND: PReg = PReg(8);

    fn def(pred: u32, guard: u32, cond: Guard) -> Definition {
        Definition {
            pred: Pred(pred),
            guard: Pred(guard),
            cond,
        }
    }

    fn run_instrument(
        func: &mut Function,
        tree: &ScopeTree,
        spec: &MachineSpec,
    ) -> (RegAlloc, FrameLayout, SinglePathStats) {
        let mut stats = SinglePathStats::default();
        let ra = RegAlloc::compute(func, tree, spec, &mut stats).unwrap();
        let frame = prepare_frame(func, tree, &ra);
        Instrumentor {
            func: &mut *func,
            tree,
            ra: &ra,
            spec,
            frame: &frame,
            stats: &mut stats,
        }
        .run()
        .unwrap();
        (ra, frame, stats)
    }

    fn kinds(func: &Function, block: BlockId) -> Vec<InstKind> {
        func.insts_of(block)
            .iter()
            .map(|inst| func.inst(*inst).kind.clone())
            .collect()
    }

    /// entry -> {then|else} -> join with payload instructions.
    fn diamond(with_call: bool) -> (Function, ScopeTree, [BlockId; 4], [InstId; 2]) {
        let mut builder = FunctionBuilder::new("diamond", FunctionKind::Root);
        let entry = builder.append_block();
        let then = builder.append_block();
        let els = builder.append_block();
        let join = builder.append_block();

        builder.switch_to_block(entry);
        let cmp = builder.inst(InstKind::Cmp {
            dst: COND,
            lhs: Gpr(1),
            rhs: Gpr(2),
        });
        builder.branch(Guard::reg(COND), then);
        builder.jump(els);

        builder.switch_to_block(then);
        let add = builder.inst(InstKind::Add {
            dst: Gpr(3),
            lhs: Gpr(1),
            rhs: Gpr(2),
        });
        let call = with_call.then(|| builder.call("callee"));
        builder.jump(join);

        builder.switch_to_block(els);
        builder.inst(InstKind::Mov {
            dst: Gpr(3),
            src: Gpr(1),
        });
        builder.jump(join);

        builder.switch_to_block(join);
        builder.ret();
        let func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        for block in [then, els, join] {
            tree.push_member(root, block);
        }
        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, then, &[Pred(1)]);
        tree.set_guards(root, els, &[Pred(2)]);
        tree.set_guards(root, join, &[Pred(3)]);
        tree.add_def(root, entry, def(1, 0, Guard::reg(COND)));
        tree.add_def(root, entry, def(2, 0, Guard::negated(COND)));
        tree.add_def(root, then, def(3, 1, Guard::reg(PReg::TRUE)));
        tree.add_def(root, els, def(3, 2, Guard::reg(PReg::TRUE)));
        tree.set_inst_pred(cmp, ALWAYS);
        tree.set_inst_pred(add, Pred(1));
        if let Some(call) = call {
            tree.set_inst_pred(call, Pred(1));
        }

        (func, tree, [entry, then, els, join], [cmp, add])
    }

    #[test]
    fn guards_rewritten_to_allocated_registers() {
        let (mut func, tree, [_, then, _, _], [cmp, add]) = diamond(false);
        let spec = MachineSpec::default();
        let (ra, _, _) = run_instrument(&mut func, &tree, &spec);

        let reg = ra.info(tree.root()).use_regs(then)[&Pred(1)];
        assert_eq!(func.inst(add).guard, Guard::reg(spec.preg(reg)));
        // The entry runs under the hard-wired true predicate.
        assert!(func.inst(cmp).guard.is_always());
    }

    #[test]
    fn first_definition_ands_later_definition_moves() {
        let (mut func, tree, [entry, _, els, _], _) = diamond(false);
        let spec = MachineSpec::default();
        let (ra, _, _) = run_instrument(&mut func, &tree, &spec);
        let info = ra.info(tree.root());

        // Both of the entry's definitions are first: unguarded and-defines
        // from the always-true guard.
        let entry_kinds = kinds(&func, entry);
        let ands: Vec<_> = entry_kinds
            .iter()
            .filter(|kind| matches!(kind, InstKind::PredAnd { .. }))
            .collect();
        assert_eq!(ands.len(), 2);

        // The else edge defines p3 second: a guarded move that must not
        // clobber the then edge's value.
        let els_guard = spec.preg(info.use_regs(els)[&Pred(2)]);
        let pmov = func
            .insts_of(els)
            .iter()
            .map(|inst| func.inst(*inst))
            .find(|data| matches!(data.kind, InstKind::PredMov { .. }))
            .expect("guarded move for the second definition");
        assert_eq!(pmov.guard, Guard::reg(els_guard));
    }

    #[test]
    fn call_routes_guard_through_temp_and_saves_scratch() {
        let (mut func, tree, [_, then, _, _], _) = diamond(true);
        let spec = MachineSpec::default();
        let (ra, frame, _) = run_instrument(&mut func, &tree, &spec);

        let save = frame.call_save_slot().expect("call save slot");
        let then_kinds = kinds(&func, then);
        let call_at = then_kinds
            .iter()
            .position(|kind| matches!(kind, InstKind::Call { .. }))
            .unwrap();

        let guard_reg = spec.preg(ra.info(tree.root()).use_regs(then)[&Pred(1)]);
        assert_eq!(
            then_kinds[call_at - 2],
            InstKind::PredMov {
                dst: spec.temp_preg(),
                src: Guard::reg(guard_reg),
            }
        );
        assert_eq!(
            then_kinds[call_at - 1],
            InstKind::StoreSlot {
                slot: save,
                src: spec.call_saved_gpr,
            }
        );
        assert_eq!(
            then_kinds[call_at + 1],
            InstKind::LoadSlot {
                dst: spec.call_saved_gpr,
                slot: save,
            }
        );
        // The call itself stays unguarded.
        let call = func.insts_of(then)[call_at];
        assert!(func.inst(call).guard.is_always());
    }

    #[test]
    fn finer_grained_guard_is_combined() {
        let (mut func, tree, [_, then, _, _], [_, add]) = diamond(false);
        // Pretend an earlier phase predicated the add on a condition
        // register of its own.
        func.inst_mut(add).guard = Guard::reg(PReg(9));
        let spec = MachineSpec::default();
        run_instrument(&mut func, &tree, &spec);

        assert_eq!(func.inst(add).guard, Guard::reg(spec.temp_preg()));
        let combined = kinds(&func, then)
            .into_iter()
            .filter(|kind| {
                matches!(
                    kind,
                    InstKind::PredAnd { dst, rhs, .. }
                        if *dst == spec.temp_preg() && *rhs == Guard::reg(PReg(9))
                )
            })
            .count();
        assert_eq!(combined, 1);
    }

    /// Register pressure: a slot-located definition writes its packed bit,
    /// the scope entry clears it first and the use reloads it.
    #[test]
    fn slot_definitions_round_trip_through_words() {
        let mut builder = FunctionBuilder::new("pressure", FunctionKind::Root);
        let entry = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        builder.switch_to_block(entry);
        builder.jump(b1);
        builder.switch_to_block(b1);
        builder.jump(b2);
        builder.switch_to_block(b2);
        builder.jump(b3);
        builder.switch_to_block(b3);
        builder.ret();
        let mut func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        for block in [b1, b2, b3] {
            tree.push_member(root, block);
        }
        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, b1, &[Pred(1)]);
        tree.set_guards(root, b2, &[Pred(2)]);
        tree.set_guards(root, b3, &[Pred(3)]);
        tree.add_def(root, entry, def(1, 0, Guard::reg(COND)));
        tree.add_def(root, entry, def(2, 0, Guard::negated(COND)));
        tree.add_def(root, entry, def(3, 0, Guard::reg(COND)));

        let spec = MachineSpec {
            num_pred_regs: 3,
            ..MachineSpec::default()
        };
        let (_, frame, _) = run_instrument(&mut func, &tree, &spec);
        let scratch = spec.scratch_gpr;
        let (word, bit) = frame.spill_word(0);

        let entry_kinds = kinds(&func, entry);
        // Scope entry clears the slot bit once.
        assert_eq!(
            entry_kinds[1],
            InstKind::AndImm {
                dst: scratch,
                src: scratch,
                imm: !(1 << bit),
            }
        );
        // The definition merges the single bit under its guard.
        assert!(entry_kinds.iter().any(|kind| matches!(
            kind,
            InstKind::BitCopy { dst, bit: b, .. } if *dst == scratch && *b == bit
        )));
        assert!(entry_kinds
            .iter()
            .any(|kind| *kind == InstKind::StoreSlot { slot: word, src: scratch }));

        // The slot-resident guard is materialized at the top of its use.
        let b3_kinds = kinds(&func, b3);
        assert_eq!(b3_kinds[0], InstKind::LoadSlot { dst: scratch, slot: word });
        assert!(matches!(
            b3_kinds[1],
            InstKind::BitTest { src, bit: b, .. } if src == scratch && b == bit
        ));
    }

    /// Mutually exclusive redefinitions targeting each other's registers
    /// lower as the three-step exchange, with no extra temporary.
    #[test]
    fn exchange_pair_lowers_as_xor_swap() {
        let mut builder = FunctionBuilder::new("swap", FunctionKind::Root);
        let entry = builder.append_block();
        let header = builder.append_block();
        let m = builder.append_block();
        let a = builder.append_block();
        let b = builder.append_block();
        builder.switch_to_block(entry);
        builder.jump(header);
        builder.switch_to_block(header);
        builder.jump(m);
        builder.switch_to_block(m);
        builder.jump(a);
        builder.switch_to_block(a);
        builder.jump(b);
        builder.switch_to_block(b);
        builder.jump(header);
        let mut func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        let lp = tree.make_scope(root, header, Some(4));
        for block in [m, a, b] {
            tree.push_member(lp, block);
        }
        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, header, &[Pred(4)]);
        tree.add_def(root, entry, def(4, 0, Guard::reg(COND)));

        tree.set_guards(lp, header, &[Pred(4)]);
        tree.set_guards(lp, m, &[Pred(1), Pred(2)]);
        tree.set_guards(lp, a, &[Pred(1)]);
        tree.set_guards(lp, b, &[Pred(2)]);
        tree.add_def(lp, header, def(1, 4, Guard::reg(COND)));
        tree.add_def(lp, header, def(2, 4, Guard::negated(COND)));
        // State flip: each predicate redefined under the other's guard from
        // complementary conditions.
        tree.add_def(lp, m, def(1, 2, Guard::reg(PReg(9))));
        tree.add_def(lp, m, def(2, 1, Guard::negated(PReg(9))));

        let spec = MachineSpec {
            num_pred_regs: 4,
            ..MachineSpec::default()
        };
        let (_, _, _) = run_instrument(&mut func, &tree, &spec);

        let m_kinds = kinds(&func, m);
        let xors: Vec<_> = m_kinds
            .iter()
            .filter(|kind| matches!(kind, InstKind::PredXor { .. }))
            .collect();
        assert_eq!(xors.len(), 3);

        // Each register guards its own definition after the exchange.
        let self_guarded = func
            .insts_of(m)
            .iter()
            .map(|inst| func.inst(*inst))
            .filter(|data| {
                matches!(data.kind, InstKind::PredAnd { dst, lhs, .. }
                    if lhs == Guard::reg(dst))
            })
            .count();
        assert_eq!(self_guarded, 2);

        // The reserved temporary is never involved.
        let temp = spec.temp_preg();
        for inst in func.insts_of(m) {
            let data = func.inst(*inst);
            assert_ne!(data.guard.preg, temp);
            assert!(!matches!(
                data.kind,
                InstKind::PredMov { dst, .. } | InstKind::PredAnd { dst, .. } | InstKind::PredXor { dst, .. }
                    if dst == temp
            ));
        }
    }

    /// A reachable function picks up its entry guard from the caller.
    #[test]
    fn reachable_function_receives_caller_guard() {
        let mut builder = FunctionBuilder::new("reach", FunctionKind::Reachable);
        let entry = builder.append_block();
        builder.switch_to_block(entry);
        builder.ret();
        let mut func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        tree.set_guards(root, entry, &[Pred(0)]);

        let spec = MachineSpec::default();
        let (ra, _, _) = run_instrument(&mut func, &tree, &spec);

        let reg = spec.preg(ra.info(root).use_regs(entry)[&Pred(0)]);
        let first = func.inst(func.insts_of(entry)[0]);
        assert_eq!(
            first.kind,
            InstKind::PredMov {
                dst: reg,
                src: Guard::reg(spec.temp_preg()),
            }
        );
    }

    /// A loop-exit definition on a subheader whose loop saves the register
    /// file is written into the saved word, so the postloop restore cannot
    /// clobber it.
    #[test]
    fn loop_exit_definition_targets_saved_file() {
        let mut builder = FunctionBuilder::new("exitdef", FunctionKind::Root);
        let entry = builder.append_block();
        let header = builder.append_block();
        let body = builder.append_block();
        let after = builder.append_block();
        builder.switch_to_block(entry);
        builder.jump(header);
        builder.switch_to_block(header);
        builder.branch(Guard::reg(COND), body);
        builder.jump(after);
        builder.switch_to_block(body);
        builder.jump(header);
        builder.switch_to_block(after);
        builder.ret();
        let mut func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        let lp = tree.make_scope(root, header, Some(3));
        tree.push_member(lp, body);
        tree.push_member(root, after);

        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, header, &[Pred(4)]);
        tree.set_guards(root, after, &[Pred(5)]);
        tree.add_def(root, entry, def(4, 0, Guard::reg(COND)));
        // Exit edge: taken when the loop condition fails.
        tree.add_def(root, header, def(5, 4, Guard::negated(COND)));

        tree.set_guards(lp, header, &[Pred(4)]);
        tree.set_guards(lp, body, &[Pred(6)]);
        tree.add_def(lp, header, def(6, 4, Guard::reg(COND)));

        // Budget 2: 1 (parent) + 2 (loop) exceeds it, forcing the save.
        let spec = MachineSpec {
            num_pred_regs: 3,
            ..MachineSpec::default()
        };
        let (ra, frame, _) = run_instrument(&mut func, &tree, &spec);
        assert!(ra.info(lp).needs_file_save());

        let save = frame.file_save_slot(1);
        let target = spec.preg(
            match ra.info(root).def_loc(Pred(5)).unwrap() {
                crate::alloc::Location::Reg(reg) => reg,
                other => panic!("expected register target, got {other}"),
            },
        );
        let guard_reg = spec.preg(ra.info(lp).use_regs(header)[&Pred(4)]);

        let header_insts: Vec<&InstData> = func
            .insts_of(header)
            .iter()
            .map(|inst| func.inst(*inst))
            .collect();
        let bitcopy_at = header_insts
            .iter()
            .position(|data| {
                matches!(data.kind, InstKind::BitCopy { bit, .. }
                    if bit == u32::from(target.0))
            })
            .expect("exit definition writes the saved file word");
        assert_eq!(header_insts[bitcopy_at].guard, Guard::reg(guard_reg));
        assert_eq!(
            header_insts[bitcopy_at - 1].kind,
            InstKind::LoadSlot {
                dst: spec.scratch_gpr,
                slot: save,
            }
        );
        assert_eq!(
            header_insts[bitcopy_at + 1].kind,
            InstKind::StoreSlot {
                slot: save,
                src: spec.scratch_gpr,
            }
        );
    }
}

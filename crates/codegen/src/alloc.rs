//! Predicate register allocation.
//!
//! Each scope gets an [`RAInfo`] assigning every logical predicate a
//! location (register or spill slot) at each definition and use point. The
//! assignment is a single forward scan over the scope's topologically
//! ordered member blocks; because the whole future use sequence is known,
//! eviction picks the register whose next use is furthest away, which is
//! offline-optimal rather than a heuristic.
//!
//! Location indices are scope-local during assignment. Two tree passes then
//! unify them function-wide: a post-order pass accumulates the maximum
//! location count of any child, and a pre-order pass offsets register
//! indices by the parent's live count and spill-slot indices by the slots
//! committed by previously visited scopes, so no two live scopes alias.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rustc_hash::FxHashMap;
use singlepath_ir::{BlockId, Function, FunctionKind, Pred, ScopeId, ScopeTree};

use crate::{error::ConvertError, liverange::LiveRange, MachineSpec, SinglePathStats};

/// A predicate location: an allocatable register or a spill-slot bit.
///
/// The derived order sorts all registers before all slots, so the first
/// element of a free pool is a register whenever one is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Location {
    Reg(u32),
    Slot(u32),
}

impl Location {
    pub fn is_reg(self) -> bool {
        matches!(self, Self::Reg(_))
    }

    pub fn is_slot(self) -> bool {
        matches!(self, Self::Slot(_))
    }

    pub fn index(self) -> u32 {
        match self {
            Self::Reg(idx) | Self::Slot(idx) => idx,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(idx) => write!(f, "reg{idx}"),
            Self::Slot(idx) => write!(f, "spill{idx}"),
        }
    }
}

/// Where a block finds one of its guard predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseLoc {
    /// Register location holding the predicate while the block executes.
    pub reg: u32,

    /// Location to materialize the predicate from before the block runs.
    pub load: Option<Location>,

    /// Spill slot that must receive the register's previous content (an
    /// evicted predicate) before the load overwrites it.
    pub spill: Option<u32>,
}

impl UseLoc {
    fn new(reg: u32) -> Self {
        Self {
            reg,
            load: None,
            spill: None,
        }
    }
}

/// Per-scope allocation result. Computed once, then read-only.
#[derive(Debug, Clone)]
pub struct RAInfo {
    scope: ScopeId,

    /// Register budget, excluding the reserved temporary.
    max_regs: u32,

    /// Scope is the top level of a single-path entry function; its header
    /// predicate is the hard-wired true predicate and is never allocated.
    root_top_level: bool,

    live: BTreeMap<Pred, LiveRange>,
    def_locs: BTreeMap<Pred, Location>,
    use_locs: FxHashMap<BlockId, BTreeMap<Pred, UseLoc>>,
    pos: FxHashMap<BlockId, usize>,

    /// Total number of locations this scope created.
    num_locs: u32,

    /// Maximum number of locations used by any single child subtree.
    children_max_cum_locs: u32,

    /// First register index this scope may use; lower ones belong to
    /// ancestors.
    first_reg: u32,

    /// First spill-slot index this scope may use.
    first_slot: u32,

    /// Whether the live predicate-register file must be saved across the
    /// loop back-edge.
    needs_file_save: bool,
}

impl RAInfo {
    fn new(scope: ScopeId, max_regs: u32, root_top_level: bool) -> Self {
        Self {
            scope,
            max_regs,
            root_top_level,
            live: BTreeMap::new(),
            def_locs: BTreeMap::new(),
            use_locs: FxHashMap::default(),
            pos: FxHashMap::default(),
            num_locs: 0,
            children_max_cum_locs: 0,
            first_reg: 0,
            first_slot: 0,
            needs_file_save: true,
        }
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn needs_file_save(&self) -> bool {
        self.needs_file_save
    }

    /// Locations used by this scope and any of its children.
    pub fn cum_locs(&self) -> u32 {
        self.num_locs + self.children_max_cum_locs
    }

    /// Spill slots this scope requires beyond the register budget.
    pub fn needed_spill_slots(&self) -> u32 {
        self.num_locs.saturating_sub(self.max_regs)
    }

    pub fn pred_count(&self) -> usize {
        self.live.len()
    }

    /// Unified register indices of the guard predicates of `block`.
    pub fn use_regs(&self, block: BlockId) -> BTreeMap<Pred, u32> {
        let mut result = BTreeMap::new();
        if let Some(uls) = self.use_locs.get(&block) {
            for (pred, ul) in uls {
                let reg = self.unify_reg(ul.reg);
                debug_assert!(reg < self.max_regs);
                result.insert(*pred, reg);
            }
        }
        result
    }

    /// Unified locations the guard predicates of `block` must be
    /// materialized from before it executes.
    pub fn load_locs(&self, block: BlockId) -> BTreeMap<Pred, Location> {
        let mut result = BTreeMap::new();
        if let Some(uls) = self.use_locs.get(&block) {
            for (pred, ul) in uls {
                if let Some(loc) = ul.load {
                    result.insert(*pred, self.unify_loc(loc));
                }
            }
        }
        result
    }

    /// Unified spill slots that must receive evicted register contents
    /// before the loads of `block`.
    pub fn spill_locs(&self, block: BlockId) -> BTreeMap<Pred, u32> {
        let mut result = BTreeMap::new();
        if let Some(uls) = self.use_locs.get(&block) {
            for (pred, ul) in uls {
                if let Some(slot) = ul.spill {
                    result.insert(*pred, self.unify_slot(slot));
                }
            }
        }
        result
    }

    /// The unified definition location of `pred`.
    pub fn def_loc(&self, pred: Pred) -> Option<Location> {
        self.def_locs.get(&pred).map(|loc| self.unify_loc(*loc))
    }

    /// Whether `block` holds the first definition of `pred` in this scope.
    pub fn is_first_def(&self, block: BlockId, pred: Pred) -> bool {
        match (self.pos.get(&block), self.live.get(&pred)) {
            (Some(pos), Some(lr)) => !lr.has_def_before(*pos),
            _ => false,
        }
    }

    /// Whether any guard predicate of `block` needs spill or reload code.
    pub fn has_spill_load(&self, block: BlockId) -> bool {
        self.use_locs
            .get(&block)
            .map(|uls| {
                uls.values()
                    .any(|ul| ul.load.is_some() || ul.spill.is_some())
            })
            .unwrap_or(false)
    }

    fn unify_reg(&self, idx: u32) -> u32 {
        // The parent spills the file whenever the sum would not fit, so the
        // offset index stays within the register budget.
        idx + self.first_reg
    }

    fn unify_slot(&self, idx: u32) -> u32 {
        idx + self.first_slot
    }

    fn unify_loc(&self, loc: Location) -> Location {
        match loc {
            Location::Reg(idx) => Location::Reg(self.unify_reg(idx)),
            Location::Slot(idx) => Location::Slot(self.unify_slot(idx)),
        }
    }

    fn lr_mut(&mut self, pred: Pred, num_blocks: usize) -> &mut LiveRange {
        self.live
            .entry(pred)
            .or_insert_with(|| LiveRange::new(num_blocks))
    }

    fn create_live_ranges(&mut self, tree: &ScopeTree) {
        let blocks = tree.blocks(self.scope).to_vec();
        let n = blocks.len();

        for (i, block) in blocks.iter().enumerate() {
            self.pos.insert(*block, i);
            for pred in tree.guards(self.scope, *block) {
                self.lr_mut(*pred, n).add_use(i);
            }
            for def in tree.defs(self.scope, *block) {
                self.lr_mut(def.pred, n).add_def(i);
            }
        }

        // The header predicate stays live across the back-edge: give it a
        // use at the virtual loop-repeat position.
        if !tree.is_top_level(self.scope) {
            for pred in tree.guards(self.scope, blocks[0]).to_vec() {
                self.lr_mut(pred, n).add_use(n);
            }
        }
    }

    /// Returns the first available location, preferring registers, creating
    /// a new one if the pool is empty.
    fn get_avail_loc(&mut self, free: &mut BTreeSet<Location>) -> Location {
        if let Some(loc) = free.pop_first() {
            return loc;
        }
        let idx = self.num_locs;
        self.num_locs += 1;
        if idx < self.max_regs {
            Location::Reg(idx)
        } else {
            Location::Slot(idx - self.max_regs)
        }
    }

    /// Whether the next [`Self::get_avail_loc`] call yields a register.
    fn has_free_register(&self, free: &BTreeSet<Location>) -> bool {
        matches!(free.first(), Some(Location::Reg(_))) || self.num_locs < self.max_regs
    }

    /// Sorts predicates so the one with the nearest next use from `pos`
    /// comes first.
    fn sort_nearest_use_first(&self, pos: usize, order: &mut [Pred]) {
        order.sort_by(|a, b| {
            let (lra, lrb) = (&self.live[a], &self.live[b]);
            if lra.next_use_before(pos, lrb) {
                std::cmp::Ordering::Less
            } else if lrb.next_use_before(pos, lra) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
    }

    /// Materializes a slot-resident predicate into a register for a use at
    /// position `pos`, evicting the register with the furthest next use if
    /// none is free. Returns the use record and the predicate's new
    /// register location.
    fn materialize(
        &mut self,
        pos: usize,
        slot: u32,
        cur: &mut BTreeMap<Pred, Location>,
        free: &mut BTreeSet<Location>,
    ) -> (UseLoc, Location) {
        if self.has_free_register(free) {
            let loc = self.get_avail_loc(free);
            debug_assert!(loc.is_reg());
            let mut ul = UseLoc::new(loc.index());
            ul.load = Some(Location::Slot(slot));
            return (ul, loc);
        }

        // All registers are occupied: evict the one whose next use is
        // furthest away.
        let mut order: Vec<Pred> = cur
            .iter()
            .filter(|&(pred, loc)| self.live.contains_key(pred) && loc.is_reg())
            .map(|(pred, _)| *pred)
            .collect();
        self.sort_nearest_use_first(pos, &mut order);
        let victim = *order.last().expect("a register-resident predicate");

        let new_slot = self.get_avail_loc(free);
        debug_assert!(new_slot.is_slot());

        let victim_loc = cur[&victim];
        debug_assert!(victim_loc.is_reg());

        let mut ul = UseLoc::new(victim_loc.index());
        ul.load = Some(Location::Slot(slot));

        if self.live[&victim].has_use_through(pos) {
            // The victim's value is live in the register: spill it.
            ul.spill = Some(new_slot.index());
        } else {
            // Never used since its definition: redirect the definition to
            // the slot instead of emitting spill code.
            self.def_locs.insert(victim, new_slot);
        }

        cur.insert(victim, new_slot);
        (ul, victim_loc)
    }

    fn handle_uses(
        &mut self,
        func: &Function,
        tree: &ScopeTree,
        pos: usize,
        block: BlockId,
        cur: &mut BTreeMap<Pred, Location>,
        free: &mut BTreeSet<Location>,
    ) -> Result<(), ConvertError> {
        let header_pred = tree.header_pred(self.scope);
        let is_header = tree.is_header(self.scope, block);
        let guards = tree.guards(self.scope, block).to_vec();

        for pred in &guards {
            if self.root_top_level && Some(*pred) == header_pred {
                // The entry of a single-path root runs under the hard-wired
                // true predicate.
                continue;
            }

            let ul = if is_header {
                debug_assert_eq!(guards.len(), 1);
                // The header predicate's initial value arrives from the
                // parent scope; its use location doubles as its definition
                // location.
                let loc = self.get_avail_loc(free);
                debug_assert_eq!(loc, Location::Reg(0));
                cur.insert(*pred, loc);
                self.def_locs.insert(*pred, loc);
                UseLoc::new(loc.index())
            } else {
                let cur_loc = *cur.get(pred).ok_or_else(|| ConvertError::UndefinedPredicate {
                    func: func.name.clone(),
                    pred: *pred,
                    block,
                })?;
                match cur_loc {
                    Location::Reg(reg) => UseLoc::new(reg),
                    Location::Slot(slot) => {
                        let (ul, new_loc) = self.materialize(pos, slot, cur, free);
                        cur.insert(*pred, new_loc);
                        ul
                    }
                }
            };

            let prev = self.use_locs.entry(block).or_default().insert(*pred, ul);
            debug_assert!(prev.is_none());
        }

        // Retire predicates past their last use.
        for pred in &guards {
            if self.root_top_level && Some(*pred) == header_pred {
                continue;
            }
            if self.live[pred].is_last_use(pos) {
                let loc = cur.remove(pred).expect("retired predicate had a location");
                debug_assert!(!free.contains(&loc));
                free.insert(loc);
            }
        }

        Ok(())
    }

    fn assign(&mut self, func: &Function, tree: &ScopeTree) -> Result<(), ConvertError> {
        let blocks = tree.blocks(self.scope).to_vec();
        let mut cur: BTreeMap<Pred, Location> = BTreeMap::new();
        let mut free: BTreeSet<Location> = BTreeSet::new();

        for (i, block) in blocks.iter().enumerate() {
            self.handle_uses(func, tree, i, *block, &mut cur, &mut free)?;

            let mut order: Vec<Pred> = Vec::new();
            for def in tree.defs(self.scope, *block) {
                if !cur.contains_key(&def.pred) && !order.contains(&def.pred) {
                    order.push(def.pred);
                }
            }
            self.sort_nearest_use_first(i, &mut order);

            // Nearest use first, so it gets register preference.
            for pred in order {
                let loc = self.get_avail_loc(&mut free);
                cur.insert(pred, loc);
                self.def_locs.insert(pred, loc);
            }
        }

        // Record where the next iteration finds the header predicate: if
        // its location at scope end differs from its use location at entry,
        // the latch must reload it before branching back.
        if !tree.is_top_level(self.scope) {
            let header = blocks[0];
            for pred in tree.guards(self.scope, header).to_vec() {
                let end_loc = cur[&pred];
                let ul = self
                    .use_locs
                    .get_mut(&header)
                    .and_then(|uls| uls.get_mut(&pred))
                    .expect("header predicate has a use location");
                if end_loc != Location::Reg(ul.reg) {
                    ul.load = Some(end_loc);
                }
            }
        }

        Ok(())
    }

    fn unify_with_child(&mut self, child_cum_locs: u32) {
        self.children_max_cum_locs = self.children_max_cum_locs.max(child_cum_locs);
    }

    fn unify_with_parent(&mut self, parent_num_locs: u32, parent_first_reg: u32, spill_cnt: u32) {
        // The file save can be skipped when the parent's live locations,
        // this scope's and the largest child's all fit in the registers.
        if parent_num_locs + self.cum_locs() <= self.max_regs {
            self.first_reg = parent_first_reg + parent_num_locs;
            self.needs_file_save = false;
        }
        if self.num_locs > self.max_regs {
            self.first_slot = spill_cnt;
        }
    }
}

/// Allocation results for every scope of a function.
#[derive(Debug)]
pub struct RegAlloc {
    infos: FxHashMap<ScopeId, RAInfo>,
}

impl RegAlloc {
    /// Computes the allocation for the whole scope tree: per-scope
    /// assignment in post-order, then offset unification in pre-order.
    pub fn compute(
        func: &Function,
        tree: &ScopeTree,
        spec: &MachineSpec,
        stats: &mut SinglePathStats,
    ) -> Result<Self, ConvertError> {
        let budget = spec.alloc_regs();
        let mut infos: FxHashMap<ScopeId, RAInfo> = FxHashMap::default();

        for scope in tree.post_order() {
            let root_top_level = tree.is_top_level(scope) && func.kind == FunctionKind::Root;
            let mut info = RAInfo::new(scope, budget, root_top_level);
            info.create_live_ranges(tree);
            info.assign(func, tree)?;
            stats.num_predicates += tree.pred_count(scope) as u32;

            // Post-order: all children are already computed.
            for child in tree.children(scope) {
                let child_cum = infos[child].cum_locs();
                info.unify_with_child(child_cum);
            }
            infos.insert(scope, info);
        }

        let mut spill_cnt = 0;
        for scope in tree.pre_order() {
            if let Some(parent) = tree.parent(scope) {
                let (parent_num_locs, parent_first_reg) = {
                    let parent = &infos[&parent];
                    (parent.num_locs, parent.first_reg)
                };
                let info = infos.get_mut(&scope).unwrap();
                info.unify_with_parent(parent_num_locs, parent_first_reg, spill_cnt);
                if !info.needs_file_save {
                    stats.no_spill_scopes += 1;
                }
            }
            spill_cnt += infos[&scope].needed_spill_slots();
        }
        stats.spill_slots += spill_cnt;

        Ok(Self { infos })
    }

    pub fn info(&self, scope: ScopeId) -> &RAInfo {
        &self.infos[&scope]
    }
}

/// Pretty printer for one scope's allocation.
pub struct DisplayRaInfo<'a> {
    info: &'a RAInfo,
    tree: &'a ScopeTree,
}

impl<'a> DisplayRaInfo<'a> {
    pub fn new(info: &'a RAInfo, tree: &'a ScopeTree) -> Self {
        Self { info, tree }
    }
}

impl fmt::Display for DisplayRaInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { info, tree } = self;
        writeln!(
            f,
            "[{}] depth={}",
            tree.header(info.scope),
            tree.depth(info.scope)
        )?;
        for (pred, lr) in &info.live {
            writeln!(f, "  range({pred}) = [{lr}]")?;
        }
        for block in tree.blocks(info.scope) {
            write!(f, "  {block}:")?;
            if let Some(uls) = info.use_locs.get(block) {
                for (pred, ul) in uls {
                    write!(f, " {pred}=reg{}", ul.reg)?;
                    if let Some(load) = ul.load {
                        write!(f, " load<-{load}")?;
                    }
                    if let Some(spill) = ul.spill {
                        write!(f, " spill->spill{spill}")?;
                    }
                }
            }
            writeln!(f)?;
        }
        write!(f, "  deflocs:")?;
        for (pred, loc) in &info.def_locs {
            write!(f, " {pred}={loc}")?;
        }
        writeln!(f)?;
        writeln!(f, "  locs: {} (cum {})", info.num_locs, info.cum_locs())?;
        writeln!(
            f,
            "  offsets: reg {} spill {}",
            info.first_reg, info.first_slot
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use singlepath_ir::{
        builder::FunctionBuilder, Definition, FunctionKind, Guard, InstKind, PReg,
    };

    const ALWAYS: Pred = Pred(0);
    const COND: PReg = PReg(8);

    fn spec(num_pred_regs: u32) -> MachineSpec {
        MachineSpec {
            num_pred_regs,
            ..MachineSpec::default()
        }
    }

    fn def(pred: u32, guard: Pred, cond: Guard) -> Definition {
        Definition {
            pred: Pred(pred),
            guard,
            cond,
        }
    }

    /// entry -> {then|else} -> join, all in the root scope.
    fn diamond() -> (Function, ScopeTree) {
        let mut builder = FunctionBuilder::new("diamond", FunctionKind::Root);
        let entry = builder.append_block();
        let then = builder.append_block();
        let els = builder.append_block();
        let join = builder.append_block();

        builder.switch_to_block(entry);
        builder.branch(Guard::reg(COND), then);
        builder.jump(els);
        builder.switch_to_block(then);
        builder.jump(join);
        builder.switch_to_block(els);
        builder.jump(join);
        builder.switch_to_block(join);
        builder.ret();
        let func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        tree.push_member(root, then);
        tree.push_member(root, els);
        tree.push_member(root, join);
        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, then, &[Pred(1)]);
        tree.set_guards(root, els, &[Pred(2)]);
        tree.set_guards(root, join, &[Pred(3)]);
        tree.add_def(root, entry, def(1, ALWAYS, Guard::reg(COND)));
        tree.add_def(root, entry, def(2, ALWAYS, Guard::negated(COND)));
        tree.add_def(root, then, def(3, Pred(1), Guard::reg(PReg::TRUE)));
        tree.add_def(root, els, def(3, Pred(2), Guard::reg(PReg::TRUE)));
        (func, tree)
    }

    #[test]
    fn diamond_fits_in_registers() {
        let (func, tree) = diamond();
        let mut stats = SinglePathStats::default();
        let ra = RegAlloc::compute(&func, &tree, &spec(4), &mut stats).unwrap();

        let info = ra.info(tree.root());
        assert_eq!(info.needed_spill_slots(), 0);
        // p0 (always) is never allocated.
        assert!(info.def_loc(ALWAYS).is_none());
        for pred in [Pred(1), Pred(2), Pred(3)] {
            assert!(info.def_loc(pred).unwrap().is_reg());
        }
        // The scope's predicate count includes the never-allocated always
        // predicate guarding the entry.
        assert_eq!(stats.num_predicates, 4);
        assert_eq!(stats.spill_slots, 0);
    }

    #[test]
    fn undefined_predicate_is_fatal() {
        let mut builder = FunctionBuilder::new("broken", FunctionKind::Root);
        let entry = builder.append_block();
        let next = builder.append_block();
        builder.switch_to_block(entry);
        builder.jump(next);
        builder.switch_to_block(next);
        builder.ret();
        let func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        tree.push_member(root, next);
        // Pred(5) guards `next` but nothing defines it.
        tree.set_guards(root, next, &[Pred(5)]);

        let mut stats = SinglePathStats::default();
        let err = RegAlloc::compute(&func, &tree, &spec(4), &mut stats).unwrap_err();
        assert_eq!(
            err,
            ConvertError::UndefinedPredicate {
                func: "broken".to_string(),
                pred: Pred(5),
                block: next,
            }
        );
    }

    /// Register pressure forcing a definition into a slot, then a reload.
    #[test]
    fn spills_past_budget_and_reloads() {
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
        let func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        for block in [b1, b2, b3] {
            tree.push_member(root, block);
        }
        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, b1, &[Pred(1)]);
        tree.set_guards(root, b2, &[Pred(2)]);
        tree.set_guards(root, b3, &[Pred(3)]);
        for (pred, neg) in [(1, false), (2, true), (3, false)] {
            let cond = if neg {
                Guard::negated(COND)
            } else {
                Guard::reg(COND)
            };
            tree.add_def(root, entry, def(pred, ALWAYS, cond));
        }

        // Budget of 2 allocatable registers (3 minus the temporary).
        let mut stats = SinglePathStats::default();
        let ra = RegAlloc::compute(&func, &tree, &spec(3), &mut stats).unwrap();
        let info = ra.info(root);

        // Nearest-first: p1 and p2 get the registers, p3 starts in a slot.
        assert_eq!(info.def_loc(Pred(1)), Some(Location::Reg(0)));
        assert_eq!(info.def_loc(Pred(2)), Some(Location::Reg(1)));
        assert_eq!(info.def_loc(Pred(3)), Some(Location::Slot(0)));
        assert_eq!(info.needed_spill_slots(), 1);

        // By b3 both registers have retired, so p3 reloads into a free one.
        let uls = info.use_regs(b3);
        assert_eq!(uls[&Pred(3)], 0);
        assert_eq!(info.load_locs(b3)[&Pred(3)], Location::Slot(0));
        assert!(info.spill_locs(b3).is_empty());
        assert!(info.has_spill_load(b3));
    }

    /// An eviction of a never-used predicate redirects its definition
    /// instead of emitting spill code.
    #[test]
    fn store_forwarding_redirects_definition() {
        let mut builder = FunctionBuilder::new("fwd", FunctionKind::Root);
        let entry = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let b4 = builder.append_block();
        builder.switch_to_block(entry);
        builder.jump(b1);
        builder.switch_to_block(b1);
        builder.jump(b2);
        builder.switch_to_block(b2);
        builder.jump(b3);
        builder.switch_to_block(b3);
        builder.jump(b4);
        builder.switch_to_block(b4);
        builder.ret();
        let func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        for block in [b1, b2, b3, b4] {
            tree.push_member(root, block);
        }
        tree.set_guards(root, entry, &[ALWAYS]);
        // p1 used at positions 1 and 3; p2 only at position 4; p3 defined in
        // b1 and used at position 2.
        tree.set_guards(root, b1, &[Pred(1)]);
        tree.set_guards(root, b2, &[Pred(3)]);
        tree.set_guards(root, b3, &[Pred(1)]);
        tree.set_guards(root, b4, &[Pred(2)]);
        tree.add_def(root, entry, def(1, ALWAYS, Guard::reg(COND)));
        tree.add_def(root, entry, def(2, ALWAYS, Guard::negated(COND)));
        tree.add_def(root, b1, def(3, Pred(1), Guard::reg(COND)));

        let mut stats = SinglePathStats::default();
        let ra = RegAlloc::compute(&func, &tree, &spec(3), &mut stats).unwrap();
        let info = ra.info(root);

        // p3's use in b2 evicts p2, which was never read: its definition is
        // redirected to the fresh slot and no spill is recorded.
        assert_eq!(info.def_loc(Pred(2)), Some(Location::Slot(1)));
        let uls = info.use_locs[&b2].clone();
        let ul = uls[&Pred(3)];
        assert_eq!(ul.load, Some(Location::Slot(0)));
        assert_eq!(ul.spill, None);

        // p2's later use reloads from the redirected slot.
        assert_eq!(info.load_locs(b4)[&Pred(2)], Location::Slot(1));
    }

    fn def4(pred: u32, guard: u32, cond: Guard) -> Definition {
        Definition {
            pred: Pred(pred),
            guard: Pred(guard),
            cond,
        }
    }

    fn loop_tree(
        bound: Option<u32>,
    ) -> (Function, ScopeTree, ScopeId) {
        let mut builder = FunctionBuilder::new("looped", FunctionKind::Root);
        let entry = builder.append_block();
        let header = builder.append_block();
        let then = builder.append_block();
        let els = builder.append_block();
        let exit = builder.append_block();

        builder.switch_to_block(entry);
        builder.jump(header);
        builder.switch_to_block(header);
        builder.inst(InstKind::Cmp {
            dst: COND,
            lhs: singlepath_ir::Gpr(1),
            rhs: singlepath_ir::Gpr(2),
        });
        builder.branch(Guard::reg(COND), then);
        builder.jump(els);
        builder.switch_to_block(then);
        builder.jump(header);
        builder.switch_to_block(els);
        builder.jump(header);
        builder.switch_to_block(exit);
        builder.ret();
        let func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        let lp = tree.make_scope(root, header, bound);
        tree.push_member(lp, then);
        tree.push_member(lp, els);
        tree.push_member(root, exit);

        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, header, &[Pred(4)]);
        tree.set_guards(root, exit, &[ALWAYS]);
        tree.add_def(root, entry, def(4, ALWAYS, Guard::reg(PReg::TRUE)));

        tree.set_guards(lp, header, &[Pred(4)]);
        tree.set_guards(lp, then, &[Pred(1)]);
        tree.set_guards(lp, els, &[Pred(2)]);
        tree.add_def(lp, header, def4(1, 4, Guard::reg(COND)));
        tree.add_def(lp, header, def4(2, 4, Guard::negated(COND)));
        (func, tree, lp)
    }

    /// Two-predicate if/else inside a loop, budget 3: everything stays in
    /// registers and the loop needs no file save.
    #[test]
    fn loop_if_else_fits_without_spills() {
        let (func, tree, lp) = loop_tree(Some(4));
        let mut stats = SinglePathStats::default();
        // 4 predicate registers: 3 allocatable + 1 temporary.
        let ra = RegAlloc::compute(&func, &tree, &spec(4), &mut stats).unwrap();

        let info = ra.info(lp);
        assert_eq!(info.needed_spill_slots(), 0);
        assert_eq!(info.def_loc(Pred(4)), Some(Location::Reg(0)));
        assert!(info.def_loc(Pred(1)).unwrap().is_reg());
        assert!(info.def_loc(Pred(2)).unwrap().is_reg());

        // Root holds one location (p4), the loop three; 1 + 3 > 3 means the
        // loop must save the file.
        assert!(info.needs_file_save());
        assert_eq!(stats.spill_slots, 0);
    }

    /// A loop with no definitions of its own requires no spill slots and no
    /// file save when everything fits.
    #[test]
    fn empty_loop_skips_file_save() {
        let mut builder = FunctionBuilder::new("empty", FunctionKind::Root);
        let entry = builder.append_block();
        let header = builder.append_block();
        let exit = builder.append_block();
        builder.switch_to_block(entry);
        builder.jump(header);
        builder.switch_to_block(header);
        builder.jump(header);
        builder.switch_to_block(exit);
        builder.ret();
        let func = builder.build();

        let mut tree = ScopeTree::new(entry);
        let root = tree.root();
        let lp = tree.make_scope(root, header, Some(8));
        tree.push_member(root, exit);
        tree.set_guards(root, entry, &[ALWAYS]);
        tree.set_guards(root, header, &[Pred(1)]);
        tree.add_def(root, entry, def(1, ALWAYS, Guard::reg(PReg::TRUE)));
        tree.set_guards(lp, header, &[Pred(1)]);

        let mut stats = SinglePathStats::default();
        let ra = RegAlloc::compute(&func, &tree, &spec(4), &mut stats).unwrap();
        let info = ra.info(lp);

        assert_eq!(info.needed_spill_slots(), 0);
        assert!(!info.needs_file_save());
        assert_eq!(stats.no_spill_scopes, 1);
    }

    /// Register indices of a no-save child are offset past the parent's.
    #[test]
    fn unification_offsets_child_registers() {
        let (func, tree, lp) = loop_tree(Some(4));
        let mut stats = SinglePathStats::default();
        // Budget of 5 allocatable registers: 1 (parent) + 3 (loop) fits.
        let ra = RegAlloc::compute(&func, &tree, &spec(6), &mut stats).unwrap();

        let root_info = ra.info(tree.root());
        let info = ra.info(lp);
        assert!(!info.needs_file_save());

        let root_regs = root_info.use_regs(tree.header(lp));
        let loop_regs = info.use_regs(tree.header(lp));
        // The loop's copy of the header predicate lives above the parent's
        // allocation, so the two never alias.
        assert_eq!(root_regs[&Pred(4)], 0);
        assert_eq!(loop_regs[&Pred(4)], 1);
    }

    /// No two simultaneously live predicates of a scope share a register,
    /// and the budget is never exceeded.
    #[test]
    fn audit_capacity_and_uniqueness() {
        let (func, tree, lp) = loop_tree(Some(4));
        let mut stats = SinglePathStats::default();
        let ra = RegAlloc::compute(&func, &tree, &spec(4), &mut stats).unwrap();

        for scope in tree.pre_order() {
            let info = ra.info(scope);
            for block in tree.blocks(scope) {
                let regs: Vec<u32> = info.use_regs(*block).values().copied().collect();
                let mut unique = regs.clone();
                unique.sort_unstable();
                unique.dedup();
                assert_eq!(regs.len(), unique.len(), "register aliasing in {block}");
                assert!(regs.iter().all(|reg| *reg < 3));
            }
        }
        assert!(ra.info(lp).needs_file_save());
    }

    #[test]
    fn display_dump_mentions_ranges() {
        let (func, tree, lp) = loop_tree(Some(4));
        let mut stats = SinglePathStats::default();
        let ra = RegAlloc::compute(&func, &tree, &spec(4), &mut stats).unwrap();
        let dump = DisplayRaInfo::new(ra.info(lp), &tree).to_string();
        assert!(dump.contains("range(pred4)"));
        assert!(dump.contains("deflocs:"));
    }
}

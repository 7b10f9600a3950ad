//! Function, block and layout representation.
//!
//! Blocks embed their predecessor/successor edge lists, since the conversion
//! rewrites edges in place while it degenerates the CFG. The block layout is
//! an explicit order; after linearization it is the emission order and every
//! block falls through to its successor in the layout.

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::{
    inst::{InstData, PReg},
    BlockId, InstId,
};

/// How the function enters single-path mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// A single-path entry point; the whole function executes unconditionally.
    Root,

    /// Called from single-path code; receives its top-level guard from the
    /// caller through the reserved temporary predicate register.
    Reachable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockData {
    insts: Vec<InstId>,
    succs: SmallVec<[BlockId; 2]>,
    preds: SmallVec<[BlockId; 4]>,

    /// Physical predicate registers live into this block, annotated by the
    /// surrounding phases. Consumed when restoring the predicate file after
    /// a loop.
    pub live_in_pregs: SmallVec<[PReg; 2]>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    blocks: PrimaryMap<BlockId, BlockData>,
    insts: PrimaryMap<InstId, InstData>,
    layout: Vec<BlockId>,
}

impl Function {
    pub fn new(name: &str, kind: FunctionKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            layout: Vec::new(),
        }
    }

    /// Creates a new empty block and appends it to the layout.
    pub fn make_block(&mut self) -> BlockId {
        let block = self.blocks.push(BlockData::default());
        self.layout.push(block);
        block
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    /// Blocks in layout order.
    pub fn layout(&self) -> impl DoubleEndedIterator<Item = BlockId> + '_ {
        self.layout.iter().copied()
    }

    /// Replaces the layout order. Every block must appear at most once.
    pub fn set_layout(&mut self, order: Vec<BlockId>) {
        debug_assert!(order.iter().all(|b| self.blocks.is_valid(*b)));
        self.layout = order;
    }

    pub fn block_num(&self) -> usize {
        self.blocks.len()
    }

    pub fn inst(&self, inst: InstId) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: InstId) -> &mut InstData {
        &mut self.insts[inst]
    }

    pub fn insts_of(&self, block: BlockId) -> &[InstId] {
        &self.blocks[block].insts
    }

    pub fn last_inst_of(&self, block: BlockId) -> Option<InstId> {
        self.blocks[block].insts.last().copied()
    }

    /// Appends an instruction to the end of `block`.
    pub fn append_inst(&mut self, block: BlockId, data: InstData) -> InstId {
        let inst = self.insts.push(data);
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Inserts an instruction at position `index` within `block`.
    pub fn insert_inst(&mut self, block: BlockId, index: usize, data: InstData) -> InstId {
        let inst = self.insts.push(data);
        self.blocks[block].insts.insert(index, inst);
        inst
    }

    /// Removes an instruction from `block`. The instruction data stays in the
    /// arena but is no longer referenced by any block.
    pub fn remove_inst(&mut self, block: BlockId, inst: InstId) {
        let insts = &mut self.blocks[block].insts;
        let pos = insts
            .iter()
            .position(|i| *i == inst)
            .expect("instruction not in block");
        insts.remove(pos);
    }

    /// Position of the first terminator in `block`, or the instruction count
    /// if the block has none. Insertion point for code that must run before
    /// any control transfer.
    pub fn terminator_index(&self, block: BlockId) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .position(|i| self.insts[*i].kind.is_terminator())
            .unwrap_or(self.blocks[block].insts.len())
    }

    /// Position of the first instruction after the frame-setup prefix.
    pub fn frame_setup_end(&self, block: BlockId) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .position(|i| !self.insts[*i].frame_setup)
            .unwrap_or(self.blocks[block].insts.len())
    }

    pub fn succs_of(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block].succs
    }

    pub fn preds_of(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block].preds
    }

    pub fn succ_num_of(&self, block: BlockId) -> usize {
        self.blocks[block].succs.len()
    }

    pub fn pred_num_of(&self, block: BlockId) -> usize {
        self.blocks[block].preds.len()
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
            self.blocks[to].preds.push(from);
        }
    }

    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].succs.retain(|b| *b != to);
        self.blocks[to].preds.retain(|b| *b != from);
    }

    /// Disconnects `block` from all of its successors.
    pub fn clear_succs(&mut self, block: BlockId) {
        let succs = std::mem::take(&mut self.blocks[block].succs);
        for succ in succs {
            self.blocks[succ].preds.retain(|b| *b != block);
        }
    }

    pub fn live_in_pregs(&self, block: BlockId) -> &[PReg] {
        &self.blocks[block].live_in_pregs
    }

    pub fn set_live_in_pregs(&mut self, block: BlockId, pregs: &[PReg]) {
        self.blocks[block].live_in_pregs = pregs.into();
    }

    /// Splices single-predecessor `src` into `dst`: transfers its
    /// instructions and successor edges and removes it from the layout.
    pub fn splice(&mut self, dst: BlockId, src: BlockId) {
        debug_assert_eq!(self.preds_of(src), &[dst]);

        let src_insts = std::mem::take(&mut self.blocks[src].insts);
        self.blocks[dst].insts.extend(src_insts);

        self.remove_edge(dst, src);
        let succs = std::mem::take(&mut self.blocks[src].succs);
        for succ in succs {
            for pred in self.blocks[succ].preds.iter_mut() {
                if *pred == src {
                    *pred = dst;
                }
            }
            if !self.blocks[dst].succs.contains(&succ) {
                self.blocks[dst].succs.push(succ);
            }
        }

        self.layout.retain(|b| *b != src);
    }

    pub fn has_calls(&self) -> bool {
        self.insts.values().any(|data| data.kind.is_call())
    }
}

//! The scope tree: one scope for the whole function plus one per natural
//! loop, over topologically ordered member blocks.
//!
//! Scopes are stored in an arena and linked by indices; pre/post-order
//! traversals are computed over the arena. A nested loop appears in its
//! parent scope as a single member, its header block (a "subheader").
//! Loop-exit edges are annotated as definitions of the subheader member in
//! the parent scope.

use std::collections::BTreeSet;

use cranelift_entity::{packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{inst::Guard, BlockId, InstId, Pred, ScopeId};

/// A predicate definition attached to an outgoing edge of a block.
///
/// When the block executes, `pred` is set to `guard && cond`. The condition
/// register is computed by payload code in the block and lies outside the
/// allocatable predicate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Definition {
    /// The predicate being defined.
    pub pred: Pred,

    /// The guard under which the definition takes effect.
    pub guard: Pred,

    /// The branch condition, as a physical condition-register operand.
    pub cond: Guard,
}

#[derive(Debug, Clone)]
struct ScopeData {
    header: BlockId,

    /// Member blocks in topological order, header first. Headers of nested
    /// scopes stand in for the whole nested loop.
    blocks: Vec<BlockId>,

    depth: u32,
    loop_bound: Option<u32>,
    parent: PackedOption<ScopeId>,
    children: SmallVec<[ScopeId; 4]>,

    /// Guard predicates per member block; all must hold for the block to
    /// execute.
    guards: FxHashMap<BlockId, SmallVec<[Pred; 2]>>,

    /// Edge definitions per member block.
    defs: FxHashMap<BlockId, Vec<Definition>>,
}

impl ScopeData {
    fn new(header: BlockId) -> Self {
        Self {
            header,
            blocks: vec![header],
            depth: 0,
            loop_bound: None,
            parent: None.into(),
            children: SmallVec::new(),
            guards: FxHashMap::default(),
            defs: FxHashMap::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScopeTree {
    scopes: PrimaryMap<ScopeId, ScopeData>,
    root: ScopeId,

    /// Innermost owning scope of each block.
    scope_of: SecondaryMap<BlockId, PackedOption<ScopeId>>,

    /// Finest-grained guard predicate per instruction.
    inst_preds: FxHashMap<InstId, Pred>,
}

impl ScopeTree {
    /// Creates a tree with a root scope headed by the function entry block.
    pub fn new(entry: BlockId) -> Self {
        let mut scopes = PrimaryMap::new();
        let root: ScopeId = scopes.push(ScopeData::new(entry));
        let mut scope_of = SecondaryMap::new();
        scope_of[entry] = root.into();

        Self {
            scopes,
            root,
            scope_of,
            inst_preds: FxHashMap::default(),
        }
    }

    /// Creates a loop scope under `parent`, headed by `header`.
    ///
    /// The header becomes a member of `parent` (a subheader) if it is not one
    /// already, and the first member of the new scope.
    pub fn make_scope(
        &mut self,
        parent: ScopeId,
        header: BlockId,
        loop_bound: Option<u32>,
    ) -> ScopeId {
        if !self.scopes[parent].blocks.contains(&header) {
            self.scopes[parent].blocks.push(header);
        }

        let depth = self.scopes[parent].depth + 1;
        let mut data = ScopeData::new(header);
        data.depth = depth;
        data.loop_bound = loop_bound;
        data.parent = parent.into();
        let scope = self.scopes.push(data);
        self.scopes[parent].children.push(scope);
        self.scope_of[header] = scope.into();
        scope
    }

    /// Appends `block` to the member list of `scope` (topological order).
    pub fn push_member(&mut self, scope: ScopeId, block: BlockId) {
        debug_assert!(!self.scopes[scope].blocks.contains(&block));
        self.scopes[scope].blocks.push(block);
        self.scope_of[block] = scope.into();
    }

    pub fn set_guards(&mut self, scope: ScopeId, block: BlockId, preds: &[Pred]) {
        self.scopes[scope].guards.insert(block, preds.into());
    }

    pub fn add_def(&mut self, scope: ScopeId, block: BlockId, def: Definition) {
        self.scopes[scope].defs.entry(block).or_default().push(def);
    }

    pub fn set_inst_pred(&mut self, inst: InstId, pred: Pred) {
        self.inst_preds.insert(inst, pred);
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn is_top_level(&self, scope: ScopeId) -> bool {
        self.scopes[scope].parent.is_none()
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope].parent.expand()
    }

    pub fn children(&self, scope: ScopeId) -> &[ScopeId] {
        &self.scopes[scope].children
    }

    pub fn header(&self, scope: ScopeId) -> BlockId {
        self.scopes[scope].header
    }

    pub fn depth(&self, scope: ScopeId) -> u32 {
        self.scopes[scope].depth
    }

    pub fn loop_bound(&self, scope: ScopeId) -> Option<u32> {
        self.scopes[scope].loop_bound
    }

    /// Member blocks of `scope` in topological order, header first.
    pub fn blocks(&self, scope: ScopeId) -> &[BlockId] {
        &self.scopes[scope].blocks
    }

    pub fn is_header(&self, scope: ScopeId, block: BlockId) -> bool {
        self.scopes[scope].header == block
    }

    /// If `block` is the header of a child of `scope`, returns that child.
    pub fn subheader_child(&self, scope: ScopeId, block: BlockId) -> Option<ScopeId> {
        self.scopes[scope]
            .children
            .iter()
            .copied()
            .find(|child| self.scopes[*child].header == block)
    }

    /// The innermost scope owning `block`.
    pub fn scope_of(&self, block: BlockId) -> Option<ScopeId> {
        self.scope_of[block].expand()
    }

    pub fn guards(&self, scope: ScopeId, block: BlockId) -> &[Pred] {
        self.scopes[scope]
            .guards
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn defs(&self, scope: ScopeId, block: BlockId) -> &[Definition] {
        self.scopes[scope]
            .defs
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn inst_pred(&self, inst: InstId) -> Option<Pred> {
        self.inst_preds.get(&inst).copied()
    }

    /// The guard predicate of the scope header. The root header of a
    /// single-path entry function has none.
    pub fn header_pred(&self, scope: ScopeId) -> Option<Pred> {
        self.guards(scope, self.scopes[scope].header).first().copied()
    }

    /// All predicates used or defined within the members of `scope`.
    pub fn scope_preds(&self, scope: ScopeId) -> BTreeSet<Pred> {
        let data = &self.scopes[scope];
        let mut preds = BTreeSet::new();
        for block in &data.blocks {
            preds.extend(self.guards(scope, *block).iter().copied());
            preds.extend(self.defs(scope, *block).iter().map(|def| def.pred));
        }
        preds
    }

    pub fn pred_count(&self, scope: ScopeId) -> usize {
        self.scope_preds(scope).len()
    }

    pub fn scope_num(&self) -> usize {
        self.scopes.len()
    }

    /// Scopes in pre-order (parents before children).
    pub fn pre_order(&self) -> ScopesPreOrder {
        ScopesPreOrder::new(self, self.root)
    }

    /// Scopes of the subtree rooted at `scope`, in pre-order.
    pub fn pre_order_from(&self, scope: ScopeId) -> ScopesPreOrder {
        ScopesPreOrder::new(self, scope)
    }

    /// Scopes in post-order (children before parents).
    pub fn post_order(&self) -> ScopesPostOrder {
        ScopesPostOrder::new(self, self.root)
    }

    /// Coalesces bookkeeping after `src` has been spliced into `dst`.
    pub fn merge_blocks(&mut self, dst: BlockId, src: BlockId) {
        for data in self.scopes.values_mut() {
            if let Some(pos) = data.blocks.iter().position(|b| *b == src) {
                if data.blocks.contains(&dst) {
                    data.blocks.remove(pos);
                } else {
                    data.blocks[pos] = dst;
                }
            }
            if data.header == src {
                data.header = dst;
            }
            if let Some(guards) = data.guards.remove(&src) {
                data.guards.entry(dst).or_default().extend(guards);
            }
            if let Some(defs) = data.defs.remove(&src) {
                data.defs.entry(dst).or_default().extend(defs);
            }
        }
        self.scope_of[src] = None.into();
    }
}

pub struct ScopesPreOrder<'a> {
    tree: &'a ScopeTree,
    stack: Vec<ScopeId>,
}

impl<'a> ScopesPreOrder<'a> {
    fn new(tree: &'a ScopeTree, start: ScopeId) -> Self {
        Self {
            tree,
            stack: vec![start],
        }
    }
}

impl Iterator for ScopesPreOrder<'_> {
    type Item = ScopeId;

    fn next(&mut self) -> Option<ScopeId> {
        let scope = self.stack.pop()?;
        for child in self.tree.children(scope).iter().rev() {
            self.stack.push(*child);
        }
        Some(scope)
    }
}

pub struct ScopesPostOrder<'a> {
    tree: &'a ScopeTree,
    stack: Vec<(ScopeId, usize)>,
}

impl<'a> ScopesPostOrder<'a> {
    fn new(tree: &'a ScopeTree, start: ScopeId) -> Self {
        Self {
            tree,
            stack: vec![(start, 0)],
        }
    }
}

impl Iterator for ScopesPostOrder<'_> {
    type Item = ScopeId;

    fn next(&mut self) -> Option<ScopeId> {
        loop {
            let (scope, child_idx) = *self.stack.last()?;
            match self.tree.children(scope).get(child_idx) {
                Some(child) => {
                    self.stack.last_mut().unwrap().1 += 1;
                    self.stack.push((*child, 0));
                }
                None => {
                    self.stack.pop();
                    return Some(scope);
                }
            }
        }
    }
}

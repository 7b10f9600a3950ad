//! Convenience builder for constructing functions block by block.
//!
//! Collaborators hand the conversion an already-lowered machine function;
//! tests use this builder to assemble one.

use crate::{
    function::{Function, FunctionKind},
    inst::{Guard, InstData, InstKind},
    BlockId, InstId,
};

pub struct FunctionBuilder {
    func: Function,
    cur: Option<BlockId>,
}

impl FunctionBuilder {
    pub fn new(name: &str, kind: FunctionKind) -> Self {
        Self {
            func: Function::new(name, kind),
            cur: None,
        }
    }

    pub fn append_block(&mut self) -> BlockId {
        self.func.make_block()
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.cur = Some(block);
    }

    fn cur(&self) -> BlockId {
        self.cur.expect("no current block")
    }

    pub fn inst(&mut self, kind: InstKind) -> InstId {
        let block = self.cur();
        self.func.append_inst(block, InstData::new(kind))
    }

    pub fn frame_setup_inst(&mut self, kind: InstKind) -> InstId {
        let block = self.cur();
        self.func.append_inst(block, InstData::new(kind).frame_setup())
    }

    pub fn jump(&mut self, target: BlockId) -> InstId {
        let block = self.cur();
        let inst = self
            .func
            .append_inst(block, InstData::new(InstKind::Jump { target }));
        self.func.add_edge(block, target);
        inst
    }

    pub fn branch(&mut self, cond: Guard, target: BlockId) -> InstId {
        let block = self.cur();
        let inst = self
            .func
            .append_inst(block, InstData::new(InstKind::Branch { target }).with_guard(cond));
        self.func.add_edge(block, target);
        inst
    }

    pub fn call(&mut self, callee: &str) -> InstId {
        self.inst(InstKind::Call {
            callee: callee.to_string(),
        })
    }

    pub fn ret(&mut self) -> InstId {
        self.inst(InstKind::Ret)
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn build(self) -> Function {
        self.func
    }
}

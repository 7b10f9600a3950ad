use cranelift_entity::entity_impl;

pub mod builder;
pub mod frame;
pub mod function;
pub mod inst;
pub mod scope;

pub use frame::FrameLayout;
pub use function::{BlockData, Function, FunctionKind};
pub use inst::{Gpr, Guard, InstData, InstKind, PReg};
pub use scope::{Definition, ScopeTree};

/// An opaque reference to a basic block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);
entity_impl!(BlockId, "block");

/// An opaque reference to an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);
entity_impl!(InstId, "inst");

/// A logical predicate, as assigned by the scope-tree construction.
///
/// Logical predicates guard blocks and instructions; the allocator maps them
/// to physical predicate registers or spill-slot bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pred(pub u32);
entity_impl!(Pred, "pred");

/// An opaque reference to a scope in the scope tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);
entity_impl!(ScopeId, "scope");

/// An opaque reference to a frame-slot request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameSlot(pub u32);
entity_impl!(FrameSlot, "slot");

//! Predicated machine instructions.
//!
//! Every instruction carries a guard operand; it takes effect only when the
//! guard predicate evaluates to true. The hard-wired `p0` register is always
//! true, so a `p0` guard means the instruction executes unconditionally.

use std::fmt;

use crate::{BlockId, FrameSlot};

/// A physical predicate register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PReg(pub u16);

impl PReg {
    /// The hard-wired always-true predicate register.
    pub const TRUE: Self = PReg(0);
}

impl fmt::Display for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A general-purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gpr(pub u16);

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A guard operand: a predicate register, possibly negated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guard {
    pub preg: PReg,
    pub negated: bool,
}

impl Guard {
    /// The unconditional guard `(p0)`.
    pub const ALWAYS: Self = Guard {
        preg: PReg::TRUE,
        negated: false,
    };

    pub fn reg(preg: PReg) -> Self {
        Self {
            preg,
            negated: false,
        }
    }

    pub fn negated(preg: PReg) -> Self {
        Self {
            preg,
            negated: true,
        }
    }

    /// Returns `true` if this guard can never be false.
    pub fn is_always(self) -> bool {
        self.preg == PReg::TRUE && !self.negated
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "(!{})", self.preg)
        } else {
            write!(f, "({})", self.preg)
        }
    }
}

/// An instruction payload definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstKind {
    /// Register copy.
    Mov { dst: Gpr, src: Gpr },

    /// Addition.
    Add { dst: Gpr, lhs: Gpr, rhs: Gpr },

    /// Compare, producing a condition predicate `dst := lhs < rhs`.
    Cmp { dst: PReg, lhs: Gpr, rhs: Gpr },

    /// Load an immediate.
    LoadImm { dst: Gpr, imm: u32 },

    /// Subtract an immediate.
    SubImm { dst: Gpr, src: Gpr, imm: u32 },

    /// Bitwise AND with an immediate mask.
    AndImm { dst: Gpr, src: Gpr, imm: u32 },

    /// Bitwise OR with an immediate mask.
    OrImm { dst: Gpr, src: Gpr, imm: u32 },

    /// Load a frame slot into a register.
    LoadSlot { dst: Gpr, slot: FrameSlot },

    /// Store a register into a frame slot.
    StoreSlot { slot: FrameSlot, src: Gpr },

    /// Set a predicate register to `src > 0`.
    TestGtZero { dst: PReg, src: Gpr },

    /// Extract a single bit of `src` into a predicate register.
    BitTest { dst: PReg, src: Gpr, bit: u32 },

    /// Copy `src` to `dst` with bit `bit` replaced by the value of `cond`.
    BitCopy {
        dst: Gpr,
        src: Gpr,
        bit: u32,
        cond: Guard,
    },

    /// Copy the whole predicate-register file into a register.
    ReadPredFile { dst: Gpr },

    /// Restore the whole predicate-register file from a register.
    WritePredFile { src: Gpr },

    /// Set a predicate register from a guard operand.
    PredMov { dst: PReg, src: Guard },

    /// Set a predicate register to the conjunction of two guard operands.
    PredAnd { dst: PReg, lhs: Guard, rhs: Guard },

    /// Set a predicate register to the exclusive-or of two predicate registers.
    PredXor { dst: PReg, lhs: PReg, rhs: PReg },

    /// Unconditional jump.
    Jump { target: BlockId },

    /// Conditional branch; the condition is the instruction guard.
    Branch { target: BlockId },

    /// Function call.
    Call { callee: String },

    /// Return from the function.
    Ret,
}

impl InstKind {
    /// Returns `true` for control transfers terminating a block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Jump { .. } | Self::Branch { .. } | Self::Ret)
    }

    /// Returns `true` for jumps and branches (but not returns).
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Jump { .. } | Self::Branch { .. })
    }

    pub fn branch_target(&self) -> Option<BlockId> {
        match self {
            Self::Jump { target } | Self::Branch { target } => Some(*target),
            _ => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }

    /// Returns `true` if the instruction may be guarded by a predicate.
    ///
    /// Calls are excluded: the call instruction itself cannot be guarded, so
    /// the instrumentor routes the guard through the reserved temporary
    /// predicate register instead.
    pub fn is_predicable(&self) -> bool {
        !matches!(self, Self::Ret | Self::Call { .. } | Self::Jump { .. })
    }
}

/// An instruction: a guard operand, the payload, and bookkeeping flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstData {
    pub guard: Guard,
    pub kind: InstKind,

    /// Part of the unconditionally executed frame setup; never re-predicated.
    pub frame_setup: bool,

    /// Inserted by the conversion itself; never re-predicated.
    pub synthetic: bool,
}

impl InstData {
    pub fn new(kind: InstKind) -> Self {
        Self {
            guard: Guard::ALWAYS,
            kind,
            frame_setup: false,
            synthetic: false,
        }
    }

    /// An instruction inserted by the conversion.
    pub fn synth(kind: InstKind) -> Self {
        Self {
            synthetic: true,
            ..Self::new(kind)
        }
    }

    /// A synthetic instruction with an explicit guard.
    pub fn synth_guarded(kind: InstKind, guard: Guard) -> Self {
        Self {
            guard,
            ..Self::synth(kind)
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn frame_setup(mut self) -> Self {
        self.frame_setup = true;
        self
    }
}

impl fmt::Display for InstData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.guard.is_always() {
            write!(f, "{} ", self.guard)?;
        }
        match &self.kind {
            InstKind::Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            InstKind::Add { dst, lhs, rhs } => write!(f, "add {dst}, {lhs}, {rhs}"),
            InstKind::Cmp { dst, lhs, rhs } => write!(f, "cmplt {dst}, {lhs}, {rhs}"),
            InstKind::LoadImm { dst, imm } => write!(f, "li {dst}, {imm}"),
            InstKind::SubImm { dst, src, imm } => write!(f, "subi {dst}, {src}, {imm}"),
            InstKind::AndImm { dst, src, imm } => write!(f, "andi {dst}, {src}, {imm:#x}"),
            InstKind::OrImm { dst, src, imm } => write!(f, "ori {dst}, {src}, {imm:#x}"),
            InstKind::LoadSlot { dst, slot } => write!(f, "ld {dst}, [{slot}]"),
            InstKind::StoreSlot { slot, src } => write!(f, "st [{slot}], {src}"),
            InstKind::TestGtZero { dst, src } => write!(f, "gtz {dst}, {src}"),
            InstKind::BitTest { dst, src, bit } => write!(f, "btest {dst}, {src}, {bit}"),
            InstKind::BitCopy {
                dst,
                src,
                bit,
                cond,
            } => write!(f, "bcopy {dst}, {src}, {bit}, {cond}"),
            InstKind::ReadPredFile { dst } => write!(f, "rdpf {dst}"),
            InstKind::WritePredFile { src } => write!(f, "wrpf {src}"),
            InstKind::PredMov { dst, src } => write!(f, "pmov {dst}, {src}"),
            InstKind::PredAnd { dst, lhs, rhs } => write!(f, "pand {dst}, {lhs}, {rhs}"),
            InstKind::PredXor { dst, lhs, rhs } => write!(f, "pxor {dst}, {lhs}, {rhs}"),
            InstKind::Jump { target } => write!(f, "jmp {target}"),
            InstKind::Branch { target } => write!(f, "br {target}"),
            InstKind::Call { callee } => write!(f, "call {callee}"),
            InstKind::Ret => write!(f, "ret"),
        }
    }
}

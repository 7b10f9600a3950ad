//! Single-path conversion.
//!
//! Rewrites a function's control flow into one fixed, fully predicated
//! instruction sequence whose only remaining control transfers are
//! fixed-trip-count loop back-edges, making execution time independent of
//! data-dependent control decisions.
//!
//! The pipeline runs in strict phase order over the scope tree supplied by
//! the caller: predicate register allocation, frame-layout requests, guard
//! and definition instrumentation, linearization with block merging, and a
//! final cleanup of redundant spill loads.

pub mod alloc;
pub mod bitset;
pub mod elim;
pub mod error;
pub mod instrument;
pub mod linearize;
pub mod liverange;
pub mod prepare;

pub use error::ConvertError;
pub use singlepath_ir::FrameLayout;

use singlepath_ir::{Function, Gpr, PReg, ScopeTree};

/// Target parameters of the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSpec {
    /// Predicate registers available to the conversion, `p1..=pN`; `p0` is
    /// hard-wired true. The highest one is reserved as a temporary and the
    /// rest are allocatable.
    pub num_pred_regs: u32,

    /// Scratch register carrying all spill traffic and loop counters.
    pub scratch_gpr: Gpr,

    /// Caller-saved register that must be preserved around call sites.
    pub call_saved_gpr: Gpr,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            num_pred_regs: 7,
            scratch_gpr: Gpr(26),
            call_saved_gpr: Gpr(9),
        }
    }
}

impl MachineSpec {
    /// Registers available to the allocator (the temporary is excluded).
    pub fn alloc_regs(&self) -> u32 {
        self.num_pred_regs - 1
    }

    /// The reserved temporary predicate register.
    pub fn temp_preg(&self) -> PReg {
        PReg(self.num_pred_regs as u16)
    }

    /// Maps an allocator register index to its physical register.
    pub fn preg(&self, index: u32) -> PReg {
        debug_assert!(index < self.alloc_regs());
        PReg(index as u16 + 1)
    }
}

/// Counters reported by the conversion. Purely informational.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinglePathStats {
    pub removed_branches: u32,
    pub inserted_insts: u32,
    pub loop_counters: u32,
    pub eliminated_loads: u32,
    pub num_predicates: u32,
    pub spill_slots: u32,
    pub no_spill_scopes: u32,
}

/// The conversion result: the frame-layout requests to be placed by the
/// frame-layout component, plus the statistics counters.
#[derive(Debug)]
pub struct Conversion {
    pub frame: FrameLayout,
    pub stats: SinglePathStats,
}

/// Converts `func` into single-path form in place.
pub fn convert_function(
    func: &mut Function,
    tree: &mut ScopeTree,
    spec: &MachineSpec,
) -> Result<Conversion, ConvertError> {
    let mut stats = SinglePathStats::default();

    let ra = alloc::RegAlloc::compute(func, tree, spec, &mut stats)?;
    let frame = prepare::prepare_frame(func, tree, &ra);

    instrument::Instrumentor {
        func: &mut *func,
        tree: &*tree,
        ra: &ra,
        spec,
        frame: &frame,
        stats: &mut stats,
    }
    .run()?;

    let seeds = linearize::linearize(func, tree, &ra, spec, &frame, &mut stats)?;
    linearize::merge_blocks(func, tree);

    elim::eliminate_redundant_loads(func, &frame, spec, seeds, &mut stats);

    Ok(Conversion { frame, stats })
}

use singlepath_ir::{BlockId, Pred};
use thiserror::Error;

/// Fatal conversion errors. Each aborts compilation of the offending
/// function only; there is no partial recovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// A predicate is used at a point no definition reaches. Always an
    /// internal error of the scope-tree construction.
    #[error("in `{func}`: {pred} used in {block} without a reaching definition")]
    UndefinedPredicate {
        func: String,
        pred: Pred,
        block: BlockId,
    },

    /// A definition arrangement the instrumentor cannot order without
    /// clobbering a guard or condition operand.
    #[error("in `{func}`: unsupported predicate definition arrangement in {block}")]
    UnsupportedDefinition { func: String, block: BlockId },

    /// Every loop in a single-path function needs a static trip bound.
    #[error("in `{func}`: loop headed by {header} has no static trip bound")]
    MissingLoopBound { func: String, header: BlockId },
}

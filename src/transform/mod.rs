//! Transform schedules: explicit, replayable sequences of structural rewrites applied to payload
//! operations through handles.

use crate::common::Shape;
use crate::dialect::pack::PackError;
use crate::dialect::{memref, tensor, Reassociation};
use crate::ir::{Builder, OpId, ValueId};
use crate::matchers::NotApplicableReason;
use crate::passes::PassError;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

pub mod canonicalize;
pub mod collapse;
pub mod conv_to_matmul;
pub mod fold_unit_dims;
pub mod handles;
pub mod interpreter;
pub mod map_to_tpp;
pub mod match_op;
pub mod pack;
pub mod propagate_packing;

pub use canonicalize::CanonicalizeOp;
pub use collapse::Collapse;
pub use conv_to_matmul::MapConvToMatmul;
pub use fold_unit_dims::FoldUnitDims;
pub use handles::{Handle, HandleArena};
pub use interpreter::{Interpreter, Schedule};
pub use map_to_tpp::MapLinalgToTpp;
pub use match_op::MatchOp;
pub use pack::PackMatmul;
pub use propagate_packing::PropagatePacking;

/// Refers to a handle produced earlier in a schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum HandleRef {
    /// The op the schedule is applied to.
    Root,
    Result { step: usize, index: usize },
}

impl HandleRef {
    /// The first result of `step`.
    pub fn of(step: usize) -> Self {
        HandleRef::Result { step, index: 0 }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TransformError {
    #[error("Step {step} produced no result {index}")]
    UndefinedResult { step: usize, index: usize },
    #[error("Handle {0} does not exist")]
    UnknownHandle(Handle),
    #[error("Handle {0} was consumed by an earlier transform")]
    ConsumedHandle(Handle),
    #[error("Handle {0} was invalidated by an earlier transform")]
    StaleHandle(Handle),
    #[error("Handle {0} refers to an erased operation")]
    ErasedPayload(Handle),
    #[error("{transform} does not apply to {op}: {reason:?}")]
    NotApplicable {
        transform: &'static str,
        op: OpId,
        reason: NotApplicableReason,
    },
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error(transparent)]
    Pass(#[from] PassError),
}

#[enum_dispatch]
pub trait TransformOpT {
    fn name(&self) -> &'static str;

    /// The handles this op reads.
    fn operands(&self) -> Vec<HandleRef>;

    /// Applies the op and returns the handles it produces.
    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError>;
}

/// A single transform in a [Schedule].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[enum_dispatch(TransformOpT)]
pub enum TransformOp {
    /// Collects the nested ops with given names.
    Match(MatchOp),
    /// Packs matmuls into a blocked (and optionally VNNI) layout.
    Pack(PackMatmul),
    /// Merges groups of iteration dimensions of a generic.
    Collapse(Collapse),
    FoldUnitDims(FoldUnitDims),
    /// Tags generics with the primitive they compute.
    MapLinalgToTpp(MapLinalgToTpp),
    MapConvToMatmul(MapConvToMatmul),
    PropagatePacking(PropagatePacking),
    Canonicalize(CanonicalizeOp),
}

pub(crate) fn not_applicable(
    transform: &'static str,
    op: OpId,
    reason: NotApplicableReason,
) -> TransformError {
    TransformError::NotApplicable {
        transform,
        op,
        reason,
    }
}

/// Collapses a tensor or buffer.
pub(crate) fn collapse_value(b: &mut Builder, value: ValueId, reassociation: Reassociation) -> ValueId {
    let is_tensor = b.value_type(value).as_shaped().map_or(false, |s| s.is_tensor());
    if is_tensor {
        tensor::collapse_shape(b, value, reassociation)
    } else {
        memref::collapse_shape(b, value, reassociation)
    }
}

/// Expands a tensor or buffer back to `shape`.
pub(crate) fn expand_value(
    b: &mut Builder,
    value: ValueId,
    reassociation: Reassociation,
    shape: Shape,
) -> ValueId {
    let is_tensor = b.value_type(value).as_shaped().map_or(false, |s| s.is_tensor());
    if is_tensor {
        tensor::expand_shape(b, value, reassociation, shape)
    } else {
        memref::expand_shape(b, value, reassociation, shape)
    }
}

//! Conservative recognizers for the primitive vocabulary. A matcher may fail to recognize an op
//! that is semantically a primitive, but never accepts one that is not.

pub mod body;
pub mod primitives;
pub mod structured;
pub mod zero;

pub use primitives::{match_primitive, MatchedOperands};
pub use structured::{MapPred, OperandSel, StructuredOpMatcher};
pub use zero::ZeroSearch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotApplicableReason {
    NotStructured,
    NotGeneric,
    OperandCount,
    IteratorMismatch,
    AccessPattern,
    BodyMismatch,
    DynamicShape,
    NotBuffers,
    AlreadyTagged,
    Filtered,
    UnsupportedElementType,
    UnsupportedRank(usize),
    UnsupportedLayout(&'static str),
    Other(Option<&'static str>),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Pattern does not apply: {0:?}")]
pub struct NotApplicable(pub NotApplicableReason);

impl From<NotApplicableReason> for NotApplicable {
    fn from(reason: NotApplicableReason) -> Self {
        NotApplicable(reason)
    }
}

use crate::dialect::linalg::{IteratorType, Structured};
use crate::ir::affine::AffineMap;
use crate::matchers::{NotApplicable, NotApplicableReason};
use crate::passes::kernel_info::broadcast_from_map;

type Check = Box<dyn Fn(&Structured<'_>) -> Result<(), NotApplicableReason>>;

/// A predicate over an operand's indexing map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapPred {
    Identity,
    ProjectedPermutation,
    /// A projected permutation (zeros allowed) that is a valid 2-D broadcast.
    Broadcastable,
    Equals(AffineMap),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSel {
    All,
    One(usize),
}

/// Builds a structured-op predicate from operation-level, iterator, operand and region checks.
/// Checks run in insertion order and the first failing one reports its reason.
///
/// ```
/// # use tpp_lowering::matchers::{MapPred, OperandSel, StructuredOpMatcher};
/// # use tpp_lowering::dialect::linalg::IteratorType;
/// let elementwise = StructuredOpMatcher::new()
///     .generic()
///     .num_inits(1)
///     .all_dims(IteratorType::Parallel)
///     .output(OperandSel::All, MapPred::Identity);
/// # let _ = elementwise;
/// ```
#[derive(Default)]
pub struct StructuredOpMatcher {
    checks: Vec<Check>,
}

impl MapPred {
    pub fn holds(&self, map: &AffineMap) -> bool {
        match self {
            MapPred::Identity => map.is_identity(),
            MapPred::ProjectedPermutation => map.is_projected_permutation(false),
            MapPred::Broadcastable => {
                map.is_projected_permutation(true) && broadcast_from_map(map).is_ok()
            }
            MapPred::Equals(expected) => map.equivalent(expected),
        }
    }
}

impl StructuredOpMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(
        mut self,
        check: impl Fn(&Structured<'_>) -> Result<(), NotApplicableReason> + 'static,
    ) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// An arbitrary operation-level predicate, failing with `reason`.
    pub fn operation(
        self,
        reason: NotApplicableReason,
        pred: impl Fn(&Structured<'_>) -> bool + 'static,
    ) -> Self {
        self.check(move |s| if pred(s) { Ok(()) } else { Err(reason.clone()) })
    }

    pub fn generic(self) -> Self {
        self.operation(NotApplicableReason::NotGeneric, |s| s.generic().is_some())
    }

    pub fn num_inputs(self, n: usize) -> Self {
        self.operation(NotApplicableReason::OperandCount, move |s| s.num_inputs() == n)
    }

    pub fn num_inits(self, n: usize) -> Self {
        self.operation(NotApplicableReason::OperandCount, move |s| s.num_inits() == n)
    }

    pub fn num_loops(self, n: usize) -> Self {
        self.operation(NotApplicableReason::IteratorMismatch, move |s| s.num_loops() == n)
    }

    pub fn static_shapes(self) -> Self {
        self.operation(NotApplicableReason::DynamicShape, |s| s.has_static_shapes())
    }

    pub fn buffer_semantics(self) -> Self {
        self.operation(NotApplicableReason::NotBuffers, |s| s.has_buffer_semantics())
    }

    /// The iterator types must equal `expected`, in order.
    pub fn iterators(self, expected: Vec<IteratorType>) -> Self {
        self.operation(NotApplicableReason::IteratorMismatch, move |s| {
            s.iterator_types() == expected
        })
    }

    pub fn all_dims(self, ty: IteratorType) -> Self {
        self.operation(NotApplicableReason::IteratorMismatch, move |s| {
            s.iterator_types().iter().all(|t| *t == ty)
        })
    }

    fn operands(
        self,
        select_inits: bool,
        sel: OperandSel,
        pred: MapPred,
    ) -> Self {
        self.check(move |s| {
            let maps = s.indexing_maps();
            let (offset, count) = if select_inits {
                (s.num_inputs(), s.num_inits())
            } else {
                (0, s.num_inputs())
            };
            let selected: Vec<usize> = match sel {
                OperandSel::All => (offset..offset + count).collect(),
                OperandSel::One(i) if i < count => vec![offset + i],
                OperandSel::One(_) => return Err(NotApplicableReason::OperandCount),
            };
            if selected.iter().all(|i| pred.holds(&maps[*i])) {
                Ok(())
            } else {
                Err(NotApplicableReason::AccessPattern)
            }
        })
    }

    pub fn input(self, sel: OperandSel, pred: MapPred) -> Self {
        self.operands(false, sel, pred)
    }

    pub fn output(self, sel: OperandSel, pred: MapPred) -> Self {
        self.operands(true, sel, pred)
    }

    /// A predicate over the body of a `linalg.generic`.
    pub fn region(self, pred: impl Fn(&Structured<'_>) -> bool + 'static) -> Self {
        self.operation(NotApplicableReason::BodyMismatch, move |s| {
            s.body().is_some() && pred(s)
        })
    }

    pub fn matches(&self, s: &Structured<'_>) -> Result<(), NotApplicable> {
        for check in &self.checks {
            check(s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::linalg;
    use crate::ir::affine::{c, d};
    use crate::ir::{Builder, Program, Type};
    use crate::shape;

    #[test]
    fn test_first_failing_check_reports_reason() {
        let mut program = Program::new();
        let m = |s| Type::memref(s, Dtype::Float32);
        let (_, body) =
            program.add_function("f", &[m(shape![4, 8]), m(shape![8, 16]), m(shape![4, 16])], &[]);
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let mm = linalg::matmul(&mut b, args[0], args[1], args[2]);
        let s = Structured::get(&program, mm).unwrap();

        let named = StructuredOpMatcher::new()
            .num_inputs(2)
            .iterators(linalg::matmul_iterators())
            .input(OperandSel::One(0), MapPred::Equals(linalg::matmul_maps()[0].clone()))
            .output(OperandSel::All, MapPred::Equals(linalg::matmul_maps()[2].clone()));
        assert_eq!(named.matches(&s), Ok(()));

        let identity_output = StructuredOpMatcher::new().output(OperandSel::All, MapPred::Identity);
        assert_eq!(
            identity_output.matches(&s),
            Err(NotApplicable(NotApplicableReason::AccessPattern))
        );

        let generic_only = StructuredOpMatcher::new().num_inputs(2).generic();
        assert_eq!(
            generic_only.matches(&s),
            Err(NotApplicable(NotApplicableReason::NotGeneric))
        );

        let out_of_range = StructuredOpMatcher::new().input(OperandSel::One(2), MapPred::Identity);
        assert_eq!(
            out_of_range.matches(&s),
            Err(NotApplicable(NotApplicableReason::OperandCount))
        );
    }

    #[test]
    fn test_map_predicates() {
        let bcast = AffineMap::new(2, 0, vec![c(0), d(1)]);
        assert!(MapPred::Broadcastable.holds(&bcast));
        assert!(!MapPred::ProjectedPermutation.holds(&bcast));
        assert!(!MapPred::Identity.holds(&bcast));
        let transposed = AffineMap::new(2, 0, vec![d(1), d(0)]);
        assert!(MapPred::ProjectedPermutation.holds(&transposed));
        assert!(!MapPred::Broadcastable.holds(&transposed));
    }
}

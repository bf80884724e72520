use crate::dialect::linalg::{self, IteratorType, Structured};
use crate::dialect::{is_valid_reassociation, Reassociation};
use crate::ir::affine::{d, AffineMap};
use crate::ir::{BlockId, Builder, OpId, Program, ValueId};
use crate::matchers::NotApplicableReason;
use crate::transform::{
    collapse_value, expand_value, not_applicable, Handle, HandleRef, Interpreter, TransformError,
    TransformOpT,
};

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const NAME: &str = "collapse";

/// Merges groups of consecutive iteration dimensions of a `linalg.generic`. Each operand is
/// collapsed along the same groups and tensor results are expanded back to their original shape.
///
/// Consumes the target and produces a handle to the collapsed generics.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Collapse {
    pub target: HandleRef,
    pub reassociation: Reassociation,
}

impl TransformOpT for Collapse {
    fn name(&self) -> &'static str {
        NAME
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let targets = cx.consume(self.target)?;
        let mut collapsed = Vec::with_capacity(targets.len());
        for op in targets {
            let plan = Structured::get(cx.program, op)
                .ok_or(NotApplicableReason::NotStructured)
                .and_then(|s| plan_collapse(&s, &self.reassociation))
                .map_err(|reason| not_applicable(NAME, op, reason))?;
            collapsed.push(rebuild_generic(cx.program, op, plan));
        }
        Ok(vec![cx.produce(collapsed)])
    }
}

/// How one operand is reshaped and re-indexed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OperandPlan {
    pub reassociation: Reassociation,
    pub map: AffineMap,
}

/// A checked rewrite of a generic into one over fewer loops.
#[derive(Clone, Debug)]
pub(crate) struct GenericPlan {
    inputs: Vec<ValueId>,
    inits: Vec<ValueId>,
    body: BlockId,
    operands: Vec<OperandPlan>,
    iterators: Vec<IteratorType>,
}

impl GenericPlan {
    /// Validates per-operand plans against `s`.
    pub(crate) fn new(
        s: &Structured<'_>,
        operands: Vec<OperandPlan>,
        iterators: Vec<IteratorType>,
    ) -> Result<Self, NotApplicableReason> {
        let body = s.body().ok_or(NotApplicableReason::NotGeneric)?;
        for (value, plan) in s.operands().iter().zip(&operands) {
            if is_trivial(&plan.reassociation) {
                continue;
            }
            match s.program().shaped_type(*value) {
                Some(ty) if ty.is_memref() && !ty.has_identity_layout() => {
                    return Err(NotApplicableReason::UnsupportedLayout("strided buffer"))
                }
                Some(_) => {}
                None => return Err(NotApplicableReason::AccessPattern),
            }
        }
        Ok(GenericPlan {
            inputs: s.inputs().to_vec(),
            inits: s.inits().to_vec(),
            body,
            operands,
            iterators,
        })
    }
}

fn is_trivial(reassociation: &[Vec<usize>]) -> bool {
    reassociation.iter().all(|g| g.len() == 1)
}

/// Builds the generic described by `plan` in place of `op` and returns it.
pub(crate) fn rebuild_generic(program: &mut Program, op: OpId, plan: GenericPlan) -> OpId {
    let mut b = Builder::before(program, op);
    let mut operands = Vec::with_capacity(plan.operands.len());
    for (value, p) in plan.inputs.iter().chain(&plan.inits).zip(&plan.operands) {
        operands.push(if is_trivial(&p.reassociation) {
            *value
        } else {
            collapse_value(&mut b, *value, p.reassociation.clone())
        });
    }
    let (inputs, inits) = operands.split_at(plan.inputs.len());
    let body = b.program.clone_block(plan.body, &mut HashMap::new());
    let maps = plan.operands.iter().map(|p| p.map.clone()).collect();
    let new_op = linalg::generic_with_body(&mut b, inputs, inits, maps, plan.iterators, body);

    let init_plans = &plan.operands[plan.inputs.len()..];
    let mut results = vec![];
    for (init, p) in plan.inits.iter().zip(init_plans) {
        let Some(ty) = b.program.shaped_type(*init).filter(|t| t.is_tensor()).cloned() else {
            continue;
        };
        let result = b.program.result(new_op, results.len());
        results.push(if is_trivial(&p.reassociation) {
            result
        } else {
            expand_value(&mut b, result, p.reassociation.clone(), ty.shape)
        });
    }
    b.replace_op(op, &results);
    debug!("Rebuilt {op} as {new_op}");
    new_op
}

/// Checks that `s` can be collapsed along `reassociation` and derives the operand plans.
///
/// Every operand map must consist of bare loop dimensions, and each loop group must either be
/// absent from a map or appear in it as a contiguous run in group order.
pub(crate) fn plan_collapse(
    s: &Structured<'_>,
    reassociation: &[Vec<usize>],
) -> Result<GenericPlan, NotApplicableReason> {
    s.generic().ok_or(NotApplicableReason::NotGeneric)?;
    if !s.has_static_shapes() {
        return Err(NotApplicableReason::DynamicShape);
    }
    let iterators = s.iterator_types();
    if !is_valid_reassociation(reassociation, iterators.len()) {
        return Err(NotApplicableReason::Other(Some("invalid reassociation")));
    }
    let mut group_of = vec![0; iterators.len()];
    let mut new_iterators = Vec::with_capacity(reassociation.len());
    for (g, group) in reassociation.iter().enumerate() {
        let kind = iterators[group[0]];
        if group.iter().any(|l| iterators[*l] != kind) {
            return Err(NotApplicableReason::IteratorMismatch);
        }
        for l in group {
            group_of[*l] = g;
        }
        new_iterators.push(kind);
    }

    let num_groups = reassociation.len() as u32;
    let mut operands = vec![];
    for map in s.indexing_maps() {
        let dims = map.result_dims().ok_or(NotApplicableReason::AccessPattern)?;
        let mut operand_reassociation = vec![];
        let mut results = vec![];
        let mut pos = 0;
        while pos < dims.len() {
            let g = group_of[dims[pos] as usize];
            let group = &reassociation[g];
            let run = dims.get(pos..pos + group.len());
            if run.map_or(true, |r| r.iter().zip(group).any(|(a, b)| *a as usize != *b)) {
                return Err(NotApplicableReason::AccessPattern);
            }
            operand_reassociation.push((pos..pos + group.len()).collect());
            results.push(d(g as u32));
            pos += group.len();
        }
        operands.push(OperandPlan {
            reassociation: operand_reassociation,
            map: AffineMap::new(num_groups, 0, results),
        });
    }
    GenericPlan::new(s, operands, new_iterators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::arith::{self, ArithOp};
    use crate::dialect::{func, tensor};
    use crate::ir::Type;
    use crate::shape;

    /// `out[i, j, k] = x[i, j, k] + bias[k]` on 4x8x16 tensors.
    fn bias_add() -> (Program, OpId, OpId) {
        let mut program = Program::new();
        let t = |s| Type::tensor(s, Dtype::Float32);
        let (func, body) = program.add_function(
            "f",
            &[t(shape![4, 8, 16]), t(shape![16])],
            &[t(shape![4, 8, 16])],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let init = tensor::empty(&mut b, shape![4, 8, 16], Dtype::Float32);
        let add = linalg::generic(
            &mut b,
            &args,
            &[init],
            vec![
                AffineMap::identity(3),
                AffineMap::new(3, 0, vec![d(2)]),
                AffineMap::identity(3),
            ],
            vec![IteratorType::Parallel; 3],
            |b, x| {
                let s = arith::binary(b, ArithOp::AddF, x[0], x[1]);
                linalg::yield_(b, &[s]);
            },
        );
        let result = b.program.result(add, 0);
        func::return_(&mut b, &[result]);
        (program, func, add)
    }

    #[test]
    fn test_collapse_leading_dims() {
        let (mut program, func, add) = bias_add();
        let plan = plan_collapse(&Structured::get(&program, add).unwrap(), &[vec![0, 1], vec![2]])
            .unwrap();
        let collapsed = rebuild_generic(&mut program, add, plan);

        let s = Structured::get(&program, collapsed).unwrap();
        assert_eq!(s.static_loop_ranges(), Some(vec![32, 16]));
        assert_eq!(
            s.indexing_maps(),
            vec![
                AffineMap::identity(2),
                AffineMap::new(2, 0, vec![d(1)]),
                AffineMap::identity(2),
            ]
        );
        assert_eq!(s.operand_shape(1), &shape![16][..]);

        let ret = program.terminator(program.body(func).unwrap()).unwrap();
        let expanded = program.defining_op(program.operands(ret)[0]).unwrap();
        assert_eq!(program.kind(expanded).name(), "tensor.expand_shape");
        assert_eq!(
            program.shaped_type(program.operands(ret)[0]).unwrap().shape,
            shape![4, 8, 16]
        );
    }

    #[test]
    fn test_group_split_across_operand_is_rejected() {
        let (program, _, add) = bias_add();
        let s = Structured::get(&program, add).unwrap();
        assert_eq!(
            plan_collapse(&s, &[vec![0], vec![1, 2]]).map(|_| ()),
            Err(NotApplicableReason::AccessPattern)
        );
    }

    #[test]
    fn test_mixed_iterators_are_rejected() {
        let mut program = Program::new();
        let t = |s| Type::tensor(s, Dtype::Float32);
        let (_, body) = program.add_function(
            "f",
            &[t(shape![4, 8]), t(shape![8, 2]), t(shape![4, 2])],
            &[],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let mm = linalg::generic(
            &mut b,
            &args[0..2],
            &args[2..3],
            linalg::matmul_maps(),
            linalg::matmul_iterators(),
            |b, x| {
                let p = arith::binary(b, ArithOp::MulF, x[0], x[1]);
                let s = arith::binary(b, ArithOp::AddF, x[2], p);
                linalg::yield_(b, &[s]);
            },
        );
        let s = Structured::get(&program, mm).unwrap();
        assert_eq!(
            plan_collapse(&s, &[vec![0], vec![1, 2]]).map(|_| ()),
            Err(NotApplicableReason::IteratorMismatch)
        );
    }

    #[test]
    fn test_transform_consumes_target() {
        let (mut program, func, _) = bias_add();
        let mut interp = Interpreter::new(&mut program, func);
        let step = interp
            .apply(
                &crate::transform::MatchOp {
                    target: HandleRef::Root,
                    op_names: vec!["linalg.generic".into()],
                }
                .into(),
            )
            .unwrap();
        let collapsed = interp
            .apply(
                &Collapse {
                    target: HandleRef::of(step),
                    reassociation: vec![vec![0, 1], vec![2]],
                }
                .into(),
            )
            .unwrap();
        let payload = interp.payload(HandleRef::of(collapsed)).unwrap();
        let s = Structured::get(interp.program, payload[0]).unwrap();
        assert_eq!(s.static_loop_ranges(), Some(vec![32, 16]));
        assert!(matches!(
            interp.payload(HandleRef::of(step)),
            Err(TransformError::ConsumedHandle(_))
        ));
    }

    #[test]
    fn test_transform_reports_the_rejected_op() {
        let (mut program, func, add) = bias_add();
        let mut interp = Interpreter::new(&mut program, func);
        let step = interp
            .apply(
                &crate::transform::MatchOp {
                    target: HandleRef::Root,
                    op_names: vec!["linalg.generic".into()],
                }
                .into(),
            )
            .unwrap();
        let err = interp
            .apply(
                &Collapse {
                    target: HandleRef::of(step),
                    reassociation: vec![vec![0, 1, 2]],
                }
                .into(),
            )
            .unwrap_err();
        assert_eq!(err, not_applicable(NAME, add, NotApplicableReason::AccessPattern));
        assert!(interp.payload(HandleRef::of(step)).is_ok());
    }
}

use crate::dialect::linalg::{self, IteratorType, Structured};
use crate::dialect::pack::{pack_into_empty, pack_operands, unpack, PackInfo};
use crate::dialect::tensor::TensorOp;
use crate::ir::affine::AffineMap;
use crate::ir::{Builder, OpId, OpKind, Program, ValueId};
use crate::matchers::{NotApplicable, NotApplicableReason};
use crate::passes::canonicalize::canonicalize;
use crate::passes::{apply_patterns_greedily, RewritePattern};
use crate::transform::{Handle, HandleRef, Interpreter, TransformError, TransformOpT};

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Moves `tensor.unpack` below elementwise generics so that chains of elementwise ops run on the
/// packed layout, then canonicalizes to fold the resulting `pack(unpack(x))` pairs.
///
/// Invalidates handles into the target.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PropagatePacking {
    pub target: HandleRef,
}

impl TransformOpT for PropagatePacking {
    fn name(&self) -> &'static str {
        "propagate_packing"
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let targets = cx.payload(self.target)?;
        for target in &targets {
            apply_patterns_greedily(cx.program, *target, &[&SinkUnpack], &cx.greedy)?;
            canonicalize(cx.program, *target, &cx.greedy)?;
        }
        cx.invalidate_within(&targets);
        Ok(vec![])
    }
}

/// `generic(unpack(x), y) -> unpack(generic(x, pack(y)))` for elementwise generics on tensors.
struct SinkUnpack;

fn not_applicable(why: &'static str) -> NotApplicable {
    NotApplicable(NotApplicableReason::Other(Some(why)))
}

/// The first input produced by a `tensor.unpack` without dynamic tiles, with that unpack's
/// packed source and descriptor.
fn unpacked_input(program: &Program, inputs: &[ValueId]) -> Option<(ValueId, PackInfo)> {
    inputs.iter().find_map(|v| {
        let producer = program.defining_op(*v)?;
        if !matches!(program.kind(producer), OpKind::Tensor(TensorOp::Unpack(_))) {
            return None;
        }
        let (operands, attrs) = pack_operands(program, producer)?;
        operands
            .dynamic_tiles
            .is_empty()
            .then(|| (operands.source, attrs.info.clone()))
    })
}

impl RewritePattern for SinkUnpack {
    fn name(&self) -> &'static str {
        "sink-unpack"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let s = Structured::get(program, op).ok_or(NotApplicableReason::NotStructured)?;
        s.generic().ok_or(NotApplicableReason::NotGeneric)?;
        if !s.has_tensor_semantics() || s.num_inits() != 1 {
            return Err(NotApplicableReason::OperandCount.into());
        }
        if !s.has_static_shapes() {
            return Err(NotApplicableReason::DynamicShape.into());
        }
        if s.iterator_types().iter().any(|t| *t != IteratorType::Parallel) {
            return Err(NotApplicableReason::IteratorMismatch.into());
        }
        if !s.indexing_maps().iter().all(AffineMap::is_identity) {
            return Err(NotApplicableReason::AccessPattern.into());
        }
        let body = s.body().ok_or(NotApplicableReason::NotGeneric)?;
        let (inputs, init) = (s.inputs().to_vec(), s.inits()[0]);
        let Some((_, info)) = unpacked_input(program, &inputs) else {
            return Err(not_applicable("no input is unpacked"));
        };
        let mut packed_rank = None;
        for v in inputs.iter().chain([&init]) {
            let ty = program
                .shaped_type(*v)
                .ok_or(NotApplicableReason::AccessPattern)?;
            let packed = info
                .packed_shape(&ty.shape, false)
                .map_err(|_| not_applicable("operand does not tile evenly"))?;
            packed_rank = Some(packed.len());
        }
        let packed_rank = packed_rank.ok_or(NotApplicableReason::OperandCount)? as u32;

        let mut b = Builder::before(program, op);
        let mut packed_inputs = Vec::with_capacity(inputs.len());
        for v in &inputs {
            let reused = unpacked_input(b.program, &[*v]).filter(|(_, i)| *i == info);
            packed_inputs.push(match reused {
                Some((source, _)) => source,
                None => pack_into_empty(&mut b, *v, info.clone(), None)
                    .map_err(|_| not_applicable("operand does not tile evenly"))?,
            });
        }
        let packed_init = pack_into_empty(&mut b, init, info.clone(), None)
            .map_err(|_| not_applicable("init does not tile evenly"))?;
        let body = b.program.clone_block(body, &mut HashMap::new());
        let num_operands = inputs.len() + 1;
        let sunk = linalg::generic_with_body(
            &mut b,
            &packed_inputs,
            &[packed_init],
            vec![AffineMap::identity(packed_rank); num_operands],
            vec![IteratorType::Parallel; packed_rank as usize],
            body,
        );
        let result = b.program.result(sunk, 0);
        let unpacked = unpack(&mut b, result, init, info, &[])
            .map_err(|_| not_applicable("init does not tile evenly"))?;
        b.replace_op(op, &[unpacked]);
        debug!("Sank unpack below {op} as {sunk}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::arith::{self, ArithOp};
    use crate::dialect::{func, tensor};
    use crate::ir::Type;
    use crate::passes::GreedyConfig;
    use crate::shape;
    use crate::transform::pack::pack_matmul;

    fn relu(b: &mut Builder, input: ValueId, init: ValueId, maps: Vec<AffineMap>) -> OpId {
        linalg::generic(
            b,
            &[input],
            &[init],
            maps,
            vec![IteratorType::Parallel; 2],
            |b, x| {
                let zero = arith::constant_float(b, 0.0, Dtype::Float32);
                let m = arith::binary(b, ArithOp::MaxF, x[0], zero);
                linalg::yield_(b, &[m]);
            },
        )
    }

    /// A matmul (packed with 8x8x16 blocks) followed by a relu on the unpacked result.
    fn packed_matmul_relu(relu_maps: Vec<AffineMap>) -> (Program, OpId, OpId) {
        let mut program = Program::new();
        let t = |s| Type::tensor(s, Dtype::Float32);
        let (func, body) = program.add_function(
            "f",
            &[t(shape![32, 64]), t(shape![64, 32])],
            &[t(shape![32, 32])],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let init = tensor::empty(&mut b, shape![32, 32], Dtype::Float32);
        let mm = linalg::matmul(&mut b, args[0], args[1], init);
        let product = b.program.result(mm, 0);
        let out = tensor::empty(&mut b, shape![32, 32], Dtype::Float32);
        let relu = relu(&mut b, product, out, relu_maps);
        let result = b.program.result(relu, 0);
        func::return_(&mut b, &[result]);
        pack_matmul(&mut program, mm, &[8, 8, 16], false).unwrap();
        (program, func, relu)
    }

    fn count(program: &Program, root: OpId, name: &str) -> usize {
        program
            .walk(root)
            .into_iter()
            .filter(|op| program.kind(*op).name() == name)
            .count()
    }

    #[test]
    fn test_unpack_sinks_below_relu() {
        let identity = vec![AffineMap::identity(2); 2];
        let (mut program, func, relu) = packed_matmul_relu(identity);
        let mut interp = Interpreter::new(&mut program, func);
        interp
            .apply(&PropagatePacking { target: HandleRef::Root }.into())
            .unwrap();
        let program = &*interp.program;
        assert!(program.is_erased(relu));
        assert_eq!(count(program, func, "tensor.unpack"), 1);

        let ret = program.terminator(program.body(func).unwrap()).unwrap();
        let unpack_op = program.defining_op(program.operands(ret)[0]).unwrap();
        assert_eq!(program.kind(unpack_op).name(), "tensor.unpack");
        let sunk = program.defining_op(program.operands(unpack_op)[0]).unwrap();
        let s = Structured::get(program, sunk).unwrap();
        assert_eq!(s.num_loops(), 4);
        let blocked = program.defining_op(s.inputs()[0]).unwrap();
        assert_eq!(Structured::get(program, blocked).unwrap().num_loops(), 6);
    }

    #[test]
    fn test_transposed_consumer_is_left_alone() {
        let transposed = vec![AffineMap::permutation(&[1, 0]), AffineMap::identity(2)];
        let (mut program, func, relu) = packed_matmul_relu(transposed);
        let rewrites =
            apply_patterns_greedily(&mut program, func, &[&SinkUnpack], &GreedyConfig::default())
                .unwrap();
        assert_eq!(rewrites, 0);
        assert!(!program.is_erased(relu));
    }
}

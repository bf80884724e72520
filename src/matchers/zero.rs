//! Bounded backward search proving that a value holds only zeros.

use crate::dialect::arith::is_zero_constant;
use crate::dialect::linalg::LinalgOp;
use crate::dialect::memref::MemRefOp;
use crate::dialect::tensor::TensorOp;
use crate::ir::{OpId, OpKind, Program, ValueId};

use log::trace;
use serde::{Deserialize, Serialize};

/// Bounds the number of producer hops the zero search follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ZeroSearch {
    pub max_depth: usize,
}

impl Default for ZeroSearch {
    fn default() -> Self {
        ZeroSearch { max_depth: 4 }
    }
}

/// How an operation can carry zeros forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Producer {
    /// Fills its target with `value`.
    Fill { value: ValueId },
    /// Copies `source` into its target.
    Copy { source: ValueId },
    /// Aliases or reinterprets `source`.
    View { source: ValueId },
    Other,
}

fn classify(program: &Program, op: OpId) -> Producer {
    let operands = program.operands(op);
    match program.kind(op) {
        OpKind::Linalg(LinalgOp::Fill) => Producer::Fill { value: operands[0] },
        OpKind::Linalg(LinalgOp::Copy) | OpKind::MemRef(MemRefOp::Copy) => Producer::Copy {
            source: operands[0],
        },
        OpKind::MemRef(MemRefOp::SubView(_))
        | OpKind::Tensor(TensorOp::Cast)
        | OpKind::Tensor(TensorOp::ExtractSlice(_)) => Producer::View {
            source: operands[0],
        },
        _ => Producer::Other,
    }
}

impl ZeroSearch {
    /// Returns `true` if the value produced (or last written) by `op` is provably all zeros.
    pub fn is_zero_op(&self, program: &Program, op: OpId) -> bool {
        self.op_at_depth(program, op, self.max_depth)
    }

    /// Returns `true` if the defining op of `value` provably produces zeros.
    pub fn is_zero_value(&self, program: &Program, value: ValueId) -> bool {
        self.value_at_depth(program, value, self.max_depth)
    }

    /// Returns `true` if `value`, as read by `user`, is provably all zeros: either its producer
    /// yields zeros or the write to it just before `user` does.
    pub fn is_zero_before(&self, program: &Program, value: ValueId, user: OpId) -> bool {
        self.value_before_at_depth(program, value, user, self.max_depth)
    }

    fn value_at_depth(&self, program: &Program, value: ValueId, depth: usize) -> bool {
        program
            .defining_op(value)
            .map_or(false, |op| self.op_at_depth(program, op, depth))
    }

    fn value_before_at_depth(
        &self,
        program: &Program,
        value: ValueId,
        user: OpId,
        depth: usize,
    ) -> bool {
        if self.value_at_depth(program, value, depth) {
            return true;
        }
        let Some(prev) = program.prev_user(value, user) else {
            return false;
        };
        match classify(program, prev) {
            // A view of `value` writes nothing itself, but writes through it are not tracked.
            Producer::View { source } if source == value => {
                depth > 1
                    && program
                        .results(prev)
                        .iter()
                        .all(|alias| program.users(*alias).is_empty())
                    && self.value_before_at_depth(program, value, prev, depth - 1)
            }
            _ => self.op_at_depth(program, prev, depth),
        }
    }

    fn op_at_depth(&self, program: &Program, op: OpId, depth: usize) -> bool {
        if depth == 0 {
            trace!("Zero search depth exhausted at {op}");
            return false;
        }
        match classify(program, op) {
            Producer::Fill { value } => is_zero_constant(program, value),
            Producer::Copy { source } | Producer::View { source } => {
                self.value_before_at_depth(program, source, op, depth - 1)
            }
            Producer::Other => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::{arith, linalg, memref, Offset};
    use crate::ir::{Builder, Type};
    use crate::shape;

    #[test]
    fn test_zero_through_fill_copy_and_subview() {
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[Type::memref(shape![8, 8], Dtype::Float32)], &[]);
        let out = program.block_args(body)[0];
        let mut b = Builder::at_end(&mut program, body);
        let zero = arith::constant_float(&mut b, 0.0, Dtype::Float32);
        let buf = memref::alloc(&mut b, shape![8, 8], Dtype::Float32);
        linalg::fill(&mut b, zero, buf);
        let view = memref::subview(
            &mut b,
            buf,
            &[Offset::Static(0), Offset::Static(0)],
            vec![4, 4],
            vec![1, 1],
            vec![],
        );
        let copy = linalg::copy(&mut b, view, out);
        let reader = linalg::copy(&mut b, out, buf);

        let search = ZeroSearch::default();
        // `out` is not produced by an op, but the copy just before `reader` wrote zeros into it.
        assert!(search.is_zero_before(&program, out, reader));
        assert!(search.is_zero_op(&program, copy));
        assert!(search.is_zero_value(&program, view));
        assert!(!search.is_zero_value(&program, buf));

        let shallow = ZeroSearch { max_depth: 2 };
        assert!(!shallow.is_zero_before(&program, out, reader));
    }

    #[test]
    fn test_write_through_alias_defeats_zero_fill() {
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[Type::memref(shape![8, 8], Dtype::Float32)], &[]);
        let out = program.block_args(body)[0];
        let mut b = Builder::at_end(&mut program, body);
        let zero = arith::constant_float(&mut b, 0.0, Dtype::Float32);
        let one = arith::constant_float(&mut b, 1.0, Dtype::Float32);
        let buf = memref::alloc(&mut b, shape![8, 8], Dtype::Float32);
        linalg::fill(&mut b, zero, buf);
        let view = memref::subview(
            &mut b,
            buf,
            &[Offset::Static(0), Offset::Static(0)],
            vec![4, 4],
            vec![1, 1],
            vec![],
        );
        linalg::fill(&mut b, one, view);
        let reader = linalg::copy(&mut b, buf, out);
        assert!(!ZeroSearch::default().is_zero_before(&program, buf, reader));
    }

    #[test]
    fn test_unused_alias_keeps_zero_fill() {
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[Type::memref(shape![8, 8], Dtype::Float32)], &[]);
        let out = program.block_args(body)[0];
        let mut b = Builder::at_end(&mut program, body);
        let zero = arith::constant_float(&mut b, 0.0, Dtype::Float32);
        let buf = memref::alloc(&mut b, shape![8, 8], Dtype::Float32);
        linalg::fill(&mut b, zero, buf);
        memref::subview(
            &mut b,
            buf,
            &[Offset::Static(0), Offset::Static(0)],
            vec![4, 4],
            vec![1, 1],
            vec![],
        );
        let reader = linalg::copy(&mut b, buf, out);
        assert!(ZeroSearch::default().is_zero_before(&program, buf, reader));
    }

    #[test]
    fn test_nonzero_fill() {
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[Type::memref(shape![4], Dtype::Float32)], &[]);
        let out = program.block_args(body)[0];
        let mut b = Builder::at_end(&mut program, body);
        let one = arith::constant_float(&mut b, 1.0, Dtype::Float32);
        let fill = linalg::fill(&mut b, one, out);
        assert!(!ZeroSearch::default().is_zero_op(&program, fill));
    }
}

//! `convert-linalg-to-xsmm`: lowers a few linalg ops on 2-D buffers straight to unary kernel
//! calls, without going through tpp ops.

use crate::dialect::linalg::Structured;
use crate::dialect::xsmm::{UnaryFlags, UnaryKind, XsmmOp};
use crate::ir::{OpId, Program};
use crate::matchers::primitives::{match_relu_2d, match_transpose_2d, match_zero_fill_2d};
use crate::matchers::{NotApplicable, NotApplicableReason, ZeroSearch};
use crate::passes::kernel_info::broadcast_from_map;
use crate::passes::tpp_to_xsmm::{unary_call, KernelCall};
use crate::passes::{apply_patterns_greedily, GreedyConfig, Pass, PassError, RewritePattern};

use log::debug;

fn set_unary_flags(call: &mut KernelCall, new_flags: UnaryFlags) {
    if let XsmmOp::UnaryDispatch { flags, .. } = &mut call.dispatch {
        *flags = new_flags;
    }
}

/// `linalg.fill` with zero becomes a ZERO kernel broadcasting the scalar.
struct FillToUnaryZero;

impl RewritePattern for FillToUnaryZero {
    fn name(&self) -> &'static str {
        "fill-to-unary-zero"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let matched = match_zero_fill_2d(program, op)?;
        let mut call = unary_call(program, UnaryKind::Zero, matched.inputs[0], matched.output)?;
        set_unary_flags(&mut call, UnaryFlags::BcastScalar);
        call.replace(program, op);
        debug!("Lowered zero fill {op} to a unary kernel");
        Ok(())
    }
}

/// A 2-D `linalg.transpose` becomes a TRANSPOSE kernel, described by its input dims.
struct TransposeToUnary;

impl RewritePattern for TransposeToUnary {
    fn name(&self) -> &'static str {
        "transpose-to-unary"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let matched = match_transpose_2d(program, op)?;
        let mut call = unary_call(program, UnaryKind::Transpose, matched.inputs[0], matched.output)?;
        set_unary_flags(&mut call, UnaryFlags::None);
        if let XsmmOp::UnaryDispatch { dims, .. } = &mut call.dispatch {
            dims.swap(0, 1);
        }
        call.replace(program, op);
        debug!("Lowered transpose {op} to a unary kernel");
        Ok(())
    }
}

/// A relu generic on 2-D buffers becomes a RELU kernel; the broadcast comes from the input's
/// indexing map.
struct ReluToUnary<'a> {
    zero: &'a ZeroSearch,
}

impl RewritePattern for ReluToUnary<'_> {
    fn name(&self) -> &'static str {
        "relu-to-unary"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let matched = match_relu_2d(program, op, self.zero)?;
        let input = matched.inputs[0];
        let s = Structured::get(program, op).ok_or(NotApplicable(NotApplicableReason::NotStructured))?;
        let idx = s
            .operands()
            .iter()
            .position(|v| *v == input)
            .ok_or(NotApplicable(NotApplicableReason::OperandCount))?;
        let flag = broadcast_from_map(&s.matching_indexing_map(idx))?.unary_flag();
        let mut call = unary_call(program, UnaryKind::Relu, input, matched.output)?;
        set_unary_flags(&mut call, flag);
        call.replace(program, op);
        debug!("Lowered relu {op} to a unary kernel");
        Ok(())
    }
}

#[derive(Default)]
pub struct ConvertLinalgToXsmm {
    pub zero: ZeroSearch,
    pub greedy: GreedyConfig,
}

impl Pass for ConvertLinalgToXsmm {
    fn name(&self) -> &'static str {
        "convert-linalg-to-xsmm"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let relu = ReluToUnary { zero: &self.zero };
        let patterns: [&dyn RewritePattern; 3] = [&FillToUnaryZero, &TransposeToUnary, &relu];
        let mut total = 0;
        for func in program.functions() {
            total += apply_patterns_greedily(program, func, &patterns, &self.greedy)?;
        }
        Ok(total)
    }
}

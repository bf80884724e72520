//! `convert-tpp-to-xsmm`: every tpp op becomes a kernel dispatch followed by an invoke.

use crate::dialect::arith;
use crate::dialect::tpp::TppOp;
use crate::dialect::xsmm::{self, BinaryFlags, BinaryKind, GemmFlags, UnaryKind, XsmmOp};
use crate::ir::{Builder, OpId, Program, ValueId};
use crate::matchers::{NotApplicable, NotApplicableReason};
use crate::passes::kernel_info::{
    binary_info, brgemm_info, broadcast_from_types, data_type, gemm_info, unary_info,
};
use crate::passes::{apply_patterns_greedily, GreedyConfig, Pass, PassError, RewritePattern};

use log::debug;

/// A dispatch, the invoke that runs it and the invoke's non-handle operands.
pub(crate) struct KernelCall {
    pub dispatch: XsmmOp,
    pub invoke: XsmmOp,
    pub operands: Vec<ValueId>,
    /// Brgemm batch count, passed as a trailing `i64` operand.
    pub batch: Option<i64>,
}

impl KernelCall {
    /// Emits the dispatch and invoke before `op` and erases `op`.
    pub(crate) fn replace(self, program: &mut Program, op: OpId) -> OpId {
        let mut b = Builder::before(program, op);
        let handle = xsmm::dispatch(&mut b, self.dispatch);
        let mut operands = self.operands;
        if let Some(batch) = self.batch {
            operands.push(arith::constant_i64(&mut b, batch));
        }
        let invoke = xsmm::invoke(&mut b, self.invoke, handle, &operands);
        b.erase_op(op);
        invoke
    }
}

fn shaped_output(program: &Program, output: ValueId) -> Result<&crate::ir::ShapedType, NotApplicable> {
    program
        .shaped_type(output)
        .ok_or(NotApplicable(NotApplicableReason::NotBuffers))
}

pub(crate) fn unary_call(
    program: &Program,
    kind: UnaryKind,
    input: ValueId,
    output: ValueId,
) -> Result<KernelCall, NotApplicable> {
    let info = unary_info(program, input, output)?;
    let flags = broadcast_from_types(program.value_type(input), shaped_output(program, output)?)?
        .unary_flag();
    let dtype = data_type(program, output)?;
    Ok(KernelCall {
        dispatch: XsmmOp::UnaryDispatch {
            kind,
            dims: info.dims(),
            flags,
            dtype,
        },
        invoke: XsmmOp::Unary { kind, dtype },
        operands: vec![input, output],
        batch: None,
    })
}

fn binary_call(
    program: &Program,
    kind: BinaryKind,
    lhs: ValueId,
    rhs: ValueId,
    output: ValueId,
) -> Result<KernelCall, NotApplicable> {
    let info = binary_info(program, lhs, rhs, output)?;
    let out_ty = shaped_output(program, output)?;
    let mut flags = vec![];
    for (idx, input) in [lhs, rhs].into_iter().enumerate() {
        let flag = broadcast_from_types(program.value_type(input), out_ty)?.binary_flag(idx);
        if flag != BinaryFlags::None {
            flags.push(flag);
        }
    }
    if flags.is_empty() {
        flags.push(BinaryFlags::None);
    }
    let dtype = data_type(program, output)?;
    Ok(KernelCall {
        dispatch: XsmmOp::BinaryDispatch {
            kind,
            dims: info.dims(),
            flags,
            dtype,
        },
        invoke: XsmmOp::Binary { kind, dtype },
        operands: vec![lhs, rhs, output],
        batch: None,
    })
}

fn gemm_flags(vnni: bool) -> Vec<GemmFlags> {
    vec![if vnni { GemmFlags::VnniB } else { GemmFlags::None }]
}

/// The kernel call replacing a tpp op.
fn kernel_call(program: &Program, op: OpId) -> Result<KernelCall, NotApplicable> {
    let tpp = program
        .kind(op)
        .as_tpp()
        .ok_or(NotApplicable(NotApplicableReason::Other(Some("not a tpp op"))))?;
    let operands = program.operands(op);
    match (tpp, operands) {
        (TppOp::Identity, [input, output]) => {
            unary_call(program, UnaryKind::Identity, *input, *output)
        }
        (TppOp::Relu, [input, output]) => unary_call(program, UnaryKind::Relu, *input, *output),
        (TppOp::Add, [lhs, rhs, output]) => {
            binary_call(program, BinaryKind::Add, *lhs, *rhs, *output)
        }
        (TppOp::Matmul | TppOp::VnniMatmul, [a, b, c]) => {
            let vnni = tpp == TppOp::VnniMatmul;
            let info = gemm_info(program, *a, *b, *c, vnni)?;
            let dtype = data_type(program, *c)?;
            Ok(KernelCall {
                dispatch: XsmmOp::GemmDispatch {
                    dims: info.dims(),
                    flags: gemm_flags(vnni),
                    dtype,
                },
                invoke: XsmmOp::Gemm { dtype },
                operands: vec![*a, *b, *c],
                batch: None,
            })
        }
        (TppOp::Brgemm | TppOp::VnniBrgemm, [a, b, c]) => {
            let vnni = tpp == TppOp::VnniBrgemm;
            let info = brgemm_info(program, *a, *b, *c, vnni)?;
            let dtype = data_type(program, *c)?;
            Ok(KernelCall {
                dispatch: XsmmOp::BrgemmDispatch {
                    dims: info.dims(),
                    flags: gemm_flags(vnni),
                    dtype,
                },
                invoke: XsmmOp::Brgemm { dtype },
                operands: vec![*a, *b, *c],
                batch: Some(info.batch),
            })
        }
        _ => Err(NotApplicable(NotApplicableReason::OperandCount)),
    }
}

struct TppToXsmm;

impl RewritePattern for TppToXsmm {
    fn name(&self) -> &'static str {
        "tpp-to-xsmm"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let call = kernel_call(program, op)?;
        let name = program.kind(op).name();
        let invoke = call.replace(program, op);
        debug!("Lowered {name} {op} to {invoke}");
        Ok(())
    }
}

#[derive(Default)]
pub struct ConvertTppToXsmm {
    pub greedy: GreedyConfig,
}

impl Pass for ConvertTppToXsmm {
    fn name(&self) -> &'static str {
        "convert-tpp-to-xsmm"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let mut total = 0;
        for func in program.functions() {
            total += apply_patterns_greedily(program, func, &[&TppToXsmm], &self.greedy)?;
        }
        Ok(total)
    }
}

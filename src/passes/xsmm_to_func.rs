//! `convert-xsmm-to-func`: kernel ops become calls into the runtime library.
//!
//! A dispatch becomes `func.call @xsmm_<class>_dispatch(args..) -> i64`, with every attribute
//! passed as an `i64` constant. An invoke becomes `func.call @xsmm_<class>_invoke(dtype, handle,
//! operands..)`. Each callee is declared once, as a private function, with the signature of its
//! first call site.

use crate::common::Dtype;
use crate::dialect::arith;
use crate::dialect::func::{self, FunctionType};
use crate::dialect::xsmm::XsmmOp;
use crate::ir::{Builder, OpId, Program, Type, ValueId};
use crate::matchers::{NotApplicable, NotApplicableReason};
use crate::passes::{apply_patterns_greedily, GreedyConfig, Pass, PassError, RewritePattern};

use log::debug;

pub fn runtime_symbol(op: &XsmmOp) -> String {
    let suffix = if op.is_dispatch() { "dispatch" } else { "invoke" };
    format!("xsmm_{}_{suffix}", op.class())
}

fn emit_call(program: &mut Program, op: OpId, callee: &str, args: Vec<ValueId>, results: Vec<Type>) -> OpId {
    let signature = FunctionType {
        inputs: args.iter().map(|a| program.value_type(*a).clone()).collect(),
        results: results.clone(),
    };
    func::declare_private(program, callee, signature);
    let mut b = Builder::before(program, op);
    func::call(&mut b, callee, &args, results)
}

struct XsmmToFunc;

impl RewritePattern for XsmmToFunc {
    fn name(&self) -> &'static str {
        "xsmm-to-func"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let xsmm = program
            .kind(op)
            .as_xsmm()
            .cloned()
            .ok_or(NotApplicable(NotApplicableReason::Other(Some("not an xsmm op"))))?;
        let callee = runtime_symbol(&xsmm);
        let call = match xsmm.dispatch_args() {
            Some(consts) => {
                let mut b = Builder::before(program, op);
                let args: Vec<ValueId> = consts.into_iter().map(|c| arith::constant_i64(&mut b, c)).collect();
                let call = emit_call(program, op, &callee, args, vec![Type::Scalar(Dtype::Sint64)]);
                let handle = program.result(call, 0);
                program.replace_op(op, &[handle]);
                call
            }
            None => {
                let mut b = Builder::before(program, op);
                let dtype = arith::constant_i64(&mut b, xsmm.dtype().code());
                let args: Vec<ValueId> = [dtype]
                    .into_iter()
                    .chain(program.operands(op).iter().copied())
                    .collect();
                let call = emit_call(program, op, &callee, args, vec![]);
                program.erase_op(op);
                call
            }
        };
        debug!("Lowered {} {op} to a call of @{callee} ({call})", xsmm.name());
        Ok(())
    }
}

#[derive(Default)]
pub struct ConvertXsmmToFunc {
    pub greedy: GreedyConfig,
}

impl Pass for ConvertXsmmToFunc {
    fn name(&self) -> &'static str {
        "convert-xsmm-to-func"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let mut total = 0;
        for func in program.functions() {
            total += apply_patterns_greedily(program, func, &[&XsmmToFunc], &self.greedy)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::func::FuncOp;
    use crate::dialect::xsmm::{self, DataType, UnaryFlags, UnaryKind};
    use crate::ir::OpKind;
    use crate::shape;

    #[test]
    fn test_runtime_symbols() {
        let dispatch = XsmmOp::GemmDispatch {
            dims: vec![4; 6],
            flags: vec![],
            dtype: DataType::F32,
        };
        assert_eq!(runtime_symbol(&dispatch), "xsmm_gemm_dispatch");
        assert_eq!(
            runtime_symbol(&XsmmOp::Binary {
                kind: xsmm::BinaryKind::Add,
                dtype: DataType::BF16
            }),
            "xsmm_binary_invoke"
        );
    }

    #[test]
    fn test_dispatch_and_invoke_become_calls() {
        let buf = Type::memref(shape![8, 16], Dtype::Float32);
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[buf.clone(), buf.clone()], &[]);
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let relu_dispatch = XsmmOp::UnaryDispatch {
            kind: UnaryKind::Relu,
            dims: vec![8, 16, 16, 16],
            flags: UnaryFlags::None,
            dtype: DataType::F32,
        };
        let expected_args = relu_dispatch.dispatch_args().unwrap();
        for _ in 0..2 {
            let handle = xsmm::dispatch(&mut b, relu_dispatch.clone());
            xsmm::invoke(
                &mut b,
                XsmmOp::Unary {
                    kind: UnaryKind::Relu,
                    dtype: DataType::F32,
                },
                handle,
                &args,
            );
        }

        assert_eq!(ConvertXsmmToFunc::default().run(&mut program), Ok(4));
        assert!(program
            .walk(program.module())
            .into_iter()
            .all(|op| program.kind(op).as_xsmm().is_none()));

        let calls: Vec<OpId> = program
            .block_ops(body)
            .iter()
            .copied()
            .filter(|op| matches!(program.kind(*op), OpKind::Func(FuncOp::Call { .. })))
            .collect();
        assert_eq!(calls.len(), 4);
        let dispatch_args: Vec<Option<i64>> = program
            .operands(calls[0])
            .iter()
            .map(|v| arith::constant_int_value(&program, *v))
            .collect();
        assert_eq!(dispatch_args, expected_args.into_iter().map(Some).collect::<Vec<_>>());

        let invoke_operands = program.operands(calls[1]);
        assert_eq!(
            arith::constant_int_value(&program, invoke_operands[0]),
            Some(DataType::F32.code())
        );
        assert_eq!(invoke_operands[1], program.result(calls[0], 0));
        assert_eq!(invoke_operands[2..], args[..]);

        let decl = program.lookup_function("xsmm_unary_invoke").unwrap();
        match program.kind(decl) {
            OpKind::Func(FuncOp::Func {
                signature, private, ..
            }) => {
                assert!(*private);
                assert_eq!(
                    signature.inputs,
                    vec![Type::Scalar(Dtype::Sint64), Type::Scalar(Dtype::Sint64), buf.clone(), buf]
                );
                assert!(signature.results.is_empty());
            }
            other => panic!("expected a declaration, got {other:?}"),
        }
        let declarations = program
            .block_ops(program.module_body())
            .iter()
            .filter(|f| program.regions(**f).is_empty())
            .count();
        assert_eq!(declarations, 2);
    }
}

use crate::ir::{Builder, InsertPoint, OpId, OpKind, Program, Type, ValueId};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunctionType {
    pub inputs: Vec<Type>,
    pub results: Vec<Type>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum FuncOp {
    /// A function. Declarations have no region.
    Func {
        name: String,
        signature: FunctionType,
        private: bool,
    },
    Call {
        callee: String,
    },
    Return,
}

impl FuncOp {
    pub fn name(&self) -> &'static str {
        match self {
            FuncOp::Func { .. } => "func.func",
            FuncOp::Call { .. } => "func.call",
            FuncOp::Return => "func.return",
        }
    }
}

pub fn call(b: &mut Builder, callee: &str, args: &[ValueId], results: Vec<Type>) -> OpId {
    b.create(
        OpKind::Func(FuncOp::Call {
            callee: callee.to_string(),
        }),
        args,
        results,
        vec![],
    )
}

pub fn return_(b: &mut Builder, values: &[ValueId]) -> OpId {
    b.create(OpKind::Func(FuncOp::Return), values, vec![], vec![])
}

/// Declares a private external function at the start of the module unless a function with that
/// name already exists. Returns the existing or new op.
pub fn declare_private(program: &mut Program, name: &str, signature: FunctionType) -> OpId {
    if let Some(existing) = program.lookup_function(name) {
        return existing;
    }
    let decl = program.create_op(
        OpKind::Func(FuncOp::Func {
            name: name.to_string(),
            signature,
            private: true,
        }),
        &[],
        vec![],
        vec![],
    );
    let body = program.module_body();
    let ip = match program.block_ops(body).first() {
        Some(first) => InsertPoint::Before(*first),
        None => InsertPoint::End(body),
    };
    program.insert_op(ip, decl);
    decl
}

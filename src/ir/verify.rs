use crate::common::Dtype;
use crate::dialect::pack::PackError;
use crate::dialect::scf::ScfOp;
use crate::dialect::{linalg, pack, tpp, xsmm};
use crate::ir::{OpId, OpKind, Program, ValueDef};

use std::fmt;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Malformed operation: {0}")]
    Malformed(String),
    #[error("Region is missing its terminator")]
    MissingTerminator,
    #[error("{0:?} is not a permutation")]
    InvalidPermutation(Vec<usize>),
    #[error("Element types differ: {0} vs. {1}")]
    ElementTypeMismatch(Dtype, Dtype),
    #[error("Expected type {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("Dynamic shape {0} is not supported here")]
    DynamicShape(String),
    #[error("Operand #{0} refers to an erased or detached value")]
    DanglingOperand(usize),
    #[error(transparent)]
    Pack(#[from] PackError),
}

/// A verification failure attached to the operation it was found on.
#[derive(Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub op: OpId,
    pub op_name: &'static str,
    pub error: VerifyError,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({}): {}", self.op_name, self.op, self.error)
    }
}

/// Verifies a single operation.
pub fn verify_op(program: &Program, op: OpId) -> Result<(), VerifyError> {
    for (idx, operand) in program.operands(op).iter().enumerate() {
        let live = match program.value_def(*operand) {
            ValueDef::OpResult { op: def, .. } => {
                !program.is_erased(def) && program.parent_block(def).is_some()
            }
            ValueDef::BlockArg { block, .. } => program
                .block_parent_op(block)
                .map_or(false, |owner| !program.is_erased(owner)),
        };
        if !live {
            return Err(VerifyError::DanglingOperand(idx));
        }
    }
    match program.kind(op) {
        OpKind::Linalg(_) => linalg::verify(program, op),
        OpKind::Tensor(_) => pack::verify(program, op),
        OpKind::Tpp(_) => tpp::verify(program, op),
        OpKind::Xsmm(_) => xsmm::verify(program, op),
        OpKind::Scf(ScfOp::For) => {
            let body = program.regions(op)[0];
            match program.terminator(body) {
                Some(t) if *program.kind(t) == OpKind::Scf(ScfOp::Yield) => Ok(()),
                _ => Err(VerifyError::MissingTerminator),
            }
        }
        _ => Ok(()),
    }
}

/// Verifies every live operation in the program and returns the failures.
pub fn verify(program: &Program) -> Vec<Diagnostic> {
    program
        .walk(program.module())
        .into_iter()
        .filter_map(|op| {
            verify_op(program, op).err().map(|error| Diagnostic {
                op,
                op_name: program.kind(op).name(),
                error,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{arith, memref};
    use crate::ir::{Builder, Type};
    use crate::shape;

    #[test]
    fn test_dangling_operand_is_reported() {
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[], &[]);
        let mut b = Builder::at_end(&mut program, body);
        let buf = memref::alloc(&mut b, shape![4], Dtype::Float32);
        memref::dealloc(&mut b, buf);
        let alloc_op = program.defining_op(buf).unwrap();
        program.erase_op(alloc_op);
        let diags = verify(&program);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].op_name, "memref.dealloc");
        assert_eq!(diags[0].error, VerifyError::DanglingOperand(0));
    }

    #[test]
    fn test_clean_program_verifies() {
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[Type::Index], &[]);
        let mut b = Builder::at_end(&mut program, body);
        arith::constant_index(&mut b, 1);
        assert!(verify(&program).is_empty());
    }
}

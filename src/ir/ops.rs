use crate::dialect::arith::ArithOp;
use crate::dialect::func::FuncOp;
use crate::dialect::linalg::LinalgOp;
use crate::dialect::memref::MemRefOp;
use crate::dialect::scf::ScfOp;
use crate::dialect::tensor::TensorOp;
use crate::dialect::tpp::TppOp;
use crate::dialect::xsmm::XsmmOp;

use serde::{Deserialize, Serialize};

/// The kind of an operation together with its attributes.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum OpKind {
    Module,
    Func(FuncOp),
    Arith(ArithOp),
    Linalg(LinalgOp),
    MemRef(MemRefOp),
    Tensor(TensorOp),
    Scf(ScfOp),
    Tpp(TppOp),
    Xsmm(XsmmOp),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Module => "builtin.module",
            OpKind::Func(op) => op.name(),
            OpKind::Arith(op) => op.name(),
            OpKind::Linalg(op) => op.name(),
            OpKind::MemRef(op) => op.name(),
            OpKind::Tensor(op) => op.name(),
            OpKind::Scf(op) => op.name(),
            OpKind::Tpp(op) => op.name(),
            OpKind::Xsmm(op) => op.name(),
        }
    }

    /// Returns `true` if an operation of this kind can be erased once its results are unused.
    ///
    /// Operations writing to buffers (including structured ops with buffer operands) are never
    /// removable. That case is decided by the caller, which knows the operand types.
    pub fn is_pure(&self) -> bool {
        match self {
            OpKind::Module | OpKind::Func(_) | OpKind::Scf(_) | OpKind::Tpp(_) => false,
            OpKind::Arith(_) | OpKind::Tensor(_) => true,
            OpKind::Linalg(op) => !matches!(op, LinalgOp::Yield),
            OpKind::MemRef(op) => matches!(
                op,
                MemRefOp::SubView(_)
                    | MemRefOp::CollapseShape { .. }
                    | MemRefOp::ExpandShape { .. }
                    | MemRefOp::Load
                    | MemRefOp::Alloc
            ),
            OpKind::Xsmm(op) => op.is_dispatch(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            OpKind::Func(FuncOp::Return) | OpKind::Linalg(LinalgOp::Yield) | OpKind::Scf(ScfOp::Yield)
        )
    }

    pub fn as_linalg(&self) -> Option<&LinalgOp> {
        match self {
            OpKind::Linalg(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_arith(&self) -> Option<&ArithOp> {
        match self {
            OpKind::Arith(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_tpp(&self) -> Option<TppOp> {
        match self {
            OpKind::Tpp(op) => Some(*op),
            _ => None,
        }
    }

    pub fn as_xsmm(&self) -> Option<&XsmmOp> {
        match self {
            OpKind::Xsmm(op) => Some(op),
            _ => None,
        }
    }

    pub fn is_scf_for(&self) -> bool {
        matches!(self, OpKind::Scf(ScfOp::For))
    }
}

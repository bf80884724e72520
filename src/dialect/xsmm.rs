//! Kernel-library calls split into a `dispatch`, which JIT-compiles (or looks up) a kernel for
//! fixed sizes and returns an `i64` handle, and an `invoke`, which runs it on buffers.
//!
//! Dispatch ops take no SSA operands. Invoke operands are the handle followed by the buffers
//! (and, for brgemm, the batch count).

use crate::common::Dtype;
use crate::ir::verify::VerifyError;
use crate::ir::{Builder, OpId, OpKind, Program, Type, ValueId};
use crate::utils::join_into_string;

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::Display;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    F32 = 1,
    BF16 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryKind {
    Identity = 1,
    Zero = 2,
    Relu = 3,
    Transpose = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryKind {
    Add = 1,
    Sub = 2,
    Mul = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryFlags {
    None = 0,
    BcastRow = 2,
    BcastCol = 4,
    BcastScalar = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryFlags {
    None = 0,
    BcastRowIn0 = 1,
    BcastColIn0 = 2,
    BcastScalarIn0 = 4,
    BcastRowIn1 = 8,
    BcastColIn1 = 16,
    BcastScalarIn1 = 32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum GemmFlags {
    None = 0,
    Beta0 = 4,
    VnniA = 2048,
    VnniB = 4096,
    VnniC = 8192,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum XsmmOp {
    /// Dims are `[m, n, ldi, ldo]`.
    UnaryDispatch {
        kind: UnaryKind,
        dims: Vec<i64>,
        flags: UnaryFlags,
        dtype: DataType,
    },
    /// Dims are `[m, n, ldi_lhs, ldi_rhs, ldo]`.
    BinaryDispatch {
        kind: BinaryKind,
        dims: Vec<i64>,
        flags: Vec<BinaryFlags>,
        dtype: DataType,
    },
    /// Dims are `[m, n, k, lda, ldb, ldc]`.
    GemmDispatch {
        dims: Vec<i64>,
        flags: Vec<GemmFlags>,
        dtype: DataType,
    },
    /// Dims are `[m, n, k, lda, ldb, ldc, stride_a, stride_b]`.
    BrgemmDispatch {
        dims: Vec<i64>,
        flags: Vec<GemmFlags>,
        dtype: DataType,
    },
    Unary {
        kind: UnaryKind,
        dtype: DataType,
    },
    Binary {
        kind: BinaryKind,
        dtype: DataType,
    },
    Gemm {
        dtype: DataType,
    },
    Brgemm {
        dtype: DataType,
    },
}

impl DataType {
    /// The kernel data type of an element type; other types have no kernels.
    pub fn from_dtype(dtype: Dtype) -> Option<DataType> {
        match dtype {
            Dtype::Float32 => Some(DataType::F32),
            Dtype::Bfloat16 => Some(DataType::BF16),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

macro_rules! impl_code {
    ($($t:ty),*) => {
        $(impl $t {
            pub fn code(self) -> i64 {
                self as i64
            }
        })*
    };
}

impl_code!(UnaryKind, BinaryKind, UnaryFlags, BinaryFlags, GemmFlags);

impl XsmmOp {
    pub fn name(&self) -> &'static str {
        match self {
            XsmmOp::UnaryDispatch { .. } => "xsmm.unary.dispatch",
            XsmmOp::BinaryDispatch { .. } => "xsmm.binary.dispatch",
            XsmmOp::GemmDispatch { .. } => "xsmm.gemm.dispatch",
            XsmmOp::BrgemmDispatch { .. } => "xsmm.brgemm.dispatch",
            XsmmOp::Unary { .. } => "xsmm.unary",
            XsmmOp::Binary { .. } => "xsmm.binary",
            XsmmOp::Gemm { .. } => "xsmm.gemm",
            XsmmOp::Brgemm { .. } => "xsmm.brgemm",
        }
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(
            self,
            XsmmOp::UnaryDispatch { .. }
                | XsmmOp::BinaryDispatch { .. }
                | XsmmOp::GemmDispatch { .. }
                | XsmmOp::BrgemmDispatch { .. }
        )
    }

    /// The kernel class used in runtime symbol names: `unary`, `binary`, `gemm` or `brgemm`.
    pub fn class(&self) -> &'static str {
        match self {
            XsmmOp::UnaryDispatch { .. } | XsmmOp::Unary { .. } => "unary",
            XsmmOp::BinaryDispatch { .. } | XsmmOp::Binary { .. } => "binary",
            XsmmOp::GemmDispatch { .. } | XsmmOp::Gemm { .. } => "gemm",
            XsmmOp::BrgemmDispatch { .. } | XsmmOp::Brgemm { .. } => "brgemm",
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            XsmmOp::UnaryDispatch { dtype, .. }
            | XsmmOp::BinaryDispatch { dtype, .. }
            | XsmmOp::GemmDispatch { dtype, .. }
            | XsmmOp::BrgemmDispatch { dtype, .. }
            | XsmmOp::Unary { dtype, .. }
            | XsmmOp::Binary { dtype, .. }
            | XsmmOp::Gemm { dtype }
            | XsmmOp::Brgemm { dtype } => *dtype,
        }
    }

    /// The `i64` arguments a dispatch passes to the runtime: kind (if any), dims, flags and
    /// data type.
    pub fn dispatch_args(&self) -> Option<Vec<i64>> {
        let mut args = vec![];
        match self {
            XsmmOp::UnaryDispatch {
                kind,
                dims,
                flags,
                dtype,
            } => {
                args.push(kind.code());
                args.extend(dims);
                args.push(flags.code());
                args.push(dtype.code());
            }
            XsmmOp::BinaryDispatch {
                kind,
                dims,
                flags,
                dtype,
            } => {
                args.push(kind.code());
                args.extend(dims);
                args.push(flags.iter().map(|f| f.code()).fold(0, |a, f| a | f));
                args.push(dtype.code());
            }
            XsmmOp::GemmDispatch { dims, flags, dtype }
            | XsmmOp::BrgemmDispatch { dims, flags, dtype } => {
                args.extend(dims);
                args.push(flags.iter().map(|f| f.code()).fold(0, |a, f| a | f));
                args.push(dtype.code());
            }
            _ => return None,
        }
        Some(args)
    }

    fn expected_dims(&self) -> Option<usize> {
        match self {
            XsmmOp::UnaryDispatch { .. } => Some(4),
            XsmmOp::BinaryDispatch { .. } => Some(5),
            XsmmOp::GemmDispatch { .. } => Some(6),
            XsmmOp::BrgemmDispatch { .. } => Some(8),
            _ => None,
        }
    }

    fn dims(&self) -> Option<&[i64]> {
        match self {
            XsmmOp::UnaryDispatch { dims, .. }
            | XsmmOp::BinaryDispatch { dims, .. }
            | XsmmOp::GemmDispatch { dims, .. }
            | XsmmOp::BrgemmDispatch { dims, .. } => Some(dims),
            _ => None,
        }
    }
}

impl fmt::Display for XsmmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XsmmOp::UnaryDispatch {
                kind, dims, flags, ..
            } => write!(f, "{kind} [{}] flags = ({flags})", join_into_string(dims, ", ")),
            XsmmOp::BinaryDispatch {
                kind, dims, flags, ..
            } => write!(
                f,
                "{kind} [{}] flags = ({})",
                join_into_string(dims, ", "),
                join_into_string(flags, ", ")
            ),
            XsmmOp::GemmDispatch { dims, flags, .. }
            | XsmmOp::BrgemmDispatch { dims, flags, .. } => write!(
                f,
                "[{}] flags = ({})",
                join_into_string(dims, ", "),
                join_into_string(flags, ", ")
            ),
            XsmmOp::Unary { kind, .. } => write!(f, "{kind}"),
            XsmmOp::Binary { kind, .. } => write!(f, "{kind}"),
            XsmmOp::Gemm { .. } | XsmmOp::Brgemm { .. } => Ok(()),
        }?;
        write!(f, " data_type = {}", self.dtype())
    }
}

/// Creates a dispatch op and returns its `i64` handle.
pub fn dispatch(b: &mut Builder, op: XsmmOp) -> ValueId {
    debug_assert!(op.is_dispatch());
    b.create_value(OpKind::Xsmm(op), &[], Type::Scalar(Dtype::Sint64))
}

/// Creates an invoke op.
pub fn invoke(b: &mut Builder, op: XsmmOp, handle: ValueId, operands: &[ValueId]) -> OpId {
    debug_assert!(!op.is_dispatch());
    let all: Vec<ValueId> = [handle].into_iter().chain(operands.iter().copied()).collect();
    b.create(OpKind::Xsmm(op), &all, vec![], vec![])
}

pub fn verify(program: &Program, op: OpId) -> Result<(), VerifyError> {
    let Some(xsmm) = program.kind(op).as_xsmm() else {
        return Ok(());
    };
    let operands = program.operands(op);
    if xsmm.is_dispatch() {
        if !operands.is_empty() {
            return Err(VerifyError::Malformed("dispatch takes no operands".into()));
        }
        if let (Some(dims), Some(expected)) = (xsmm.dims(), xsmm.expected_dims()) {
            if dims.len() != expected {
                return Err(VerifyError::Malformed(format!(
                    "{} expects {expected} dims, got {}",
                    xsmm.name(),
                    dims.len()
                )));
            }
        }
        return Ok(());
    }
    let expected_operands = match xsmm {
        XsmmOp::Unary { .. } => 3,
        XsmmOp::Binary { .. } | XsmmOp::Gemm { .. } => 4,
        XsmmOp::Brgemm { .. } => 5,
        _ => unreachable!(),
    };
    if operands.len() != expected_operands {
        return Err(VerifyError::Malformed(format!(
            "{} expects {expected_operands} operands, got {}",
            xsmm.name(),
            operands.len()
        )));
    }
    if program.value_type(operands[0]) != &Type::Scalar(Dtype::Sint64) {
        return Err(VerifyError::Malformed(
            "first invoke operand must be an i64 handle".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_args_layout() {
        let op = XsmmOp::BinaryDispatch {
            kind: BinaryKind::Add,
            dims: vec![4, 8, 8, 1, 8],
            flags: vec![BinaryFlags::BcastRowIn1, BinaryFlags::BcastScalarIn0],
            dtype: DataType::BF16,
        };
        assert_eq!(op.dispatch_args(), Some(vec![1, 4, 8, 8, 1, 8, 12, 2]));
        assert_eq!(op.class(), "binary");
        assert_eq!(
            XsmmOp::Gemm {
                dtype: DataType::F32
            }
            .dispatch_args(),
            None
        );
    }

    #[test]
    fn test_display() {
        let op = XsmmOp::UnaryDispatch {
            kind: UnaryKind::Relu,
            dims: vec![4, 8, 8, 8],
            flags: UnaryFlags::BcastCol,
            dtype: DataType::F32,
        };
        assert_eq!(
            op.to_string(),
            "relu [4, 8, 8, 8] flags = (bcast_col) data_type = f32"
        );
    }
}

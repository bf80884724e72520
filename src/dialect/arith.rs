use crate::common::Dtype;
use crate::ir::{Builder, OpKind, Program, Type, ValueId};

use half::bf16;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub enum Literal {
    Float(f64),
    Int(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub enum ArithOp {
    Constant(Literal),
    AddF,
    AddI,
    SubF,
    MulF,
    MulI,
    MaxF,
    ExtF,
    TruncF,
    IndexCast,
}

impl ArithOp {
    pub fn name(&self) -> &'static str {
        match self {
            ArithOp::Constant(_) => "arith.constant",
            ArithOp::AddF => "arith.addf",
            ArithOp::AddI => "arith.addi",
            ArithOp::SubF => "arith.subf",
            ArithOp::MulF => "arith.mulf",
            ArithOp::MulI => "arith.muli",
            ArithOp::MaxF => "arith.maxf",
            ArithOp::ExtF => "arith.extf",
            ArithOp::TruncF => "arith.truncf",
            ArithOp::IndexCast => "arith.index_cast",
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, ArithOp::AddF | ArithOp::AddI)
    }

    pub fn is_mul(&self) -> bool {
        matches!(self, ArithOp::MulF | ArithOp::MulI)
    }

    /// Single-operand conversions.
    pub fn is_unary(&self) -> bool {
        matches!(self, ArithOp::ExtF | ArithOp::TruncF | ArithOp::IndexCast)
    }

    pub fn is_binary(&self) -> bool {
        !self.is_unary() && !matches!(self, ArithOp::Constant(_))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Float(v) => write!(f, "{v:e}"),
            Literal::Int(v) => write!(f, "{v}"),
        }
    }
}

/// Creates a constant of type `ty`. Float literals are rounded to the precision of `ty`.
pub fn constant(b: &mut Builder, literal: Literal, ty: Type) -> ValueId {
    let literal = match (literal, &ty) {
        (Literal::Float(v), Type::Scalar(Dtype::Bfloat16)) => {
            Literal::Float(bf16::from_f64(v).to_f64())
        }
        (Literal::Float(v), Type::Scalar(Dtype::Float16)) => {
            Literal::Float(half::f16::from_f64(v).to_f64())
        }
        (Literal::Float(v), Type::Scalar(Dtype::Float32)) => Literal::Float(f64::from(v as f32)),
        (l, _) => l,
    };
    b.create_value(OpKind::Arith(ArithOp::Constant(literal)), &[], ty)
}

pub fn constant_index(b: &mut Builder, value: i64) -> ValueId {
    constant(b, Literal::Int(value), Type::Index)
}

pub fn constant_i64(b: &mut Builder, value: i64) -> ValueId {
    constant(b, Literal::Int(value), Type::Scalar(Dtype::Sint64))
}

pub fn constant_float(b: &mut Builder, value: f64, dtype: Dtype) -> ValueId {
    debug_assert!(dtype.is_float());
    constant(b, Literal::Float(value), Type::Scalar(dtype))
}

/// Creates a binary arithmetic op whose result has the type of `lhs`.
pub fn binary(b: &mut Builder, op: ArithOp, lhs: ValueId, rhs: ValueId) -> ValueId {
    debug_assert!(op.is_binary());
    let ty = b.value_type(lhs).clone();
    b.create_value(OpKind::Arith(op), &[lhs, rhs], ty)
}

pub fn cast(b: &mut Builder, op: ArithOp, value: ValueId, to: Type) -> ValueId {
    debug_assert!(op.is_unary());
    b.create_value(OpKind::Arith(op), &[value], to)
}

/// Returns the literal if `value` is produced by a constant.
pub fn constant_value(program: &Program, value: ValueId) -> Option<Literal> {
    let op = program.defining_op(value)?;
    match program.kind(op) {
        OpKind::Arith(ArithOp::Constant(l)) => Some(*l),
        _ => None,
    }
}

pub fn constant_int_value(program: &Program, value: ValueId) -> Option<i64> {
    match constant_value(program, value)? {
        Literal::Int(v) => Some(v),
        Literal::Float(_) => None,
    }
}

/// Returns `true` for an integer zero or a float zero of either sign.
pub fn is_zero_constant(program: &Program, value: ValueId) -> bool {
    match constant_value(program, value) {
        Some(Literal::Int(v)) => v == 0,
        Some(Literal::Float(v)) => v == 0.0,
        None => false,
    }
}

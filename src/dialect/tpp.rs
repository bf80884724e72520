//! Tensor processing primitives: a fixed vocabulary of fused compute ops on buffers.
//!
//! Every tpp op takes its inputs followed by the output buffer and produces no results.

use crate::ir::verify::VerifyError;
use crate::ir::{Builder, OpId, OpKind, Program, Type, ValueId};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter)]
pub enum TppOp {
    Identity,
    Relu,
    Add,
    Matmul,
    VnniMatmul,
    Brgemm,
    VnniBrgemm,
}

/// The primitive a `linalg.generic` was recognized as, stored in its `library_call`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display, EnumString, EnumIter,
)]
pub enum PrimitiveKind {
    #[strum(serialize = "tpp.identity")]
    Identity,
    #[strum(serialize = "tpp.relu")]
    Relu,
    #[strum(serialize = "tpp.add")]
    Add,
    #[strum(serialize = "tpp.matmul")]
    Matmul,
    #[strum(serialize = "tpp.vnni_matmul")]
    VnniMatmul,
    #[strum(serialize = "tpp.brgemm")]
    Brgemm,
    #[strum(serialize = "tpp.vnni_brgemm")]
    VnniBrgemm,
    #[strum(serialize = "tpp.zero")]
    Zero,
    #[strum(serialize = "tpp.transpose")]
    Transpose,
}

impl TppOp {
    pub fn name(&self) -> &'static str {
        match self {
            TppOp::Identity => "tpp.identity",
            TppOp::Relu => "tpp.relu",
            TppOp::Add => "tpp.add",
            TppOp::Matmul => "tpp.matmul",
            TppOp::VnniMatmul => "tpp.vnni_matmul",
            TppOp::Brgemm => "tpp.brgemm",
            TppOp::VnniBrgemm => "tpp.vnni_brgemm",
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            TppOp::Identity | TppOp::Relu => 1,
            TppOp::Add | TppOp::Matmul | TppOp::VnniMatmul | TppOp::Brgemm | TppOp::VnniBrgemm => 2,
        }
    }

    /// Required ranks of the `(inputs.., output)` operands. `None` admits a scalar or any rank up
    /// to 2.
    fn operand_ranks(&self) -> &'static [Option<usize>] {
        match self {
            TppOp::Identity | TppOp::Relu => &[None, Some(2)],
            TppOp::Add => &[None, None, Some(2)],
            TppOp::Matmul => &[Some(2), Some(2), Some(2)],
            TppOp::VnniMatmul => &[Some(2), Some(3), Some(2)],
            TppOp::Brgemm => &[Some(3), Some(3), Some(2)],
            TppOp::VnniBrgemm => &[Some(3), Some(4), Some(2)],
        }
    }

    pub fn is_unary(&self) -> bool {
        self.num_inputs() == 1
    }
}

impl PrimitiveKind {
    /// The tpp op this primitive converts to. `Zero` and `Transpose` only lower directly to
    /// kernel calls.
    pub fn tpp_op(&self) -> Option<TppOp> {
        match self {
            PrimitiveKind::Identity => Some(TppOp::Identity),
            PrimitiveKind::Relu => Some(TppOp::Relu),
            PrimitiveKind::Add => Some(TppOp::Add),
            PrimitiveKind::Matmul => Some(TppOp::Matmul),
            PrimitiveKind::VnniMatmul => Some(TppOp::VnniMatmul),
            PrimitiveKind::Brgemm => Some(TppOp::Brgemm),
            PrimitiveKind::VnniBrgemm => Some(TppOp::VnniBrgemm),
            PrimitiveKind::Zero | PrimitiveKind::Transpose => None,
        }
    }
}

pub fn create(b: &mut Builder, op: TppOp, inputs: &[ValueId], output: ValueId) -> OpId {
    debug_assert_eq!(inputs.len(), op.num_inputs());
    let operands: Vec<ValueId> = inputs.iter().copied().chain([output]).collect();
    b.create(OpKind::Tpp(op), &operands, vec![], vec![])
}

/// Checks operand count, buffer semantics, static shapes, ranks and element types.
pub fn verify(program: &Program, op: OpId) -> Result<(), VerifyError> {
    let Some(tpp) = program.kind(op).as_tpp() else {
        return Ok(());
    };
    let operands = program.operands(op);
    let ranks = tpp.operand_ranks();
    if operands.len() != ranks.len() {
        return Err(VerifyError::Malformed(format!(
            "{} expects {} operands, got {}",
            tpp.name(),
            ranks.len(),
            operands.len()
        )));
    }
    let output = program
        .shaped_type(operands[operands.len() - 1])
        .ok_or_else(|| VerifyError::Malformed("output must be a buffer".into()))?;
    for (value, rank) in operands.iter().zip(ranks) {
        match (program.value_type(*value), rank) {
            (Type::Scalar(dtype), None) => {
                if *dtype != output.dtype {
                    return Err(VerifyError::ElementTypeMismatch(*dtype, output.dtype));
                }
            }
            (Type::Shaped(s), rank) => {
                if !s.is_memref() {
                    return Err(VerifyError::Malformed(format!(
                        "{} operates on buffers, got {s}",
                        tpp.name()
                    )));
                }
                if !s.has_static_shape() {
                    return Err(VerifyError::DynamicShape(s.to_string()));
                }
                let ok = match rank {
                    Some(r) => s.rank() == *r,
                    None => s.rank() <= 2,
                };
                if !ok {
                    return Err(VerifyError::Malformed(format!(
                        "unexpected operand rank {} for {}",
                        s.rank(),
                        tpp.name()
                    )));
                }
                if s.dtype != output.dtype {
                    return Err(VerifyError::ElementTypeMismatch(s.dtype, output.dtype));
                }
            }
            (other, _) => {
                return Err(VerifyError::Malformed(format!(
                    "unexpected operand type {other} for {}",
                    tpp.name()
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::shape;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_primitive_tags_round_trip_through_strings() {
        for kind in PrimitiveKind::iter() {
            let tag = kind.to_string();
            assert!(tag.starts_with("tpp."));
            assert_eq!(PrimitiveKind::from_str(&tag), Ok(kind));
        }
        assert!(PrimitiveKind::from_str("tpp.softmax").is_err());
    }

    #[test]
    fn test_tag_matches_op_mnemonic() {
        for op in TppOp::iter() {
            let kind = PrimitiveKind::from_str(op.name()).unwrap();
            assert_eq!(kind.tpp_op(), Some(op));
        }
    }

    #[test]
    fn test_verify_brgemm_ranks() {
        let mut program = Program::new();
        let m = |s| Type::memref(s, Dtype::Float32);
        let (_, body) = program.add_function(
            "f",
            &[m(shape![2, 4, 8]), m(shape![2, 8, 16]), m(shape![4, 16]), m(shape![4, 8])],
            &[],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let good = create(&mut b, TppOp::Brgemm, &[args[0], args[1]], args[2]);
        let bad = create(&mut b, TppOp::Brgemm, &[args[3], args[1]], args[2]);
        assert!(verify(&program, good).is_ok());
        assert!(matches!(verify(&program, bad), Err(VerifyError::Malformed(_))));
    }
}

//! Kernel call descriptors: sizes, leading dimensions and broadcast flags derived from operand
//! types and access maps.

use crate::common::{Dim, DimSize};
use crate::dialect::pack::vnni;
use crate::dialect::xsmm::{BinaryFlags, DataType, UnaryFlags};
use crate::ir::affine::{c, d, AffineMap};
use crate::ir::{Program, ShapedType, Type, ValueId};
use crate::matchers::NotApplicableReason;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UnaryInfo {
    pub m: i64,
    pub n: i64,
    pub ldi: i64,
    pub ldo: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BinaryInfo {
    pub m: i64,
    pub n: i64,
    pub ldi_lhs: i64,
    pub ldi_rhs: i64,
    pub ldo: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct GemmInfo {
    pub m: i64,
    pub n: i64,
    pub k: i64,
    pub lda: i64,
    pub ldb: i64,
    pub ldc: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrgemmInfo {
    pub gemm: GemmInfo,
    pub stride_a: i64,
    pub stride_b: i64,
    pub batch: i64,
}

/// How an input is broadcast over a 2-D output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Broadcast {
    None,
    Scalar,
    Row,
    Col,
}

impl UnaryInfo {
    pub fn dims(&self) -> Vec<i64> {
        vec![self.m, self.n, self.ldi, self.ldo]
    }
}

impl BinaryInfo {
    pub fn dims(&self) -> Vec<i64> {
        vec![self.m, self.n, self.ldi_lhs, self.ldi_rhs, self.ldo]
    }
}

impl GemmInfo {
    pub fn dims(&self) -> Vec<i64> {
        vec![self.m, self.n, self.k, self.lda, self.ldb, self.ldc]
    }
}

impl BrgemmInfo {
    pub fn dims(&self) -> Vec<i64> {
        let mut dims = self.gemm.dims();
        dims.extend([self.stride_a, self.stride_b]);
        dims
    }
}

impl Broadcast {
    pub fn unary_flag(self) -> UnaryFlags {
        match self {
            Broadcast::None => UnaryFlags::None,
            Broadcast::Scalar => UnaryFlags::BcastScalar,
            Broadcast::Row => UnaryFlags::BcastRow,
            Broadcast::Col => UnaryFlags::BcastCol,
        }
    }

    /// The binary flag for this broadcast on input `operand` (0 or 1).
    pub fn binary_flag(self, operand: usize) -> BinaryFlags {
        match (self, operand) {
            (Broadcast::None, _) => BinaryFlags::None,
            (Broadcast::Scalar, 0) => BinaryFlags::BcastScalarIn0,
            (Broadcast::Row, 0) => BinaryFlags::BcastRowIn0,
            (Broadcast::Col, 0) => BinaryFlags::BcastColIn0,
            (Broadcast::Scalar, _) => BinaryFlags::BcastScalarIn1,
            (Broadcast::Row, _) => BinaryFlags::BcastRowIn1,
            (Broadcast::Col, _) => BinaryFlags::BcastColIn1,
        }
    }
}

fn i64_of(size: DimSize) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Static strides of a buffer whose innermost stride is 1.
fn unit_strides(ty: &ShapedType) -> Result<Vec<i64>, NotApplicableReason> {
    let strides = ty
        .static_strides()
        .ok_or(NotApplicableReason::UnsupportedLayout("strides are not static"))?;
    if strides.last().copied().unwrap_or(1) != 1 {
        return Err(NotApplicableReason::UnsupportedLayout(
            "innermost stride is not 1",
        ));
    }
    Ok(strides.into_iter().map(i64_of).collect())
}

fn static_2d(ty: &ShapedType) -> Result<(i64, i64), NotApplicableReason> {
    match ty.shape[..] {
        [Dim::Static(m), Dim::Static(n)] => Ok((i64_of(m), i64_of(n))),
        [_, _] => Err(NotApplicableReason::DynamicShape),
        _ => Err(NotApplicableReason::UnsupportedRank(ty.rank())),
    }
}

fn shaped(program: &Program, value: ValueId) -> Result<&ShapedType, NotApplicableReason> {
    program
        .shaped_type(value)
        .ok_or(NotApplicableReason::UnsupportedLayout("operand is not shaped"))
}

fn input_ld(program: &Program, input: ValueId) -> Result<i64, NotApplicableReason> {
    match program.value_type(input) {
        Type::Shaped(s) => {
            if s.rank() > 2 {
                return Err(NotApplicableReason::UnsupportedRank(s.rank()));
            }
            // A rank-0 buffer behaves like a scalar.
            Ok(unit_strides(s)?.first().copied().unwrap_or(1))
        }
        _ => Ok(1),
    }
}

/// Derives the unary kernel descriptor. The output must be a rank-2 buffer with unit innermost
/// stride; the input may be a scalar, or a rank-1 or rank-2 buffer with unit innermost stride.
pub fn unary_info(
    program: &Program,
    input: ValueId,
    output: ValueId,
) -> Result<UnaryInfo, NotApplicableReason> {
    let out = shaped(program, output)?;
    let (m, n) = static_2d(out)?;
    let ldi = input_ld(program, input)?;
    let ldo = unit_strides(out)?[0];
    Ok(UnaryInfo { m, n, ldi, ldo })
}

pub fn binary_info(
    program: &Program,
    lhs: ValueId,
    rhs: ValueId,
    output: ValueId,
) -> Result<BinaryInfo, NotApplicableReason> {
    let out = shaped(program, output)?;
    let (m, n) = static_2d(out)?;
    Ok(BinaryInfo {
        m,
        n,
        ldi_lhs: input_ld(program, lhs)?,
        ldi_rhs: input_ld(program, rhs)?,
        ldo: unit_strides(out)?[0],
    })
}

fn vnni_factor(ty: &ShapedType, vnni: bool) -> Result<i64, NotApplicableReason> {
    if !vnni {
        return Ok(1);
    }
    let factor = vnni::blocking_factor(ty.dtype).ok_or(NotApplicableReason::UnsupportedElementType)?;
    if !vnni::is_vnni_packed(ty) {
        return Err(NotApplicableReason::UnsupportedLayout("operand is not VNNI packed"));
    }
    Ok(i64_of(factor))
}

/// Derives the GEMM descriptor for `C[m, n] += A[m, k] * B[k, n]`. With `vnni`, B is
/// `[k/v, n, v]` and `ldb` is expressed in (interleaved) rows of `n`.
pub fn gemm_info(
    program: &Program,
    a: ValueId,
    b: ValueId,
    c: ValueId,
    vnni: bool,
) -> Result<GemmInfo, NotApplicableReason> {
    let (a_ty, b_ty, c_ty) = (shaped(program, a)?, shaped(program, b)?, shaped(program, c)?);
    let (m, n) = static_2d(c_ty)?;
    let (_, k) = static_2d(a_ty)?;
    let factor = vnni_factor(b_ty, vnni)?;
    let expected_b_rank = if vnni { 3 } else { 2 };
    if b_ty.rank() != expected_b_rank {
        return Err(NotApplicableReason::UnsupportedRank(b_ty.rank()));
    }
    Ok(GemmInfo {
        m,
        n,
        k,
        lda: unit_strides(a_ty)?[0],
        ldb: unit_strides(b_ty)?[0] / factor,
        ldc: unit_strides(c_ty)?[0],
    })
}

/// Derives the batch-reduce GEMM descriptor for `C[m, n] += sum_b A[b, m, k] * B[b, k, n]`.
pub fn brgemm_info(
    program: &Program,
    a: ValueId,
    b: ValueId,
    c: ValueId,
    vnni: bool,
) -> Result<BrgemmInfo, NotApplicableReason> {
    let (a_ty, b_ty, c_ty) = (shaped(program, a)?, shaped(program, b)?, shaped(program, c)?);
    let (m, n) = static_2d(c_ty)?;
    if a_ty.rank() != 3 {
        return Err(NotApplicableReason::UnsupportedRank(a_ty.rank()));
    }
    let expected_b_rank = if vnni { 4 } else { 3 };
    if b_ty.rank() != expected_b_rank {
        return Err(NotApplicableReason::UnsupportedRank(b_ty.rank()));
    }
    let (batch, k) = match (a_ty.shape[0], a_ty.shape[2]) {
        (Dim::Static(batch), Dim::Static(k)) => (i64_of(batch), i64_of(k)),
        _ => return Err(NotApplicableReason::DynamicShape),
    };
    let factor = vnni_factor(b_ty, vnni)?;
    let a_strides = unit_strides(a_ty)?;
    let b_strides = unit_strides(b_ty)?;
    Ok(BrgemmInfo {
        gemm: GemmInfo {
            m,
            n,
            k,
            lda: a_strides[1],
            ldb: b_strides[1] / factor,
            ldc: unit_strides(c_ty)?[0],
        },
        stride_a: a_strides[0],
        stride_b: b_strides[0],
        batch,
    })
}

/// Classifies how an operand with access map `map` is broadcast over a 2-D iteration space.
pub fn broadcast_from_map(map: &AffineMap) -> Result<Broadcast, NotApplicableReason> {
    if map.num_results() > map.num_dims() as usize || map.num_dims() != 2 || map.num_symbols() != 0
    {
        return Err(NotApplicableReason::AccessPattern);
    }
    if map.num_results() == 0 {
        return Ok(Broadcast::Scalar);
    }
    let mut map = map.clone();
    while map.num_results() != map.num_dims() as usize {
        map = map.insert_result(c(0), 0);
    }
    if !map.is_projected_permutation(true) {
        return Err(NotApplicableReason::AccessPattern);
    }
    let mut broadcasted = vec![];
    if !map.is_minor_identity_with_broadcasting(&mut broadcasted) {
        return Err(NotApplicableReason::AccessPattern);
    }
    match broadcasted[..] {
        [] => Ok(Broadcast::None),
        [0] => Ok(Broadcast::Col),
        [_] => Ok(Broadcast::Row),
        _ => Err(NotApplicableReason::AccessPattern),
    }
}

/// Synthesizes the access map of `input` against a 2-D `output`, aligning trailing dims. An input
/// dim of size 1 against a larger output dim is broadcast (constant 0).
pub fn synthesized_map(input: &Type, output: &ShapedType) -> AffineMap {
    let out_rank = output.rank();
    let Type::Shaped(input) = input else {
        return AffineMap::new(out_rank as u32, 0, vec![]);
    };
    let in_rank = input.rank().min(out_rank);
    let lead = out_rank - in_rank;
    let results = input.shape[input.rank() - in_rank..]
        .iter()
        .enumerate()
        .map(|(i, dim)| {
            let j = lead + i;
            if *dim == Dim::Static(1) && output.shape[j] != Dim::Static(1) {
                c(0)
            } else {
                d(j as u32)
            }
        })
        .collect();
    AffineMap::new(out_rank as u32, 0, results)
}

/// The broadcast of a tpp input, derived from its type against the output type.
pub fn broadcast_from_types(input: &Type, output: &ShapedType) -> Result<Broadcast, NotApplicableReason> {
    broadcast_from_map(&synthesized_map(input, output))
}

/// The kernel data type of a value's element type.
pub fn data_type(program: &Program, value: ValueId) -> Result<DataType, NotApplicableReason> {
    program
        .value_type(value)
        .element_type()
        .and_then(DataType::from_dtype)
        .ok_or(NotApplicableReason::UnsupportedElementType)
}

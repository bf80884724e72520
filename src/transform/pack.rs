use crate::common::DimSize;
use crate::dialect::arith::{self, ArithOp};
use crate::dialect::linalg::{self, IteratorType, Structured};
use crate::dialect::pack::{pack_into_empty, unpack, vnni, PackInfo};
use crate::ir::affine::{c, d, AffineMap};
use crate::ir::{Builder, OpId, Program, Type};
use crate::matchers::NotApplicableReason;
use crate::transform::{
    not_applicable, Handle, HandleRef, Interpreter, TransformError, TransformOpT,
};

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const NAME: &str = "pack";

/// Packs matmuls into a blocked layout with blocking factors `[bm, bn, bk]`:
///
/// - `A: MxK` becomes `[M/bm][K/bk][bm][bk]`
/// - `B: KxN` becomes `[N/bn][K/bk][bk][bn]`, or `[N/bn][K/bk][bk/v][bn][v]` with `use_vnni`
/// - `C: MxN` becomes `[M/bm][N/bn][bm][bn]` and is unpacked back into the original init
///
/// The matmul is replaced by a `linalg.generic` over the packed operands. Consumes the target
/// and produces a handle to the blocked generics.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PackMatmul {
    pub target: HandleRef,
    pub blocking_factors: Vec<DimSize>,
    pub use_vnni: bool,
}

impl TransformOpT for PackMatmul {
    fn name(&self) -> &'static str {
        NAME
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let targets = cx.consume(self.target)?;
        let mut blocked = Vec::with_capacity(targets.len());
        for op in targets {
            blocked.push(pack_matmul(cx.program, op, &self.blocking_factors, self.use_vnni)?);
        }
        Ok(vec![cx.produce(blocked)])
    }
}

fn is_matmul(s: &Structured<'_>) -> bool {
    s.num_inputs() == 2
        && s.num_inits() == 1
        && s.iterator_types() == linalg::matmul_iterators()
        && s
            .indexing_maps()
            .iter()
            .zip(linalg::matmul_maps())
            .all(|(m, e)| m.equivalent(&e))
}

/// Maps and iterators of the blocked matmul over `(i, j, k, ii, jj, kk)`, plus a trailing `kv`
/// with VNNI factor `v`.
fn blocked_maps(vnni_factor: Option<i64>) -> (Vec<AffineMap>, Vec<IteratorType>) {
    use IteratorType::*;
    match vnni_factor {
        None => (
            vec![
                AffineMap::new(6, 0, vec![d(0), d(2), d(3), d(5)]),
                AffineMap::new(6, 0, vec![d(1), d(2), d(5), d(4)]),
                AffineMap::new(6, 0, vec![d(0), d(1), d(3), d(4)]),
            ],
            vec![Parallel, Parallel, Reduction, Parallel, Parallel, Reduction],
        ),
        Some(v) => (
            vec![
                AffineMap::new(7, 0, vec![d(0), d(2), d(3), d(5) * c(v) + d(6)]),
                AffineMap::new(7, 0, vec![d(1), d(2), d(5), d(4), d(6)]),
                AffineMap::new(7, 0, vec![d(0), d(1), d(3), d(4)]),
            ],
            vec![
                Parallel, Parallel, Reduction, Parallel, Parallel, Reduction, Reduction,
            ],
        ),
    }
}

/// Rewrites one matmul. Every precondition (including tile divisibility) is checked before the
/// IR is touched.
pub fn pack_matmul(
    program: &mut Program,
    op: OpId,
    blocking_factors: &[DimSize],
    use_vnni: bool,
) -> Result<OpId, TransformError> {
    let na = |reason| not_applicable(NAME, op, reason);
    let &[bm, bn, bk] = blocking_factors else {
        return Err(na(NotApplicableReason::Other(Some(
            "expected three blocking factors",
        ))));
    };
    let s = Structured::get(program, op).ok_or(na(NotApplicableReason::NotStructured))?;
    if !is_matmul(&s) {
        return Err(na(NotApplicableReason::AccessPattern));
    }
    if !s.has_tensor_semantics() {
        return Err(na(NotApplicableReason::Other(Some("expected tensors"))));
    }
    if !s.has_static_shapes() {
        return Err(na(NotApplicableReason::DynamicShape));
    }
    let (lhs, rhs, acc) = (s.inputs()[0], s.inputs()[1], s.inits()[0]);
    let lhs_ty = s.program().shaped_type(lhs).ok_or(na(NotApplicableReason::OperandCount))?;
    let rhs_ty = s.program().shaped_type(rhs).ok_or(na(NotApplicableReason::OperandCount))?;
    let acc_ty = s.program().shaped_type(acc).ok_or(na(NotApplicableReason::OperandCount))?;

    let lhs_info = PackInfo::with_static_tiles(vec![0, 1], &[bm, bk], None)?;
    let rhs_info = PackInfo::with_static_tiles(vec![0, 1], &[bk, bn], Some(vec![1, 0]))?;
    let acc_info = PackInfo::with_static_tiles(vec![0, 1], &[bm, bn], None)?;
    lhs_info.packed_shape(&lhs_ty.shape, false)?;
    let rhs_packed = rhs_info.packed_shape(&rhs_ty.shape, false)?;
    acc_info.packed_shape(&acc_ty.shape, false)?;
    let vnni_info = if use_vnni {
        let info = vnni::pack_info(rhs_ty.dtype, rhs_packed.len())
            .ok_or(na(NotApplicableReason::UnsupportedElementType))?;
        info.packed_shape(&rhs_packed, false)?;
        Some(info)
    } else {
        None
    };
    let vnni_factor = match &vnni_info {
        Some(_) => vnni::blocking_factor(rhs_ty.dtype).map(|v| v as i64),
        None => None,
    };
    let arg_types = [lhs_ty.dtype, rhs_ty.dtype, acc_ty.dtype].map(Type::Scalar);
    let is_float = acc_ty.dtype.is_float();
    let body = s.body();

    let mut b = Builder::before(program, op);
    let packed_lhs = pack_into_empty(&mut b, lhs, lhs_info, None)?;
    let mut packed_rhs = pack_into_empty(&mut b, rhs, rhs_info, None)?;
    if let Some(info) = vnni_info {
        packed_rhs = pack_into_empty(&mut b, packed_rhs, info, None)?;
    }
    let packed_acc = pack_into_empty(&mut b, acc, acc_info.clone(), None)?;
    let body = match body {
        Some(block) => b.program.clone_block(block, &mut HashMap::new()),
        None => b.build_block(&arg_types, |b, x| {
            let (mul, add) = if is_float {
                (ArithOp::MulF, ArithOp::AddF)
            } else {
                (ArithOp::MulI, ArithOp::AddI)
            };
            let p = arith::binary(b, mul, x[0], x[1]);
            let s = arith::binary(b, add, x[2], p);
            linalg::yield_(b, &[s]);
        }),
    };
    let (maps, iterators) = blocked_maps(vnni_factor);
    let blocked = linalg::generic_with_body(
        &mut b,
        &[packed_lhs, packed_rhs],
        &[packed_acc],
        maps,
        iterators,
        body,
    );
    let result = b.program.result(blocked, 0);
    let unpacked = unpack(&mut b, result, acc, acc_info, &[])?;
    b.replace_op(op, &[unpacked]);
    debug!("Packed {op} into {blocked}");
    Ok(blocked)
}

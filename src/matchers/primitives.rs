use crate::dialect::arith::is_zero_constant;
use crate::dialect::linalg::{self, IteratorType, LinalgOp, Structured};
use crate::dialect::pack::vnni;
use crate::dialect::tpp::PrimitiveKind;
use crate::ir::{OpId, Program, ValueId};
use crate::matchers::body;
use crate::matchers::{MapPred, NotApplicable, NotApplicableReason, OperandSel, StructuredOpMatcher, ZeroSearch};
use crate::passes::kernel_info::synthesized_map;

/// The operands a matcher identified, ordered as the primitive expects them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedOperands {
    pub inputs: Vec<ValueId>,
    pub output: ValueId,
}

/// Kinds tried by the tagging pass, most specific first.
pub const TAGGING_ORDER: [PrimitiveKind; 7] = [
    PrimitiveKind::Brgemm,
    PrimitiveKind::VnniBrgemm,
    PrimitiveKind::Matmul,
    PrimitiveKind::VnniMatmul,
    PrimitiveKind::Relu,
    PrimitiveKind::Add,
    PrimitiveKind::Identity,
];

fn structured(program: &Program, op: OpId) -> Result<Structured<'_>, NotApplicable> {
    Structured::get(program, op).ok_or(NotApplicable(NotApplicableReason::NotStructured))
}

fn contraction(maps: Vec<crate::ir::affine::AffineMap>, iterators: Vec<IteratorType>) -> StructuredOpMatcher {
    let [a, b, c]: [_; 3] = maps
        .try_into()
        .unwrap_or_else(|_| unreachable!("contractions have three operands"));
    StructuredOpMatcher::new()
        .generic()
        .num_inputs(2)
        .num_inits(1)
        .static_shapes()
        .iterators(iterators)
        .input(OperandSel::One(0), MapPred::Equals(a))
        .input(OperandSel::One(1), MapPred::Equals(b))
        .output(OperandSel::One(0), MapPred::Equals(c))
        .region(body::is_add_mul)
}

fn all_operands(s: &Structured<'_>) -> MatchedOperands {
    MatchedOperands {
        inputs: s.inputs().to_vec(),
        output: s.inits()[0],
    }
}

pub fn match_matmul(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    contraction(linalg::matmul_maps(), linalg::matmul_iterators()).matches(&s)?;
    Ok(all_operands(&s))
}

pub fn match_brgemm(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    contraction(linalg::brgemm_maps(), linalg::brgemm_iterators()).matches(&s)?;
    Ok(all_operands(&s))
}

/// The VNNI blocking factor of the `B` operand, if it is VNNI packed.
fn vnni_factor_of_b(s: &Structured<'_>) -> Result<i64, NotApplicable> {
    let b = s
        .inputs()
        .get(1)
        .and_then(|v| s.program().shaped_type(*v))
        .ok_or(NotApplicable(NotApplicableReason::OperandCount))?;
    if !vnni::is_vnni_packed(b) {
        return Err(NotApplicable(NotApplicableReason::UnsupportedLayout(
            "B is not VNNI packed",
        )));
    }
    vnni::blocking_factor(b.dtype)
        .map(|f| f as i64)
        .ok_or(NotApplicable(NotApplicableReason::UnsupportedElementType))
}

pub fn match_vnni_matmul(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    let v = vnni_factor_of_b(&s)?;
    contraction(linalg::vnni_matmul_maps(v), linalg::vnni_matmul_iterators()).matches(&s)?;
    Ok(all_operands(&s))
}

pub fn match_vnni_brgemm(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    let v = vnni_factor_of_b(&s)?;
    contraction(linalg::vnni_brgemm_maps(v), linalg::vnni_brgemm_iterators()).matches(&s)?;
    Ok(all_operands(&s))
}

/// Tpp ops carry no indexing maps, so an input's broadcast is recovered from its shape against
/// the output. The generic's map must be exactly that recovered map.
fn broadcasts_follow_shapes(s: &Structured<'_>) -> bool {
    let program = s.program();
    let Some(output) = s.inits().first().and_then(|v| program.shaped_type(*v)) else {
        return false;
    };
    let maps = s.indexing_maps();
    s.inputs()
        .iter()
        .zip(&maps)
        .all(|(v, map)| *map == synthesized_map(program.value_type(*v), output))
}

/// 2-D, all-parallel generics with an identity output map and broadcastable inputs.
fn elementwise() -> StructuredOpMatcher {
    StructuredOpMatcher::new()
        .generic()
        .num_inits(1)
        .num_loops(2)
        .all_dims(IteratorType::Parallel)
        .static_shapes()
        .output(OperandSel::All, MapPred::Identity)
        .input(OperandSel::All, MapPred::Broadcastable)
        .operation(NotApplicableReason::AccessPattern, broadcasts_follow_shapes)
}

pub fn match_add(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    elementwise()
        .operation(NotApplicableReason::OperandCount, |s| {
            (1..=2).contains(&s.num_inputs())
        })
        .matches(&s)?;
    let (lhs, rhs) = body::add_operands(&s).ok_or(NotApplicable(NotApplicableReason::BodyMismatch))?;
    Ok(MatchedOperands {
        inputs: vec![s.operands()[lhs], s.operands()[rhs]],
        output: s.inits()[0],
    })
}

pub fn match_relu(
    program: &Program,
    op: OpId,
    zero: &ZeroSearch,
) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    elementwise()
        .operation(NotApplicableReason::OperandCount, |s| s.num_inputs() <= 1)
        .matches(&s)?;
    let data = body::relu_operand(&s, zero).ok_or(NotApplicable(NotApplicableReason::BodyMismatch))?;
    Ok(MatchedOperands {
        inputs: vec![s.operands()[data]],
        output: s.inits()[0],
    })
}

pub fn match_identity(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    elementwise()
        .num_inputs(1)
        .region(body::is_identity_body)
        .matches(&s)?;
    Ok(all_operands(&s))
}

pub fn match_primitive(
    program: &Program,
    op: OpId,
    kind: PrimitiveKind,
    zero: &ZeroSearch,
) -> Result<MatchedOperands, NotApplicable> {
    match kind {
        PrimitiveKind::Identity => match_identity(program, op),
        PrimitiveKind::Relu => match_relu(program, op, zero),
        PrimitiveKind::Add => match_add(program, op),
        PrimitiveKind::Matmul => match_matmul(program, op),
        PrimitiveKind::VnniMatmul => match_vnni_matmul(program, op),
        PrimitiveKind::Brgemm => match_brgemm(program, op),
        PrimitiveKind::VnniBrgemm => match_vnni_brgemm(program, op),
        PrimitiveKind::Zero => match_zero_fill_2d(program, op),
        PrimitiveKind::Transpose => match_transpose_2d(program, op),
    }
}

fn two_d_buffers() -> StructuredOpMatcher {
    StructuredOpMatcher::new()
        .buffer_semantics()
        .static_shapes()
        .num_loops(2)
}

/// A 2-D `linalg.fill` of a buffer with zero. Operands are `[value, output]`.
pub fn match_zero_fill_2d(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    two_d_buffers()
        .operation(NotApplicableReason::Other(Some("not a fill")), |s| {
            *s.linalg() == LinalgOp::Fill
        })
        .operation(NotApplicableReason::Other(Some("fill value is not zero")), |s| {
            is_zero_constant(s.program(), s.inputs()[0])
        })
        .matches(&s)?;
    Ok(all_operands(&s))
}

/// A 2-D `linalg.transpose` of buffers.
pub fn match_transpose_2d(program: &Program, op: OpId) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    two_d_buffers()
        .operation(NotApplicableReason::Other(Some("not a 2-D transpose")), |s| {
            matches!(s.linalg(), LinalgOp::Transpose { permutation } if permutation == &[1, 0])
        })
        .matches(&s)?;
    Ok(all_operands(&s))
}

/// A 2-D relu generic on buffers.
pub fn match_relu_2d(
    program: &Program,
    op: OpId,
    zero: &ZeroSearch,
) -> Result<MatchedOperands, NotApplicable> {
    let s = structured(program, op)?;
    two_d_buffers().matches(&s)?;
    match_relu(program, op, zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::arith::{self, ArithOp};
    use crate::dialect::linalg::{generic, yield_};
    use crate::dialect::memref;
    use crate::ir::affine::{c, d, AffineMap};
    use crate::ir::{Builder, Type};
    use crate::shape;

    fn f32_buf(s: crate::common::Shape) -> Type {
        Type::memref(s, Dtype::Float32)
    }

    /// Builds a function around a single generic and returns the program and the op.
    fn with_generic(
        args: &[Type],
        num_inputs: usize,
        maps: Vec<AffineMap>,
        iterators: Vec<IteratorType>,
        body: impl FnOnce(&mut Builder, &[ValueId]),
    ) -> (Program, OpId) {
        let mut program = Program::new();
        let (_, block) = program.add_function("f", args, &[]);
        let vals = program.block_args(block).to_vec();
        let mut b = Builder::at_end(&mut program, block);
        let op = generic(
            &mut b,
            &vals[..num_inputs],
            &vals[num_inputs..],
            maps,
            iterators,
            body,
        );
        (program, op)
    }

    fn matmul_body(b: &mut Builder, a: &[ValueId]) {
        let m = arith::binary(b, ArithOp::MulF, a[0], a[1]);
        let s = arith::binary(b, ArithOp::AddF, a[2], m);
        yield_(b, &[s]);
    }

    fn matmul_generic(
        maps: Vec<AffineMap>,
        iterators: Vec<IteratorType>,
        body: impl FnOnce(&mut Builder, &[ValueId]),
    ) -> (Program, OpId) {
        with_generic(
            &[f32_buf(shape![4, 8]), f32_buf(shape![8, 16]), f32_buf(shape![4, 16])],
            2,
            maps,
            iterators,
            body,
        )
    }

    #[test]
    fn test_matmul_positive_and_commuted() {
        let (program, op) = matmul_generic(linalg::matmul_maps(), linalg::matmul_iterators(), matmul_body);
        let matched = match_matmul(&program, op).unwrap();
        assert_eq!(matched.inputs.len(), 2);
        let (program, op) =
            matmul_generic(linalg::matmul_maps(), linalg::matmul_iterators(), |b, a| {
                let m = arith::binary(b, ArithOp::MulF, a[1], a[0]);
                let s = arith::binary(b, ArithOp::AddF, m, a[2]);
                yield_(b, &[s]);
            });
        assert!(match_matmul(&program, op).is_ok());
    }

    #[test]
    fn test_matmul_with_conversion_chains() {
        let (program, op) = with_generic(
            &[
                Type::memref(shape![4, 8], Dtype::Bfloat16),
                Type::memref(shape![8, 16], Dtype::Bfloat16),
                f32_buf(shape![4, 16]),
            ],
            2,
            linalg::matmul_maps(),
            linalg::matmul_iterators(),
            |b, a| {
                let x = arith::cast(b, ArithOp::ExtF, a[0], Type::Scalar(Dtype::Float32));
                let y = arith::cast(b, ArithOp::ExtF, a[1], Type::Scalar(Dtype::Float32));
                let m = arith::binary(b, ArithOp::MulF, x, y);
                let s = arith::binary(b, ArithOp::AddF, a[2], m);
                yield_(b, &[s]);
            },
        );
        assert!(match_matmul(&program, op).is_ok());
    }

    #[test]
    fn test_matmul_negatives_per_facet() {
        // Iterator structure.
        let (program, op) = matmul_generic(
            linalg::matmul_maps(),
            vec![IteratorType::Parallel; 3],
            matmul_body,
        );
        assert_eq!(
            match_matmul(&program, op),
            Err(NotApplicable(NotApplicableReason::IteratorMismatch))
        );
        // Access pattern: A indexed as (k, i).
        let mut maps = linalg::matmul_maps();
        maps[0] = AffineMap::new(3, 0, vec![d(2), d(0)]);
        let (program, op) = with_generic(
            &[f32_buf(shape![8, 4]), f32_buf(shape![8, 16]), f32_buf(shape![4, 16])],
            2,
            maps,
            linalg::matmul_iterators(),
            matmul_body,
        );
        assert_eq!(
            match_matmul(&program, op),
            Err(NotApplicable(NotApplicableReason::AccessPattern))
        );
        // Body: an extra operation.
        let (program, op) =
            matmul_generic(linalg::matmul_maps(), linalg::matmul_iterators(), |b, a| {
                let m = arith::binary(b, ArithOp::MulF, a[0], a[1]);
                let m2 = arith::binary(b, ArithOp::MulF, m, a[1]);
                let s = arith::binary(b, ArithOp::AddF, a[2], m2);
                yield_(b, &[s]);
            });
        assert_eq!(
            match_matmul(&program, op),
            Err(NotApplicable(NotApplicableReason::BodyMismatch))
        );
        // Body: accumulating into an input instead of the output.
        let (program, op) =
            matmul_generic(linalg::matmul_maps(), linalg::matmul_iterators(), |b, a| {
                let m = arith::binary(b, ArithOp::MulF, a[0], a[1]);
                let s = arith::binary(b, ArithOp::AddF, a[0], m);
                yield_(b, &[s]);
            });
        assert!(match_matmul(&program, op).is_err());
    }

    #[test]
    fn test_brgemm_and_vnni_brgemm() {
        let (program, op) = with_generic(
            &[f32_buf(shape![2, 4, 8]), f32_buf(shape![2, 8, 16]), f32_buf(shape![4, 16])],
            2,
            linalg::brgemm_maps(),
            linalg::brgemm_iterators(),
            matmul_body,
        );
        assert!(match_brgemm(&program, op).is_ok());
        assert!(match_matmul(&program, op).is_err());

        let bf16 = |s| Type::memref(s, Dtype::Bfloat16);
        let (program, op) = with_generic(
            &[bf16(shape![2, 4, 8]), bf16(shape![2, 4, 16, 2]), bf16(shape![4, 16])],
            2,
            linalg::vnni_brgemm_maps(2),
            linalg::vnni_brgemm_iterators(),
            matmul_body,
        );
        assert!(match_vnni_brgemm(&program, op).is_ok());
        assert!(match_brgemm(&program, op).is_err());
    }

    fn add_case(maps: Vec<AffineMap>, lhs: Type) -> (Program, OpId) {
        with_generic(
            &[lhs, f32_buf(shape![4, 8]), f32_buf(shape![4, 8])],
            2,
            maps,
            vec![IteratorType::Parallel; 2],
            |b, a| {
                let s = arith::binary(b, ArithOp::AddF, a[0], a[1]);
                yield_(b, &[s]);
            },
        )
    }

    #[test]
    fn test_add_table() {
        let id = AffineMap::identity(2);
        let (program, op) = add_case(vec![id.clone(), id.clone(), id.clone()], f32_buf(shape![4, 8]));
        assert!(match_add(&program, op).is_ok());
        // Broadcast row vector.
        let (program, op) = add_case(
            vec![AffineMap::new(2, 0, vec![d(1)]), id.clone(), id.clone()],
            f32_buf(shape![8]),
        );
        assert!(match_add(&program, op).is_ok());
        // Transposed input is not a broadcast.
        let (program, op) = add_case(
            vec![AffineMap::new(2, 0, vec![d(1), d(0)]), id.clone(), id.clone()],
            f32_buf(shape![8, 4]),
        );
        assert_eq!(
            match_add(&program, op),
            Err(NotApplicable(NotApplicableReason::AccessPattern))
        );
        // A column read from a full buffer broadcasts in linalg but not in the tpp op.
        let (program, op) = add_case(
            vec![AffineMap::new(2, 0, vec![d(0), c(0)]), id.clone(), id.clone()],
            f32_buf(shape![4, 8]),
        );
        assert_eq!(
            match_add(&program, op),
            Err(NotApplicable(NotApplicableReason::AccessPattern))
        );
        // The same read from a 4x1 buffer is a column broadcast.
        let (program, op) = add_case(
            vec![AffineMap::new(2, 0, vec![d(0), c(0)]), id.clone(), id.clone()],
            f32_buf(shape![4, 1]),
        );
        assert!(match_add(&program, op).is_ok());
        // Non-identity output.
        let (program, op) = add_case(
            vec![id.clone(), id.clone(), AffineMap::new(2, 0, vec![d(0), c(0)])],
            f32_buf(shape![4, 8]),
        );
        assert!(match_add(&program, op).is_err());
    }

    #[test]
    fn test_add_body_negatives() {
        let id = AffineMap::identity(2);
        let (program, op) = with_generic(
            &[f32_buf(shape![4, 8]), f32_buf(shape![4, 8]), f32_buf(shape![4, 8])],
            2,
            vec![id.clone(), id.clone(), id],
            vec![IteratorType::Parallel; 2],
            |b, a| {
                let s = arith::binary(b, ArithOp::SubF, a[0], a[1]);
                yield_(b, &[s]);
            },
        );
        assert_eq!(
            match_add(&program, op),
            Err(NotApplicable(NotApplicableReason::BodyMismatch))
        );
    }

    fn relu_case(build_zero: impl FnOnce(&mut Builder, ValueId) -> Option<ValueId>) -> (Program, OpId) {
        let mut program = Program::new();
        let (_, block) = program.add_function(
            "relu",
            &[f32_buf(shape![4, 8]), f32_buf(shape![4, 8])],
            &[],
        );
        let args = program.block_args(block).to_vec();
        let mut b = Builder::at_end(&mut program, block);
        let cst = build_zero(&mut b, args[1]);
        let op = generic(
            &mut b,
            &[args[0]],
            &[args[1]],
            vec![AffineMap::identity(2), AffineMap::identity(2)],
            vec![IteratorType::Parallel; 2],
            |b, a| {
                let zero = cst.unwrap_or(a[1]);
                let m = arith::binary(b, ArithOp::MaxF, a[0], zero);
                yield_(b, &[m]);
            },
        );
        (program, op)
    }

    #[test]
    fn test_relu_table() {
        let zero = ZeroSearch::default();
        // Literal zero defined above the body.
        let (program, op) = relu_case(|b, _| Some(arith::constant_float(b, 0.0, Dtype::Float32)));
        let matched = match_relu(&program, op, &zero).unwrap();
        assert_eq!(matched.inputs, vec![program.operands(op)[0]]);
        // Output zero-filled before the op.
        let (program, op) = relu_case(|b, out| {
            let z = arith::constant_float(b, 0.0, Dtype::Float32);
            linalg::fill(b, z, out);
            None
        });
        assert!(match_relu(&program, op, &zero).is_ok());
        // Output filled with a non-zero value.
        let (program, op) = relu_case(|b, out| {
            let z = arith::constant_float(b, 0.5, Dtype::Float32);
            linalg::fill(b, z, out);
            None
        });
        assert_eq!(
            match_relu(&program, op, &zero),
            Err(NotApplicable(NotApplicableReason::BodyMismatch))
        );
        // Output of unknown content.
        let (program, op) = relu_case(|_, _| None);
        assert!(match_relu(&program, op, &zero).is_err());
    }

    #[test]
    fn test_identity_table() {
        let (program, op) = with_generic(
            &[f32_buf(shape![4, 1]), f32_buf(shape![4, 8])],
            1,
            vec![AffineMap::new(2, 0, vec![d(0), c(0)]), AffineMap::identity(2)],
            vec![IteratorType::Parallel; 2],
            |b, a| {
                yield_(b, &[a[0]]);
            },
        );
        assert!(match_identity(&program, op).is_ok());
        // Yielding the output is not a copy of the input.
        let (program, op) = with_generic(
            &[f32_buf(shape![4, 8]), f32_buf(shape![4, 8])],
            1,
            vec![AffineMap::identity(2), AffineMap::identity(2)],
            vec![IteratorType::Parallel; 2],
            |b, a| {
                yield_(b, &[a[1]]);
            },
        );
        assert_eq!(
            match_identity(&program, op),
            Err(NotApplicable(NotApplicableReason::BodyMismatch))
        );
    }

    #[test]
    fn test_named_two_d_matchers() {
        let mut program = Program::new();
        let (_, block) = program.add_function(
            "f",
            &[f32_buf(shape![4, 8]), f32_buf(shape![8, 4]), f32_buf(shape![2, 4, 8])],
            &[],
        );
        let args = program.block_args(block).to_vec();
        let mut b = Builder::at_end(&mut program, block);
        let zero = arith::constant_float(&mut b, 0.0, Dtype::Float32);
        let fill = linalg::fill(&mut b, zero, args[0]);
        let fill_3d = linalg::fill(&mut b, zero, args[2]);
        let t = linalg::transpose(&mut b, args[0], args[1], vec![1, 0]);
        let tmp = memref::alloc(&mut b, shape![4, 8], Dtype::Float32);
        let one = arith::constant_float(&mut b, 1.0, Dtype::Float32);
        let fill_one = linalg::fill(&mut b, one, tmp);

        assert_eq!(
            match_zero_fill_2d(&program, fill).unwrap().inputs,
            vec![zero]
        );
        assert!(match_zero_fill_2d(&program, fill_3d).is_err());
        assert!(match_zero_fill_2d(&program, fill_one).is_err());
        assert!(match_transpose_2d(&program, t).is_ok());
        assert!(match_transpose_2d(&program, fill).is_err());
    }
}

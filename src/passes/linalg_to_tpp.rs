//! Recognizing linalg ops as primitives: tagging generics with their primitive kind
//! (`map-linalg-to-tpp`) and replacing tagged or named ops on buffers with tpp ops
//! (`convert-linalg-to-tpp`).

use crate::dialect::linalg::{set_library_call, LinalgOp, Structured};
use crate::dialect::tpp::{self, PrimitiveKind, TppOp};
use crate::ir::{Builder, OpId, OpKind, Program, ValueId};
use crate::matchers::primitives::TAGGING_ORDER;
use crate::matchers::{match_primitive, NotApplicable, NotApplicableReason, ZeroSearch};
use crate::passes::{apply_patterns_greedily, GreedyConfig, Pass, PassError, RewritePattern};

use log::debug;
use std::str::FromStr;

/// Restricts which operations may be tagged or converted.
pub type OpFilter = Box<dyn Fn(&Program, OpId) -> bool>;

fn passes_filter(filter: Option<&OpFilter>, program: &Program, op: OpId) -> Result<(), NotApplicable> {
    match filter {
        Some(f) if !f(program, op) => Err(NotApplicable(NotApplicableReason::Filtered)),
        _ => Ok(()),
    }
}

struct TagPrimitive<'a> {
    zero: &'a ZeroSearch,
    filter: Option<&'a OpFilter>,
}

impl RewritePattern for TagPrimitive<'_> {
    fn name(&self) -> &'static str {
        "tag-primitive"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let OpKind::Linalg(LinalgOp::Generic(attrs)) = program.kind(op) else {
            return Err(NotApplicable(NotApplicableReason::NotGeneric));
        };
        if attrs.library_call.is_some() {
            return Err(NotApplicable(NotApplicableReason::AlreadyTagged));
        }
        passes_filter(self.filter, program, op)?;
        let kind = TAGGING_ORDER
            .into_iter()
            .find(|kind| match_primitive(program, op, *kind, self.zero).is_ok())
            .ok_or(NotApplicable(NotApplicableReason::Other(Some(
                "no primitive matches",
            ))))?;
        debug!("Tagging {op} as {kind}");
        set_library_call(program, op, Some(kind.to_string()));
        Ok(())
    }
}

/// Tags every generic nested in `root` that matches a primitive. Returns the number of ops
/// tagged.
pub fn tag_primitives(
    program: &mut Program,
    root: OpId,
    zero: &ZeroSearch,
    filter: Option<&OpFilter>,
    config: &GreedyConfig,
) -> Result<usize, PassError> {
    let pattern = TagPrimitive { zero, filter };
    apply_patterns_greedily(program, root, &[&pattern], config)
}

/// The primitive a generic was tagged with, if any.
pub fn primitive_tag(program: &Program, op: OpId) -> Option<PrimitiveKind> {
    let call = Structured::get(program, op)?.library_call()?;
    PrimitiveKind::from_str(call).ok()
}

#[derive(Default)]
pub struct MapLinalgToTpp {
    pub zero: ZeroSearch,
    pub greedy: GreedyConfig,
    filter: Option<OpFilter>,
}

impl MapLinalgToTpp {
    pub fn with_filter(mut self, filter: impl Fn(&Program, OpId) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }
}

impl Pass for MapLinalgToTpp {
    fn name(&self) -> &'static str {
        "map-linalg-to-tpp"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let mut total = 0;
        for func in program.functions() {
            total += tag_primitives(program, func, &self.zero, self.filter.as_ref(), &self.greedy)?;
        }
        Ok(total)
    }
}

struct ConvertToTpp<'a> {
    zero: &'a ZeroSearch,
    filter: Option<&'a OpFilter>,
}

/// The tpp op and its `(inputs, output)` for a convertible linalg op.
fn tpp_form(
    program: &Program,
    op: OpId,
    zero: &ZeroSearch,
) -> Result<(TppOp, Vec<ValueId>, ValueId), NotApplicable> {
    let s = Structured::get(program, op).ok_or(NotApplicable(NotApplicableReason::NotStructured))?;
    if !s.has_buffer_semantics() {
        return Err(NotApplicable(NotApplicableReason::NotBuffers));
    }
    if !s.has_static_shapes() {
        return Err(NotApplicable(NotApplicableReason::DynamicShape));
    }
    let (tpp_op, inputs, output) = match s.linalg() {
        LinalgOp::Matmul => (TppOp::Matmul, s.inputs().to_vec(), s.inits()[0]),
        LinalgOp::BatchReduceMatmul => (TppOp::Brgemm, s.inputs().to_vec(), s.inits()[0]),
        LinalgOp::Generic(_) => {
            let kind = primitive_tag(program, op)
                .ok_or(NotApplicable(NotApplicableReason::Other(Some("not tagged"))))?;
            let tpp_op = kind
                .tpp_op()
                .ok_or(NotApplicable(NotApplicableReason::Other(Some("no tpp op for tag"))))?;
            // Tags may be stale after other rewrites.
            let matched = match_primitive(program, op, kind, zero)?;
            (tpp_op, matched.inputs, matched.output)
        }
        _ => return Err(NotApplicable(NotApplicableReason::NotGeneric)),
    };
    let out_dtype = program.value_type(output).element_type();
    if inputs
        .iter()
        .any(|v| program.value_type(*v).element_type() != out_dtype)
    {
        return Err(NotApplicable(NotApplicableReason::UnsupportedElementType));
    }
    Ok((tpp_op, inputs, output))
}

impl RewritePattern for ConvertToTpp<'_> {
    fn name(&self) -> &'static str {
        "convert-to-tpp"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let (tpp_op, inputs, output) = tpp_form(program, op, self.zero)?;
        passes_filter(self.filter, program, op)?;
        let mut b = Builder::before(program, op);
        let new_op = tpp::create(&mut b, tpp_op, &inputs, output);
        b.erase_op(op);
        debug!("Replaced {op} with {} ({new_op})", tpp_op.name());
        Ok(())
    }
}

#[derive(Default)]
pub struct ConvertLinalgToTpp {
    pub zero: ZeroSearch,
    pub greedy: GreedyConfig,
    filter: Option<OpFilter>,
}

impl ConvertLinalgToTpp {
    pub fn with_filter(mut self, filter: impl Fn(&Program, OpId) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }
}

impl Pass for ConvertLinalgToTpp {
    fn name(&self) -> &'static str {
        "convert-linalg-to-tpp"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let pattern = ConvertToTpp {
            zero: &self.zero,
            filter: self.filter.as_ref(),
        };
        let mut total = 0;
        for func in program.functions() {
            total += apply_patterns_greedily(program, func, &[&pattern], &self.greedy)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::arith::{self, ArithOp};
    use crate::dialect::linalg::{self, IteratorType};
    use crate::ir::affine::AffineMap;
    use crate::ir::Type;
    use crate::shape;

    /// A function with a matmul generic, an add generic and a named brgemm on buffers.
    fn sample() -> (Program, [OpId; 3]) {
        let mut program = Program::new();
        let m = |s| Type::memref(s, Dtype::Float32);
        let (_, body) = program.add_function(
            "f",
            &[
                m(shape![4, 8]),
                m(shape![8, 16]),
                m(shape![4, 16]),
                m(shape![2, 4, 8]),
                m(shape![2, 8, 16]),
            ],
            &[],
        );
        let a = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let mm = linalg::generic(
            &mut b,
            &a[0..2],
            &a[2..3],
            linalg::matmul_maps(),
            linalg::matmul_iterators(),
            |b, x| {
                let p = arith::binary(b, ArithOp::MulF, x[0], x[1]);
                let s = arith::binary(b, ArithOp::AddF, x[2], p);
                linalg::yield_(b, &[s]);
            },
        );
        let add = linalg::generic(
            &mut b,
            &[a[2]],
            &[a[2]],
            vec![AffineMap::identity(2), AffineMap::identity(2)],
            vec![IteratorType::Parallel; 2],
            |b, x| {
                let s = arith::binary(b, ArithOp::AddF, x[0], x[1]);
                linalg::yield_(b, &[s]);
            },
        );
        let brgemm = linalg::batch_reduce_matmul(&mut b, a[3], a[4], a[2]);
        (program, [mm, add, brgemm])
    }

    #[test]
    fn test_tagging_is_idempotent() {
        let (mut program, [mm, add, _]) = sample();
        let pass = MapLinalgToTpp::default();
        assert_eq!(pass.run(&mut program), Ok(2));
        assert_eq!(primitive_tag(&program, mm), Some(PrimitiveKind::Matmul));
        assert_eq!(primitive_tag(&program, add), Some(PrimitiveKind::Add));
        let before = crate::ir::printer::print_program(&program);
        assert_eq!(pass.run(&mut program), Ok(0));
        assert_eq!(crate::ir::printer::print_program(&program), before);
    }

    #[test]
    fn test_filter_restricts_tagging() {
        let (mut program, [mm, add, _]) = sample();
        let pass = MapLinalgToTpp::default().with_filter(move |_, op| op == mm);
        assert_eq!(pass.run(&mut program), Ok(1));
        assert_eq!(primitive_tag(&program, add), None);
    }

    #[test]
    fn test_convert_tagged_and_named_ops() {
        let (mut program, ops) = sample();
        MapLinalgToTpp::default().run(&mut program).unwrap();
        assert_eq!(ConvertLinalgToTpp::default().run(&mut program), Ok(3));
        assert!(ops.iter().all(|op| program.is_erased(*op)));
        let tpp_ops: Vec<TppOp> = program
            .walk(program.module())
            .into_iter()
            .filter_map(|op| program.kind(op).as_tpp())
            .collect();
        assert_eq!(tpp_ops, vec![TppOp::Matmul, TppOp::Add, TppOp::Brgemm]);
        assert!(crate::ir::verify::verify(&program).is_empty());
    }
}

//! Local simplifications: dead pure ops, integer constant folding and inverse layout pairs.

use crate::dialect::arith::{self, constant_int_value, ArithOp, Literal};
use crate::dialect::pack::pack_operands;
use crate::dialect::tensor::TensorOp;
use crate::ir::{Builder, OpId, OpKind, Program, ValueId};
use crate::matchers::{NotApplicable, NotApplicableReason};
use crate::passes::{apply_patterns_greedily, GreedyConfig, Pass, PassError, RewritePattern};

fn not_applicable(why: &'static str) -> NotApplicable {
    NotApplicable(NotApplicableReason::Other(Some(why)))
}

struct EraseDeadPureOp;

impl RewritePattern for EraseDeadPureOp {
    fn name(&self) -> &'static str {
        "erase-dead-pure-op"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let results = program.results(op);
        if !program.kind(op).is_pure() || results.is_empty() {
            return Err(not_applicable("not a pure op with results"));
        }
        if results.iter().any(|r| program.has_uses(*r)) {
            return Err(not_applicable("results are used"));
        }
        program.erase_op(op);
        Ok(())
    }
}

struct FoldIntArith;

impl RewritePattern for FoldIntArith {
    fn name(&self) -> &'static str {
        "fold-int-arith"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let fold: fn(i64, i64) -> Option<i64> = match program.kind(op) {
            OpKind::Arith(ArithOp::AddI) => i64::checked_add,
            OpKind::Arith(ArithOp::MulI) => i64::checked_mul,
            _ => return Err(not_applicable("not an integer add or mul")),
        };
        let operands = program.operands(op);
        let (lhs, rhs) = (
            constant_int_value(program, operands[0]),
            constant_int_value(program, operands[1]),
        );
        let value = match (lhs, rhs) {
            (Some(l), Some(r)) => fold(l, r).ok_or(not_applicable("overflow"))?,
            _ => return Err(not_applicable("operands are not constant")),
        };
        let ty = program.value_type(program.result(op, 0)).clone();
        let mut b = Builder::before(program, op);
        let folded = arith::constant(&mut b, Literal::Int(value), ty);
        b.replace_op(op, &[folded]);
        Ok(())
    }
}

/// The source of `value` if it is produced by a pack (`want_pack`) or unpack op.
fn producer_of(program: &Program, value: ValueId, want_pack: bool) -> Option<OpId> {
    let def = program.defining_op(value)?;
    match (program.kind(def), want_pack) {
        (OpKind::Tensor(TensorOp::Pack(_)), true) | (OpKind::Tensor(TensorOp::Unpack(_)), false) => {
            Some(def)
        }
        _ => None,
    }
}

/// `unpack(pack(x))` and `pack(unpack(x))` with the same descriptor fold to `x` when the types
/// line up. A padded pack only folds under an unpack, which drops the padding again.
struct FoldInversePackPair;

impl RewritePattern for FoldInversePackPair {
    fn name(&self) -> &'static str {
        "fold-inverse-pack-pair"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let (outer, outer_attrs) =
            pack_operands(program, op).ok_or(not_applicable("not a pack or unpack"))?;
        let outer_is_pack = matches!(program.kind(op), OpKind::Tensor(TensorOp::Pack(_)));
        let inner_op = producer_of(program, outer.source, !outer_is_pack)
            .ok_or(not_applicable("source is not produced by the inverse op"))?;
        let (inner, inner_attrs) =
            pack_operands(program, inner_op).ok_or(not_applicable("not a pack or unpack"))?;
        if outer_attrs.info != inner_attrs.info {
            return Err(not_applicable("descriptors differ"));
        }
        if outer_is_pack && outer_attrs.has_padding {
            return Err(not_applicable("outer pack pads"));
        }
        if !outer.dynamic_tiles.is_empty() || !inner.dynamic_tiles.is_empty() {
            return Err(not_applicable("dynamic tiles"));
        }
        let result = program.result(op, 0);
        if program.value_type(inner.source) != program.value_type(result) {
            return Err(not_applicable("types differ"));
        }
        program.replace_op(op, &[inner.source]);
        Ok(())
    }
}

struct FoldIdentityCast;

impl RewritePattern for FoldIdentityCast {
    fn name(&self) -> &'static str {
        "fold-identity-cast"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        if *program.kind(op) != OpKind::Tensor(TensorOp::Cast) {
            return Err(not_applicable("not a cast"));
        }
        let source = program.operands(op)[0];
        if program.value_type(source) != program.value_type(program.result(op, 0)) {
            return Err(not_applicable("cast changes the type"));
        }
        program.replace_op(op, &[source]);
        Ok(())
    }
}

/// Canonicalizes everything nested in `root`.
pub fn canonicalize(
    program: &mut Program,
    root: OpId,
    config: &GreedyConfig,
) -> Result<usize, PassError> {
    apply_patterns_greedily(
        program,
        root,
        &[
            &FoldIntArith,
            &FoldIdentityCast,
            &FoldInversePackPair,
            &EraseDeadPureOp,
        ],
        config,
    )
}

#[derive(Default)]
pub struct Canonicalize {
    pub greedy: GreedyConfig,
}

impl Pass for Canonicalize {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let module = program.module();
        canonicalize(program, module, &self.greedy)
    }
}

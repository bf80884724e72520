use crate::dialect::arith;
use crate::ir::{BlockId, Builder, OpId, OpKind, Program, Type, ValueId};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ScfOp {
    /// `scf.for %iv = %lb to %ub step %step`. The body block takes the induction variable.
    For,
    Yield,
}

impl ScfOp {
    pub fn name(&self) -> &'static str {
        match self {
            ScfOp::For => "scf.for",
            ScfOp::Yield => "scf.yield",
        }
    }
}

/// Builds an `scf.for` loop. `body` receives the induction variable; the terminator is appended
/// automatically.
pub fn for_(
    b: &mut Builder,
    lb: ValueId,
    ub: ValueId,
    step: ValueId,
    body: impl FnOnce(&mut Builder, ValueId),
) -> OpId {
    let block = b.build_block(&[Type::Index], |b, args| {
        body(b, args[0]);
        b.create(OpKind::Scf(ScfOp::Yield), &[], vec![], vec![]);
    });
    b.create(OpKind::Scf(ScfOp::For), &[lb, ub, step], vec![], vec![block])
}

/// Builds a loop nest over `0..ubs[i]` with unit steps. `body` receives the induction variables
/// from outermost to innermost. Returns the outermost loop, if any.
pub fn loop_nest(
    b: &mut Builder,
    ubs: &[i64],
    body: impl FnOnce(&mut Builder, &[ValueId]),
) -> Option<OpId> {
    fn rec(
        b: &mut Builder,
        ubs: &[i64],
        ivs: &mut Vec<ValueId>,
        body: Box<dyn FnOnce(&mut Builder, &[ValueId]) + '_>,
    ) -> Option<OpId> {
        let Some((&first, rest)) = ubs.split_first() else {
            body(b, ivs);
            return None;
        };
        let lb = arith::constant_index(b, 0);
        let ub = arith::constant_index(b, first);
        let step = arith::constant_index(b, 1);
        Some(for_(b, lb, ub, step, |b, iv| {
            ivs.push(iv);
            rec(b, rest, ivs, body);
        }))
    }
    rec(b, ubs, &mut vec![], Box::new(body))
}

pub fn induction_var(program: &Program, for_op: OpId) -> ValueId {
    program.block_args(loop_body(program, for_op))[0]
}

pub fn loop_body(program: &Program, for_op: OpId) -> BlockId {
    program.regions(for_op)[0]
}

/// Constant `(lb, ub, step)` of a loop.
pub fn constant_bounds(program: &Program, for_op: OpId) -> Option<(i64, i64, i64)> {
    let operands = program.operands(for_op);
    Some((
        arith::constant_int_value(program, operands[0])?,
        arith::constant_int_value(program, operands[1])?,
        arith::constant_int_value(program, operands[2])?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_nest_order() {
        let mut program = Program::new();
        let (func, body) = program.add_function("f", &[], &[]);
        let mut b = Builder::at_end(&mut program, body);
        let mut seen = vec![];
        let outer = loop_nest(&mut b, &[4, 8], |_, ivs| seen = ivs.to_vec()).unwrap();
        assert_eq!(constant_bounds(&program, outer), Some((0, 4, 1)));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], induction_var(&program, outer));
        let loops: Vec<_> = program
            .walk(func)
            .into_iter()
            .filter(|op| program.kind(*op).is_scf_for())
            .collect();
        assert_eq!(loops.len(), 2);
        assert_eq!(program.parent_op(loops[1]), Some(outer));
    }
}

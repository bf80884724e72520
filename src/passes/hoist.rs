//! `hoist-xsmm-dispatch`: moves kernel dispatches out of loop nests so each kernel is
//! dispatched once rather than once per iteration.

use crate::ir::{InsertPoint, OpId, OpKind, Program, ValueDef};
use crate::passes::{Pass, PassError};

use log::debug;

/// Returns `true` if no operand of `op` is defined inside `loop_op`, including its induction
/// variable.
pub fn is_loop_invariant(program: &Program, op: OpId, loop_op: OpId) -> bool {
    program.operands(op).iter().all(|v| {
        let owner = match program.value_def(*v) {
            ValueDef::OpResult { op: def, .. } => Some(def),
            ValueDef::BlockArg { block, .. } => program.block_parent_op(block),
        };
        owner.map_or(true, |owner| {
            owner != loop_op && !program.is_proper_ancestor(loop_op, owner)
        })
    })
}

/// The outermost `scf.for` enclosing `op` within its function.
fn outermost_loop(program: &Program, op: OpId) -> Option<OpId> {
    let mut outermost = None;
    let mut current = op;
    while let Some(parent) = program.parent_op(current) {
        if program.kind(parent).is_scf_for() {
            outermost = Some(parent);
        }
        current = parent;
    }
    outermost
}

#[derive(Default)]
pub struct HoistXsmmDispatch;

impl Pass for HoistXsmmDispatch {
    fn name(&self) -> &'static str {
        "hoist-xsmm-dispatch"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let dispatches: Vec<OpId> = program
            .walk(program.module())
            .into_iter()
            .filter(|op| matches!(program.kind(*op), OpKind::Xsmm(x) if x.is_dispatch()))
            .collect();
        let mut hoisted = 0;
        for dispatch in dispatches {
            let Some(outer) = outermost_loop(program, dispatch) else {
                continue;
            };
            if !is_loop_invariant(program, dispatch, outer) {
                continue;
            }
            program.move_op(dispatch, InsertPoint::Before(outer));
            debug!("Hoisted {dispatch} above {outer}");
            hoisted += 1;
        }
        Ok(hoisted)
    }
}

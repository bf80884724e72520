use crate::dialect::linalg::Structured;
use crate::ir::affine::{d, AffineMap};
use crate::ir::{OpId, Program};
use crate::matchers::{NotApplicable, NotApplicableReason};
use crate::passes::{apply_patterns_greedily, RewritePattern};
use crate::transform::collapse::{rebuild_generic, GenericPlan, OperandPlan};
use crate::transform::{Handle, HandleRef, Interpreter, TransformError, TransformOpT};

use serde::{Deserialize, Serialize};

/// Drops the static unit loops of every `linalg.generic` nested in the target. Operands lose the
/// matching unit dimensions and tensor results are expanded back.
///
/// Invalidates handles into the target.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FoldUnitDims {
    pub target: HandleRef,
}

impl TransformOpT for FoldUnitDims {
    fn name(&self) -> &'static str {
        "fold_unit_dims"
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let targets = cx.payload(self.target)?;
        for target in &targets {
            apply_patterns_greedily(cx.program, *target, &[&DropUnitLoops], &cx.greedy)?;
        }
        cx.invalidate_within(&targets);
        Ok(vec![])
    }
}

struct DropUnitLoops;

impl RewritePattern for DropUnitLoops {
    fn name(&self) -> &'static str {
        "drop-unit-loops"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let s = Structured::get(program, op).ok_or(NotApplicableReason::NotStructured)?;
        let plan = plan_drop_unit_loops(&s)?;
        rebuild_generic(program, op, plan);
        Ok(())
    }
}

/// Groups the dimensions of an operand so that each kept dimension absorbs the unit dimensions
/// before it; trailing unit dimensions join the last group.
fn unit_reassociation(kept: &[usize], rank: usize) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = vec![];
    let mut start = 0;
    for &k in kept {
        groups.push((start..=k).collect());
        start = k + 1;
    }
    if let Some(last) = groups.last_mut() {
        last.extend(start..rank);
    }
    groups
}

fn plan_drop_unit_loops(s: &Structured<'_>) -> Result<GenericPlan, NotApplicableReason> {
    s.generic().ok_or(NotApplicableReason::NotGeneric)?;
    if !s.has_static_shapes() {
        return Err(NotApplicableReason::DynamicShape);
    }
    let ranges = s
        .static_loop_ranges()
        .ok_or(NotApplicableReason::DynamicShape)?;
    let iterators = s.iterator_types();
    let kept_loops: Vec<usize> = (0..ranges.len()).filter(|l| ranges[*l] != 1).collect();
    if kept_loops.len() == ranges.len() {
        return Err(NotApplicableReason::Other(Some("no unit loops")));
    }
    let mut renumbered = vec![None; ranges.len()];
    for (new, old) in kept_loops.iter().enumerate() {
        renumbered[*old] = Some(new as u32);
    }

    let mut operands = vec![];
    for map in s.indexing_maps() {
        let dims = map.result_dims().ok_or(NotApplicableReason::AccessPattern)?;
        let kept: Vec<usize> = (0..dims.len())
            .filter(|p| renumbered[dims[*p] as usize].is_some())
            .collect();
        if kept.is_empty() && !dims.is_empty() {
            return Err(NotApplicableReason::UnsupportedRank(0));
        }
        let results = kept
            .iter()
            .filter_map(|p| renumbered[dims[*p] as usize])
            .map(d)
            .collect();
        operands.push(OperandPlan {
            reassociation: unit_reassociation(&kept, dims.len()),
            map: AffineMap::new(kept_loops.len() as u32, 0, results),
        });
    }
    let kept_iterators = kept_loops.iter().map(|l| iterators[*l]).collect();
    GenericPlan::new(s, operands, kept_iterators)
}

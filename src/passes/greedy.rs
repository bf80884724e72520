//! A worklist-driven rewrite driver.

use crate::ir::{OpId, Program};
use crate::matchers::NotApplicable;
use crate::passes::PassError;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct GreedyConfig {
    /// Maximum number of sweeps over the root before giving up.
    pub max_iterations: usize,
    /// Maximum number of successful rewrites in one run.
    pub max_rewrites: usize,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        GreedyConfig {
            max_iterations: 10,
            max_rewrites: 100_000,
        }
    }
}

/// A local rewrite rooted at one operation.
///
/// Implementations must check every precondition before mutating the program: on
/// `Err(NotApplicable)` the program is unchanged, on `Ok(())` the rewrite is complete.
pub trait RewritePattern {
    fn name(&self) -> &'static str;

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable>;
}

/// Applies `patterns` to the operations nested in `root` until no pattern applies. Returns the
/// number of rewrites performed.
pub fn apply_patterns_greedily(
    program: &mut Program,
    root: OpId,
    patterns: &[&dyn RewritePattern],
    config: &GreedyConfig,
) -> Result<usize, PassError> {
    let mut rewrites = 0;
    for iteration in 0..config.max_iterations {
        let mut worklist: VecDeque<OpId> = program.walk(root).into();
        let mut visited = HashSet::new();
        let mut changed = false;
        while let Some(op) = worklist.pop_front() {
            if op == root || program.is_erased(op) || !visited.insert(op) {
                continue;
            }
            for pattern in patterns {
                let watermark = program.op_watermark();
                match pattern.match_and_rewrite(program, op) {
                    Ok(()) => {
                        debug!("{} applied to {op}", pattern.name());
                        rewrites += 1;
                        changed = true;
                        if rewrites > config.max_rewrites {
                            return Err(PassError::DidNotConverge {
                                iterations: iteration + 1,
                                rewrites,
                            });
                        }
                        worklist.extend(program.ops_created_since(watermark));
                        break;
                    }
                    Err(NotApplicable(reason)) => {
                        trace!("{} does not apply to {op}: {reason:?}", pattern.name());
                    }
                }
            }
        }
        if !changed {
            return Ok(rewrites);
        }
    }
    Err(PassError::DidNotConverge {
        iterations: config.max_iterations,
        rewrites,
    })
}

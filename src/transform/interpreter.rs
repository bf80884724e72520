use crate::ir::{OpId, Program};
use crate::matchers::ZeroSearch;
use crate::passes::GreedyConfig;
use crate::transform::{Handle, HandleArena, HandleRef, TransformError, TransformOp, TransformOpT};

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// A sequence of transforms. Each step's operands refer to [HandleRef::Root] or to results of
/// earlier steps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Schedule {
    steps: Vec<TransformOp>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step and returns its index.
    pub fn push(&mut self, op: impl Into<TransformOp>) -> usize {
        self.steps.push(op.into());
        self.steps.len() - 1
    }

    pub fn steps(&self) -> &[TransformOp] {
        &self.steps
    }

    /// Replays the schedule against `root`.
    pub fn run<'p>(&self, program: &'p mut Program, root: OpId) -> Result<Interpreter<'p>, TransformError> {
        let mut interpreter = Interpreter::new(program, root);
        interpreter.run(self)?;
        Ok(interpreter)
    }
}

/// Applies transforms one at a time, tracking the handles they produce.
pub struct Interpreter<'p> {
    pub program: &'p mut Program,
    pub handles: HandleArena,
    pub greedy: GreedyConfig,
    pub zero: ZeroSearch,
    root: Handle,
    results: Vec<Vec<Handle>>,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p mut Program, root: OpId) -> Self {
        let mut handles = HandleArena::new();
        let root = handles.insert(vec![root]);
        Interpreter {
            program,
            handles,
            greedy: GreedyConfig::default(),
            zero: ZeroSearch::default(),
            root,
            results: vec![],
        }
    }

    pub fn resolve(&self, handle: HandleRef) -> Result<Handle, TransformError> {
        match handle {
            HandleRef::Root => Ok(self.root),
            HandleRef::Result { step, index } => self
                .results
                .get(step)
                .and_then(|r| r.get(index))
                .copied()
                .ok_or(TransformError::UndefinedResult { step, index }),
        }
    }

    /// The payload ops of `handle`.
    pub fn payload(&self, handle: HandleRef) -> Result<Vec<OpId>, TransformError> {
        let handle = self.resolve(handle)?;
        Ok(self.handles.get(self.program, handle)?.to_vec())
    }

    /// Returns the payload of `handle` and marks it consumed.
    pub fn consume(&mut self, handle: HandleRef) -> Result<Vec<OpId>, TransformError> {
        let payload = self.payload(handle)?;
        self.handles.consume(self.resolve(handle)?)?;
        Ok(payload)
    }

    /// Issues a new handle.
    pub fn produce(&mut self, payload: Vec<OpId>) -> Handle {
        self.handles.insert(payload)
    }

    /// Invalidates every handle into the ops nested in `boundary`.
    pub fn invalidate_within(&mut self, boundary: &[OpId]) {
        let n = self.handles.invalidate_within(self.program, boundary);
        debug!("Invalidated {n} handle(s)");
    }

    /// The handles produced by `step`.
    pub fn results(&self, step: usize) -> Option<&[Handle]> {
        self.results.get(step).map(Vec::as_slice)
    }

    /// Applies a single transform as the next step and returns the step's index.
    pub fn apply(&mut self, op: &TransformOp) -> Result<usize, TransformError> {
        let step = self.results.len();
        info!("Applying step {step}: {}", op.name());
        let produced = op.apply(self)?;
        debug!("Step {step} produced {} handle(s)", produced.len());
        self.results.push(produced);
        Ok(step)
    }

    pub fn run(&mut self, schedule: &Schedule) -> Result<(), TransformError> {
        for op in schedule.steps() {
            self.apply(op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::func;
    use crate::dialect::linalg;
    use crate::dialect::tensor;
    use crate::ir::{Builder, Type};
    use crate::shape;
    use crate::transform::{CanonicalizeOp, MatchOp, PackMatmul};

    fn matmul_program() -> (Program, OpId) {
        let mut program = Program::new();
        let t = |s| Type::tensor(s, Dtype::Float32);
        let (func, body) = program.add_function(
            "f",
            &[t(shape![32, 64]), t(shape![64, 16])],
            &[t(shape![32, 16])],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let init = tensor::empty(&mut b, shape![32, 16], Dtype::Float32);
        let mm = linalg::matmul(&mut b, args[0], args[1], init);
        let result = b.program.result(mm, 0);
        func::return_(&mut b, &[result]);
        (program, func)
    }

    #[test]
    fn test_schedule_packs_matched_matmul() {
        let (mut program, func) = matmul_program();
        let mut schedule = Schedule::new();
        let matched = schedule.push(MatchOp {
            target: HandleRef::Root,
            op_names: vec!["linalg.matmul".to_string()],
        });
        let packed = schedule.push(PackMatmul {
            target: HandleRef::of(matched),
            blocking_factors: vec![8, 8, 16],
            use_vnni: false,
        });
        let interp = schedule.run(&mut program, func).unwrap();
        let blocked = interp.payload(HandleRef::of(packed)).unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(interp.program.kind(blocked[0]).name(), "linalg.generic");
        assert_eq!(
            interp.payload(HandleRef::of(matched)),
            Err(TransformError::ConsumedHandle(interp.resolve(HandleRef::of(matched)).unwrap()))
        );
    }

    #[test]
    fn test_canonicalize_invalidates_nested_handles() {
        let (mut program, func) = matmul_program();
        let mut interp = Interpreter::new(&mut program, func);
        let matched = interp
            .apply(
                &MatchOp {
                    target: HandleRef::Root,
                    op_names: vec!["linalg.matmul".to_string()],
                }
                .into(),
            )
            .unwrap();
        interp
            .apply(&CanonicalizeOp { target: HandleRef::Root }.into())
            .unwrap();
        let stale = interp.resolve(HandleRef::of(matched)).unwrap();
        assert_eq!(
            interp.payload(HandleRef::of(matched)),
            Err(TransformError::StaleHandle(stale))
        );
        assert!(interp.payload(HandleRef::Root).is_ok());
    }

    #[test]
    fn test_reference_to_a_later_step_is_an_error() {
        let (mut program, func) = matmul_program();
        let mut schedule = Schedule::new();
        schedule.push(CanonicalizeOp {
            target: HandleRef::of(3),
        });
        assert!(matches!(
            schedule.run(&mut program, func),
            Err(TransformError::UndefinedResult { step: 3, index: 0 })
        ));
    }

    #[test]
    fn test_schedule_round_trips_through_bincode() {
        let mut schedule = Schedule::new();
        let m = schedule.push(MatchOp {
            target: HandleRef::Root,
            op_names: vec!["linalg.matmul".to_string()],
        });
        schedule.push(PackMatmul {
            target: HandleRef::of(m),
            blocking_factors: vec![32, 32, 32],
            use_vnni: true,
        });
        let bytes = bincode::serialize(&schedule).unwrap();
        let decoded: Schedule = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, schedule);
    }
}

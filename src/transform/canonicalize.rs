use crate::passes::canonicalize::canonicalize;
use crate::transform::{Handle, HandleRef, Interpreter, TransformError, TransformOpT};

use serde::{Deserialize, Serialize};

/// Canonicalizes everything nested in the target. Invalidates handles into the target.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CanonicalizeOp {
    pub target: HandleRef,
}

impl TransformOpT for CanonicalizeOp {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let targets = cx.payload(self.target)?;
        for target in &targets {
            canonicalize(cx.program, *target, &cx.greedy)?;
        }
        cx.invalidate_within(&targets);
        Ok(vec![])
    }
}

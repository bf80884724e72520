use crate::transform::{Handle, HandleRef, Interpreter, TransformError, TransformOpT};

use serde::{Deserialize, Serialize};

/// Produces a handle to every op nested in the target (excluding the target itself) whose name
/// is one of `op_names`, in pre-order.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MatchOp {
    pub target: HandleRef,
    pub op_names: Vec<String>,
}

impl TransformOpT for MatchOp {
    fn name(&self) -> &'static str {
        "match"
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let mut found = vec![];
        for root in cx.payload(self.target)? {
            found.extend(cx.program.walk(root).into_iter().skip(1).filter(|op| {
                let name = cx.program.kind(*op).name();
                self.op_names.iter().any(|n| n == name)
            }));
        }
        Ok(vec![cx.produce(found)])
    }
}

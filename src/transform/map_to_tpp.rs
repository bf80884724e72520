use crate::dialect::tpp::PrimitiveKind;
use crate::ir::{OpId, Program};
use crate::matchers::match_primitive;
use crate::passes::linalg_to_tpp::{tag_primitives, OpFilter};
use crate::transform::{Handle, HandleRef, Interpreter, TransformError, TransformOpT};

use serde::{Deserialize, Serialize};

/// Tags the generics nested in the target with the primitive they compute. With `kinds`
/// non-empty only those primitives are tagged (`[Brgemm, VnniBrgemm]` maps to brgemm only).
///
/// Runs a fixpoint rewrite, so handles into the target are invalidated.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MapLinalgToTpp {
    pub target: HandleRef,
    pub kinds: Vec<PrimitiveKind>,
}

impl MapLinalgToTpp {
    pub fn to_brgemm(target: HandleRef) -> Self {
        MapLinalgToTpp {
            target,
            kinds: vec![PrimitiveKind::Brgemm, PrimitiveKind::VnniBrgemm],
        }
    }
}

impl TransformOpT for MapLinalgToTpp {
    fn name(&self) -> &'static str {
        "map_linalg_to_tpp"
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let targets = cx.payload(self.target)?;
        let filter: Option<OpFilter> = if self.kinds.is_empty() {
            None
        } else {
            let kinds = self.kinds.clone();
            let zero = cx.zero;
            Some(Box::new(move |program: &Program, op: OpId| {
                kinds
                    .iter()
                    .any(|kind| match_primitive(program, op, *kind, &zero).is_ok())
            }))
        };
        for target in &targets {
            tag_primitives(cx.program, *target, &cx.zero, filter.as_ref(), &cx.greedy)?;
        }
        cx.invalidate_within(&targets);
        Ok(vec![])
    }
}

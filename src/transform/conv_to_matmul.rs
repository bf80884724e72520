use crate::common::static_extents;
use crate::dialect::arith::{self, ArithOp};
use crate::dialect::linalg::{self, LinalgOp, Structured};
use crate::dialect::{memref, scf, Offset};
use crate::ir::{Builder, OpId, Program, ValueId};
use crate::matchers::NotApplicableReason;
use crate::transform::{
    not_applicable, Handle, HandleRef, Interpreter, TransformError, TransformOpT,
};

use log::debug;
use serde::{Deserialize, Serialize};

const NAME: &str = "map_conv_to_matmul";

/// Rewrites `linalg.conv_2d_nhwc_hwcf` on buffers into a loop nest over `(n, p, r, s)` around a
/// `linalg.matmul` of `[Q, C] x [C, F] -> [Q, F]` slices.
///
/// Consumes the target and produces a handle to the matmuls.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MapConvToMatmul {
    pub target: HandleRef,
}

impl TransformOpT for MapConvToMatmul {
    fn name(&self) -> &'static str {
        NAME
    }

    fn operands(&self) -> Vec<HandleRef> {
        vec![self.target]
    }

    fn apply<'p>(&self, cx: &mut Interpreter<'p>) -> Result<Vec<Handle>, TransformError> {
        let targets = cx.consume(self.target)?;
        let mut matmuls = Vec::with_capacity(targets.len());
        for op in targets {
            matmuls.push(conv_to_matmul(cx.program, op)?);
        }
        Ok(vec![cx.produce(matmuls)])
    }
}

fn scaled(b: &mut Builder, iv: ValueId, factor: i64) -> ValueId {
    if factor == 1 {
        return iv;
    }
    let factor = arith::constant_index(b, factor);
    arith::binary(b, ArithOp::MulI, iv, factor)
}

pub fn conv_to_matmul(program: &mut Program, op: OpId) -> Result<OpId, TransformError> {
    let na = |reason| not_applicable(NAME, op, reason);
    let s = Structured::get(program, op).ok_or(na(NotApplicableReason::NotStructured))?;
    let LinalgOp::Conv2dNhwcHwcf { strides, dilations } = s.linalg() else {
        return Err(na(NotApplicableReason::AccessPattern));
    };
    if !s.has_buffer_semantics() {
        return Err(na(NotApplicableReason::NotBuffers));
    }
    let extents = |idx: usize| static_extents(s.operand_shape(idx));
    let (Some(input), Some(filter), Some(output)) = (extents(0), extents(1), extents(2)) else {
        return Err(na(NotApplicableReason::DynamicShape));
    };
    if input.len() != 4 || filter.len() != 4 || output.len() != 4 {
        return Err(na(NotApplicableReason::UnsupportedRank(input.len())));
    }
    let (n, p, q, f) = (output[0], output[1], output[2], output[3]);
    let (r, s_, c) = (filter[0], filter[1], filter[2]);
    let [sh, sw] = strides.map(|v| v as i64);
    let [dh, dw] = dilations.map(|v| v as i64);
    let (image, weights, out) = (s.inputs()[0], s.inputs()[1], s.inits()[0]);

    let mut b = Builder::before(program, op);
    let mut matmul = None;
    let bounds = [n, p, r, s_].map(|v| v as i64);
    scf::loop_nest(&mut b, &bounds, |b, ivs| {
        let (ni, pi, ri, si) = (ivs[0], ivs[1], ivs[2], ivs[3]);
        let row = scaled(b, pi, sh);
        let tap = scaled(b, ri, dh);
        let h = arith::binary(b, ArithOp::AddI, row, tap);
        let w = scaled(b, si, dw);
        let lhs = memref::subview(
            b,
            image,
            &[Offset::Dynamic(ni), Offset::Dynamic(h), Offset::Dynamic(w), Offset::Static(0)],
            vec![1, 1, q, c],
            vec![1, 1, sw as u64, 1],
            vec![0, 1],
        );
        let rhs = memref::subview(
            b,
            weights,
            &[Offset::Dynamic(ri), Offset::Dynamic(si), Offset::Static(0), Offset::Static(0)],
            vec![1, 1, c, f],
            vec![1, 1, 1, 1],
            vec![0, 1],
        );
        let acc = memref::subview(
            b,
            out,
            &[Offset::Dynamic(ni), Offset::Dynamic(pi), Offset::Static(0), Offset::Static(0)],
            vec![1, 1, q, f],
            vec![1, 1, 1, 1],
            vec![0, 1],
        );
        matmul = Some(linalg::matmul(b, lhs, rhs, acc));
    });
    b.erase_op(op);
    let matmul = matmul.ok_or(na(NotApplicableReason::Other(Some("empty loop nest"))))?;
    debug!("Mapped {op} to {matmul}");
    Ok(matmul)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dim, Dtype};
    use crate::ir::Type;
    use crate::shape;

    fn conv(
        input: crate::common::Shape,
        filter: crate::common::Shape,
        output: crate::common::Shape,
        strides: [u64; 2],
        tensors: bool,
    ) -> (Program, OpId, OpId) {
        let mut program = Program::new();
        let ty = |s| {
            if tensors {
                Type::tensor(s, Dtype::Float32)
            } else {
                Type::memref(s, Dtype::Float32)
            }
        };
        let (func, body) = program.add_function("f", &[ty(input), ty(filter), ty(output)], &[]);
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let op = linalg::conv_2d_nhwc_hwcf(&mut b, args[0], args[1], args[2], strides, [1, 1]);
        (program, func, op)
    }

    #[test]
    fn test_unit_stride_conv() {
        let (mut program, func, op) = conv(
            shape![1, 6, 6, 3],
            shape![3, 3, 3, 8],
            shape![1, 4, 4, 8],
            [1, 1],
            false,
        );
        let mm = conv_to_matmul(&mut program, op).unwrap();
        assert!(program.is_erased(op));
        assert_eq!(program.kind(mm).name(), "linalg.matmul");
        let shapes: Vec<_> = program
            .operands(mm)
            .iter()
            .map(|v| program.shaped_type(*v).unwrap().shape.clone())
            .collect();
        assert_eq!(shapes, vec![shape![4, 3], shape![3, 8], shape![4, 8]]);
        let loops = program
            .walk(func)
            .into_iter()
            .filter(|o| program.kind(*o).is_scf_for())
            .count();
        assert_eq!(loops, 4);
    }

    #[test]
    fn test_strided_conv_slices_with_stride() {
        let (mut program, _, op) = conv(
            shape![1, 9, 9, 3],
            shape![3, 3, 3, 8],
            shape![1, 4, 4, 8],
            [2, 2],
            false,
        );
        let mm = conv_to_matmul(&mut program, op).unwrap();
        let lhs = program.shaped_type(program.operands(mm)[0]).unwrap();
        assert_eq!(lhs.shape, shape![4, 3]);
        let layout = lhs.layout.as_ref().unwrap();
        assert_eq!(&layout.strides[..], &[Dim::Static(6), Dim::Static(1)][..]);
        let muls = program
            .walk(program.module())
            .into_iter()
            .filter(|o| program.kind(*o).name() == "arith.muli")
            .count();
        assert_eq!(muls, 1);
    }

    #[test]
    fn test_schedule_maps_matched_conv() {
        let (mut program, func, op) = conv(
            shape![1, 6, 6, 3],
            shape![3, 3, 3, 8],
            shape![1, 4, 4, 8],
            [1, 1],
            false,
        );
        let mut schedule = crate::transform::Schedule::new();
        let matched = schedule.push(crate::transform::MatchOp {
            target: HandleRef::Root,
            op_names: vec!["linalg.conv_2d_nhwc_hwcf".to_string()],
        });
        let mapped = schedule.push(MapConvToMatmul {
            target: HandleRef::of(matched),
        });
        let interp = schedule.run(&mut program, func).unwrap();
        assert!(interp.program.is_erased(op));
        let matmuls = interp.payload(HandleRef::of(mapped)).unwrap();
        assert_eq!(matmuls.len(), 1);
        assert_eq!(interp.program.kind(matmuls[0]).name(), "linalg.matmul");
        assert!(matches!(
            interp.payload(HandleRef::of(matched)),
            Err(TransformError::ConsumedHandle(_))
        ));
    }

    #[test]
    fn test_tensor_conv_is_rejected() {
        let (mut program, _, op) = conv(
            shape![1, 6, 6, 3],
            shape![3, 3, 3, 8],
            shape![1, 4, 4, 8],
            [1, 1],
            true,
        );
        assert_eq!(
            conv_to_matmul(&mut program, op),
            Err(not_applicable(NAME, op, NotApplicableReason::NotBuffers))
        );
    }
}

//! `convert-tpp-to-loops`: expands tpp ops into `scf.for` nests of scalar loads, arithmetic and
//! stores.

use crate::common::{static_extents, DimSize, Dtype};
use crate::dialect::arith::{self, ArithOp};
use crate::dialect::pack::vnni;
use crate::dialect::tpp::TppOp;
use crate::dialect::{memref, scf};
use crate::ir::{Builder, OpId, Program, ShapedType, Type, ValueId};
use crate::matchers::{NotApplicable, NotApplicableReason};
use crate::passes::kernel_info::synthesized_map;
use crate::passes::{apply_patterns_greedily, GreedyConfig, Pass, PassError, RewritePattern};

use log::debug;

fn static_buffer(program: &Program, value: ValueId) -> Result<(&ShapedType, Vec<DimSize>), NotApplicable> {
    let ty = program
        .shaped_type(value)
        .filter(|t| t.is_memref())
        .ok_or(NotApplicable(NotApplicableReason::NotBuffers))?;
    let dims = static_extents(&ty.shape).ok_or(NotApplicable(NotApplicableReason::DynamicShape))?;
    Ok((ty, dims))
}

fn add_op(dtype: Dtype) -> ArithOp {
    if dtype.is_float() {
        ArithOp::AddF
    } else {
        ArithOp::AddI
    }
}

fn mul_op(dtype: Dtype) -> ArithOp {
    if dtype.is_float() {
        ArithOp::MulF
    } else {
        ArithOp::MulI
    }
}

fn as_index(size: DimSize) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Indices for each input dim of an elementwise operand, broadcast against the 2-D output.
#[derive(Clone)]
enum Access {
    Scalar,
    /// Per input dim, the output loop it follows or `None` for a broadcast (index 0).
    Buffer(Vec<Option<usize>>),
}

fn access(program: &Program, input: ValueId, output: &ShapedType) -> Access {
    let ty = program.value_type(input);
    match ty {
        Type::Shaped(_) => Access::Buffer(
            synthesized_map(ty, output)
                .results()
                .iter()
                .map(|e| e.as_dim().map(|d| d as usize))
                .collect(),
        ),
        _ => Access::Scalar,
    }
}

fn read(b: &mut Builder, input: ValueId, access: &Access, ivs: &[ValueId], zero: ValueId) -> ValueId {
    match access {
        Access::Scalar => input,
        Access::Buffer(dims) => {
            let indices: Vec<ValueId> = dims.iter().map(|d| d.map_or(zero, |d| ivs[d])).collect();
            memref::load(b, input, &indices)
        }
    }
}

/// `k * v + kv` on index values.
fn interleaved(b: &mut Builder, k: ValueId, v: ValueId, kv: ValueId) -> ValueId {
    let scaled = arith::binary(b, ArithOp::MulI, k, v);
    arith::binary(b, ArithOp::AddI, scaled, kv)
}

/// Checks preconditions and returns the loop bounds of `op`.
fn loop_bounds(program: &Program, tpp: TppOp, operands: &[ValueId]) -> Result<Vec<i64>, NotApplicable> {
    let output = operands[operands.len() - 1];
    let (out_ty, out_dims) = static_buffer(program, output)?;
    for input in &operands[..operands.len() - 1] {
        if program.value_type(*input).is_shaped() {
            static_buffer(program, *input)?;
        }
    }
    let [m, n] = out_dims[..] else {
        return Err(NotApplicable(NotApplicableReason::UnsupportedRank(out_dims.len())));
    };
    let (m, n) = (as_index(m), as_index(n));
    let dims_of = |v: ValueId| static_buffer(program, v).map(|(_, d)| d);
    match tpp {
        TppOp::Relu if !out_ty.dtype.is_float() => {
            Err(NotApplicable(NotApplicableReason::UnsupportedElementType))
        }
        TppOp::Identity | TppOp::Relu | TppOp::Add => Ok(vec![m, n]),
        TppOp::Matmul => Ok(vec![m, n, as_index(dims_of(operands[0])?[1])]),
        TppOp::Brgemm => {
            let a = dims_of(operands[0])?;
            Ok(vec![as_index(a[0]), m, n, as_index(a[2])])
        }
        TppOp::VnniMatmul | TppOp::VnniBrgemm => {
            let b_dims = dims_of(operands[1])?;
            let v = vnni::blocking_factor(out_ty.dtype)
                .ok_or(NotApplicable(NotApplicableReason::UnsupportedElementType))?;
            let rank = b_dims.len();
            let k = as_index(b_dims[rank - 3]);
            let v = as_index(v);
            if tpp == TppOp::VnniMatmul {
                Ok(vec![m, n, k, v])
            } else {
                Ok(vec![as_index(b_dims[0]), m, n, k, v])
            }
        }
    }
}

/// Emits the loop nest computing `op` before it. Preconditions are checked by [loop_bounds].
fn emit_loops(b: &mut Builder, tpp: TppOp, operands: &[ValueId], bounds: &[i64]) -> Option<OpId> {
    let output = operands[operands.len() - 1];
    let out_ty = b.program.shaped_type(output).cloned()?;
    let dtype = out_ty.dtype;
    let zero = arith::constant_index(b, 0);
    match tpp {
        TppOp::Identity | TppOp::Relu | TppOp::Add => {
            let inputs = &operands[..operands.len() - 1];
            let accesses: Vec<Access> = inputs.iter().map(|v| access(b.program, *v, &out_ty)).collect();
            let fzero = (tpp == TppOp::Relu).then(|| arith::constant_float(b, 0.0, dtype));
            scf::loop_nest(b, bounds, |b, ivs| {
                let values: Vec<ValueId> = inputs
                    .iter()
                    .zip(&accesses)
                    .map(|(v, a)| read(b, *v, a, ivs, zero))
                    .collect();
                let result = match (tpp, fzero) {
                    (TppOp::Relu, Some(fzero)) => arith::binary(b, ArithOp::MaxF, values[0], fzero),
                    (TppOp::Add, _) => arith::binary(b, add_op(dtype), values[0], values[1]),
                    _ => values[0],
                };
                memref::store(b, result, output, ivs);
            })
        }
        TppOp::Matmul | TppOp::Brgemm | TppOp::VnniMatmul | TppOp::VnniBrgemm => {
            let (a, bm) = (operands[0], operands[1]);
            let v = match tpp {
                TppOp::VnniMatmul | TppOp::VnniBrgemm => Some(arith::constant_index(b, bounds[bounds.len() - 1])),
                _ => None,
            };
            scf::loop_nest(b, bounds, |b, ivs| {
                let (a_idx, b_idx, c_idx) = match (tpp, v) {
                    (TppOp::Matmul, _) => (vec![ivs[0], ivs[2]], vec![ivs[2], ivs[1]], vec![ivs[0], ivs[1]]),
                    (TppOp::Brgemm, _) => (
                        vec![ivs[0], ivs[1], ivs[3]],
                        vec![ivs[0], ivs[3], ivs[2]],
                        vec![ivs[1], ivs[2]],
                    ),
                    (TppOp::VnniMatmul, Some(v)) => {
                        let k = interleaved(b, ivs[2], v, ivs[3]);
                        (vec![ivs[0], k], vec![ivs[2], ivs[1], ivs[3]], vec![ivs[0], ivs[1]])
                    }
                    (_, Some(v)) => {
                        let k = interleaved(b, ivs[3], v, ivs[4]);
                        (
                            vec![ivs[0], ivs[1], k],
                            vec![ivs[0], ivs[3], ivs[2], ivs[4]],
                            vec![ivs[1], ivs[2]],
                        )
                    }
                    _ => unreachable!("VNNI loops carry a blocking factor"),
                };
                let x = memref::load(b, a, &a_idx);
                let y = memref::load(b, bm, &b_idx);
                let acc = memref::load(b, output, &c_idx);
                let prod = arith::binary(b, mul_op(dtype), x, y);
                let sum = arith::binary(b, add_op(dtype), acc, prod);
                memref::store(b, sum, output, &c_idx);
            })
        }
    }
}

struct TppToLoops;

impl RewritePattern for TppToLoops {
    fn name(&self) -> &'static str {
        "tpp-to-loops"
    }

    fn match_and_rewrite(&self, program: &mut Program, op: OpId) -> Result<(), NotApplicable> {
        let tpp = program
            .kind(op)
            .as_tpp()
            .ok_or(NotApplicable(NotApplicableReason::Other(Some("not a tpp op"))))?;
        let operands = program.operands(op).to_vec();
        if operands.len() != tpp.num_inputs() + 1 {
            return Err(NotApplicable(NotApplicableReason::OperandCount));
        }
        let bounds = loop_bounds(program, tpp, &operands)?;
        let mut b = Builder::before(program, op);
        let nest = emit_loops(&mut b, tpp, &operands, &bounds);
        b.erase_op(op);
        debug!("Expanded {} {op} into loops {nest:?}", tpp.name());
        Ok(())
    }
}

#[derive(Default)]
pub struct ConvertTppToLoops {
    pub greedy: GreedyConfig,
}

impl Pass for ConvertTppToLoops {
    fn name(&self) -> &'static str {
        "convert-tpp-to-loops"
    }

    fn run(&self, program: &mut Program) -> Result<usize, PassError> {
        let mut total = 0;
        for func in program.functions() {
            total += apply_patterns_greedily(program, func, &[&TppToLoops], &self.greedy)?;
        }
        Ok(total)
    }
}

//! Structured operations: an iteration space, one indexing map per operand and (for
//! `linalg.generic`) a scalar body executed at every point of the space.

use crate::common::{Dim, DimSize};
use crate::ir::affine::{c, d, AffineMap};
use crate::ir::verify::VerifyError;
use crate::ir::{BlockId, Builder, OpId, OpKind, Program, Type, ValueId};
use crate::utils::{invert_permutation, is_permutation};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum IteratorType {
    Parallel,
    Reduction,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct GenericAttrs {
    pub indexing_maps: Vec<AffineMap>,
    pub iterator_types: Vec<IteratorType>,
    pub num_inputs: usize,
    /// Primitive tag attached by the tagging pass, e.g. `tpp.relu`.
    pub library_call: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum LinalgOp {
    Generic(GenericAttrs),
    Fill,
    Copy,
    /// Init dimension `k` corresponds to input dimension `permutation[k]`.
    Transpose {
        permutation: Vec<usize>,
    },
    Matmul,
    BatchReduceMatmul,
    Conv2dNhwcHwcf {
        strides: [DimSize; 2],
        dilations: [DimSize; 2],
    },
    Yield,
}

impl LinalgOp {
    pub fn name(&self) -> &'static str {
        match self {
            LinalgOp::Generic(_) => "linalg.generic",
            LinalgOp::Fill => "linalg.fill",
            LinalgOp::Copy => "linalg.copy",
            LinalgOp::Transpose { .. } => "linalg.transpose",
            LinalgOp::Matmul => "linalg.matmul",
            LinalgOp::BatchReduceMatmul => "linalg.batch_reduce_matmul",
            LinalgOp::Conv2dNhwcHwcf { .. } => "linalg.conv_2d_nhwc_hwcf",
            LinalgOp::Yield => "linalg.yield",
        }
    }

    pub fn as_generic(&self) -> Option<&GenericAttrs> {
        match self {
            LinalgOp::Generic(attrs) => Some(attrs),
            _ => None,
        }
    }
}

impl fmt::Display for IteratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IteratorType::Parallel => write!(f, "parallel"),
            IteratorType::Reduction => write!(f, "reduction"),
        }
    }
}

pub fn matmul_maps() -> Vec<AffineMap> {
    vec![
        AffineMap::new(3, 0, vec![d(0), d(2)]),
        AffineMap::new(3, 0, vec![d(2), d(1)]),
        AffineMap::new(3, 0, vec![d(0), d(1)]),
    ]
}

pub fn matmul_iterators() -> Vec<IteratorType> {
    use IteratorType::*;
    vec![Parallel, Parallel, Reduction]
}

pub fn brgemm_maps() -> Vec<AffineMap> {
    vec![
        AffineMap::new(4, 0, vec![d(0), d(1), d(3)]),
        AffineMap::new(4, 0, vec![d(0), d(3), d(2)]),
        AffineMap::new(4, 0, vec![d(1), d(2)]),
    ]
}

pub fn brgemm_iterators() -> Vec<IteratorType> {
    use IteratorType::*;
    vec![Reduction, Parallel, Parallel, Reduction]
}

/// Maps of a VNNI matmul with blocking factor `v`: `(i, k*v + kv)`, `(k, j, kv)`, `(i, j)` over
/// `(i, j, k, kv)`.
pub fn vnni_matmul_maps(v: i64) -> Vec<AffineMap> {
    vec![
        AffineMap::new(4, 0, vec![d(0), d(2) * c(v) + d(3)]),
        AffineMap::new(4, 0, vec![d(2), d(1), d(3)]),
        AffineMap::new(4, 0, vec![d(0), d(1)]),
    ]
}

pub fn vnni_matmul_iterators() -> Vec<IteratorType> {
    use IteratorType::*;
    vec![Parallel, Parallel, Reduction, Reduction]
}

/// Maps of a VNNI batch-reduce matmul over `(b, i, j, k, kv)`.
pub fn vnni_brgemm_maps(v: i64) -> Vec<AffineMap> {
    vec![
        AffineMap::new(5, 0, vec![d(0), d(1), d(3) * c(v) + d(4)]),
        AffineMap::new(5, 0, vec![d(0), d(3), d(2), d(4)]),
        AffineMap::new(5, 0, vec![d(1), d(2)]),
    ]
}

pub fn vnni_brgemm_iterators() -> Vec<IteratorType> {
    use IteratorType::*;
    vec![Reduction, Parallel, Parallel, Reduction, Reduction]
}

/// A read-only view of a structured operation.
#[derive(Clone, Copy)]
pub struct Structured<'p> {
    program: &'p Program,
    op: OpId,
}

impl<'p> Structured<'p> {
    /// Returns a view if `op` is a structured op (any linalg op but the terminator).
    pub fn get(program: &'p Program, op: OpId) -> Option<Self> {
        match program.kind(op) {
            OpKind::Linalg(LinalgOp::Yield) => None,
            OpKind::Linalg(_) => Some(Structured { program, op }),
            _ => None,
        }
    }

    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn linalg(&self) -> &'p LinalgOp {
        match self.program.kind(self.op) {
            OpKind::Linalg(op) => op,
            _ => unreachable!(),
        }
    }

    pub fn generic(&self) -> Option<&'p GenericAttrs> {
        self.linalg().as_generic()
    }

    pub fn operands(&self) -> &'p [ValueId] {
        self.program.operands(self.op)
    }

    pub fn num_inputs(&self) -> usize {
        match self.linalg() {
            LinalgOp::Generic(attrs) => attrs.num_inputs,
            LinalgOp::Fill | LinalgOp::Copy | LinalgOp::Transpose { .. } => 1,
            LinalgOp::Matmul | LinalgOp::BatchReduceMatmul | LinalgOp::Conv2dNhwcHwcf { .. } => 2,
            LinalgOp::Yield => 0,
        }
    }

    pub fn inputs(&self) -> &'p [ValueId] {
        &self.operands()[..self.num_inputs()]
    }

    pub fn inits(&self) -> &'p [ValueId] {
        &self.operands()[self.num_inputs()..]
    }

    pub fn num_inits(&self) -> usize {
        self.operands().len() - self.num_inputs()
    }

    fn init_rank(&self) -> u32 {
        self.inits()
            .first()
            .and_then(|v| self.program.shaped_type(*v))
            .map_or(0, |s| s.rank() as u32)
    }

    pub fn indexing_maps(&self) -> Vec<AffineMap> {
        match self.linalg() {
            LinalgOp::Generic(attrs) => attrs.indexing_maps.clone(),
            LinalgOp::Fill => {
                let rank = self.init_rank();
                vec![AffineMap::new(rank, 0, vec![]), AffineMap::identity(rank)]
            }
            LinalgOp::Copy => {
                let rank = self.init_rank();
                vec![AffineMap::identity(rank), AffineMap::identity(rank)]
            }
            LinalgOp::Transpose { permutation } => {
                let inverse = invert_permutation(permutation);
                let rank = permutation.len() as u32;
                vec![
                    AffineMap::new(rank, 0, inverse.iter().map(|&i| d(i as u32)).collect()),
                    AffineMap::identity(rank),
                ]
            }
            LinalgOp::Matmul => matmul_maps(),
            LinalgOp::BatchReduceMatmul => brgemm_maps(),
            LinalgOp::Conv2dNhwcHwcf { strides, dilations } => {
                let (sh, sw) = (strides[0] as i64, strides[1] as i64);
                let (dh, dw) = (dilations[0] as i64, dilations[1] as i64);
                // (n, oh, ow, f, kh, kw, c)
                vec![
                    AffineMap::new(
                        7,
                        0,
                        vec![
                            d(0),
                            d(1) * c(sh) + d(4) * c(dh),
                            d(2) * c(sw) + d(5) * c(dw),
                            d(6),
                        ],
                    ),
                    AffineMap::new(7, 0, vec![d(4), d(5), d(6), d(3)]),
                    AffineMap::new(7, 0, vec![d(0), d(1), d(2), d(3)]),
                ]
            }
            LinalgOp::Yield => vec![],
        }
    }

    pub fn iterator_types(&self) -> Vec<IteratorType> {
        use IteratorType::*;
        match self.linalg() {
            LinalgOp::Generic(attrs) => attrs.iterator_types.clone(),
            LinalgOp::Fill | LinalgOp::Copy | LinalgOp::Transpose { .. } => {
                vec![Parallel; self.init_rank() as usize]
            }
            LinalgOp::Matmul => matmul_iterators(),
            LinalgOp::BatchReduceMatmul => brgemm_iterators(),
            LinalgOp::Conv2dNhwcHwcf { .. } => vec![
                Parallel, Parallel, Parallel, Parallel, Reduction, Reduction, Reduction,
            ],
            LinalgOp::Yield => vec![],
        }
    }

    pub fn num_loops(&self) -> usize {
        self.iterator_types().len()
    }

    pub fn num_parallel_loops(&self) -> usize {
        self.iterator_types()
            .iter()
            .filter(|t| **t == IteratorType::Parallel)
            .count()
    }

    pub fn num_reduction_loops(&self) -> usize {
        self.num_loops() - self.num_parallel_loops()
    }

    /// The indexing map of the operand at `idx`.
    pub fn matching_indexing_map(&self, idx: usize) -> AffineMap {
        self.indexing_maps().swap_remove(idx)
    }

    /// The body of a `linalg.generic`.
    pub fn body(&self) -> Option<BlockId> {
        match self.linalg() {
            LinalgOp::Generic(_) => self.program.body(self.op),
            _ => None,
        }
    }

    pub fn library_call(&self) -> Option<&'p str> {
        self.generic().and_then(|g| g.library_call.as_deref())
    }

    /// All shaped operands are buffers and the op produces no results.
    pub fn has_buffer_semantics(&self) -> bool {
        self.program.results(self.op).is_empty()
            && self.operands().iter().all(|v| match self.program.value_type(*v) {
                Type::Shaped(s) => s.is_memref(),
                _ => true,
            })
    }

    pub fn has_tensor_semantics(&self) -> bool {
        self.operands().iter().all(|v| match self.program.value_type(*v) {
            Type::Shaped(s) => s.is_tensor(),
            _ => true,
        })
    }

    pub fn has_static_shapes(&self) -> bool {
        self.operands().iter().all(|v| {
            self.program
                .shaped_type(*v)
                .map_or(true, |s| s.has_static_shape())
        })
    }

    /// The shape of an operand; scalars have rank 0.
    pub fn operand_shape(&self, idx: usize) -> &'p [Dim] {
        self.program
            .shaped_type(self.operands()[idx])
            .map_or(&[], |s| &s.shape[..])
    }

    /// Static loop extents, derived from operand dims indexed by a bare loop dimension.
    pub fn static_loop_ranges(&self) -> Option<Vec<DimSize>> {
        let maps = self.indexing_maps();
        let mut ranges: Vec<Option<DimSize>> = vec![None; self.num_loops()];
        for (idx, map) in maps.iter().enumerate() {
            let shape = self.operand_shape(idx);
            for (result, dim) in map.results().iter().zip(shape) {
                if let (Some(loop_dim), Some(size)) = (result.as_dim(), dim.static_size()) {
                    ranges[loop_dim as usize].get_or_insert(size);
                }
            }
        }
        ranges.into_iter().collect()
    }
}

pub fn set_library_call(program: &mut Program, op: OpId, call: Option<String>) {
    if let OpKind::Linalg(LinalgOp::Generic(attrs)) = program.kind_mut(op) {
        attrs.library_call = call;
    }
}

fn element_arg_type(program: &Program, value: ValueId) -> Type {
    match program.value_type(value) {
        Type::Shaped(s) => Type::Scalar(s.dtype),
        other => other.clone(),
    }
}

fn tensor_result_types(program: &Program, inits: &[ValueId]) -> Vec<Type> {
    inits
        .iter()
        .map(|v| program.value_type(*v))
        .filter(|t| t.as_shaped().map_or(false, |s| s.is_tensor()))
        .cloned()
        .collect()
}

/// Builds a `linalg.generic`. `body` receives one block argument per operand (element types) and
/// must terminate the block with [yield_].
pub fn generic(
    b: &mut Builder,
    inputs: &[ValueId],
    inits: &[ValueId],
    indexing_maps: Vec<AffineMap>,
    iterator_types: Vec<IteratorType>,
    body: impl FnOnce(&mut Builder, &[ValueId]),
) -> OpId {
    let operands: Vec<ValueId> = inputs.iter().chain(inits).copied().collect();
    let arg_types: Vec<Type> = operands
        .iter()
        .map(|v| element_arg_type(b.program, *v))
        .collect();
    let block = b.build_block(&arg_types, body);
    let results = tensor_result_types(b.program, inits);
    b.create(
        OpKind::Linalg(LinalgOp::Generic(GenericAttrs {
            indexing_maps,
            iterator_types,
            num_inputs: inputs.len(),
            library_call: None,
        })),
        &operands,
        results,
        vec![block],
    )
}

/// Builds a `linalg.generic` around an existing detached `body`, e.g. one cloned from another
/// generic.
pub fn generic_with_body(
    b: &mut Builder,
    inputs: &[ValueId],
    inits: &[ValueId],
    indexing_maps: Vec<AffineMap>,
    iterator_types: Vec<IteratorType>,
    body: BlockId,
) -> OpId {
    let operands: Vec<ValueId> = inputs.iter().chain(inits).copied().collect();
    let results = tensor_result_types(b.program, inits);
    b.create(
        OpKind::Linalg(LinalgOp::Generic(GenericAttrs {
            indexing_maps,
            iterator_types,
            num_inputs: inputs.len(),
            library_call: None,
        })),
        &operands,
        results,
        vec![body],
    )
}

pub fn yield_(b: &mut Builder, values: &[ValueId]) -> OpId {
    b.create(OpKind::Linalg(LinalgOp::Yield), values, vec![], vec![])
}

fn named(b: &mut Builder, op: LinalgOp, inputs: &[ValueId], init: ValueId) -> OpId {
    let operands: Vec<ValueId> = inputs.iter().copied().chain([init]).collect();
    let results = tensor_result_types(b.program, &[init]);
    b.create(OpKind::Linalg(op), &operands, results, vec![])
}

pub fn fill(b: &mut Builder, value: ValueId, init: ValueId) -> OpId {
    named(b, LinalgOp::Fill, &[value], init)
}

pub fn copy(b: &mut Builder, input: ValueId, init: ValueId) -> OpId {
    named(b, LinalgOp::Copy, &[input], init)
}

pub fn transpose(b: &mut Builder, input: ValueId, init: ValueId, permutation: Vec<usize>) -> OpId {
    named(b, LinalgOp::Transpose { permutation }, &[input], init)
}

pub fn matmul(b: &mut Builder, a: ValueId, bm: ValueId, c: ValueId) -> OpId {
    named(b, LinalgOp::Matmul, &[a, bm], c)
}

pub fn batch_reduce_matmul(b: &mut Builder, a: ValueId, bm: ValueId, c: ValueId) -> OpId {
    named(b, LinalgOp::BatchReduceMatmul, &[a, bm], c)
}

pub fn conv_2d_nhwc_hwcf(
    b: &mut Builder,
    input: ValueId,
    filter: ValueId,
    init: ValueId,
    strides: [DimSize; 2],
    dilations: [DimSize; 2],
) -> OpId {
    named(
        b,
        LinalgOp::Conv2dNhwcHwcf { strides, dilations },
        &[input, filter],
        init,
    )
}

/// Checks the structural invariants of a structured op.
pub fn verify(program: &Program, op: OpId) -> Result<(), VerifyError> {
    let Some(s) = Structured::get(program, op) else {
        return Ok(());
    };
    if let LinalgOp::Transpose { permutation } = s.linalg() {
        if !is_permutation(permutation) {
            return Err(VerifyError::InvalidPermutation(permutation.clone()));
        }
    }
    let maps = s.indexing_maps();
    if maps.len() != s.operands().len() {
        return Err(VerifyError::Malformed(format!(
            "expected {} indexing maps, got {}",
            s.operands().len(),
            maps.len()
        )));
    }
    let num_loops = s.num_loops();
    for (idx, map) in maps.iter().enumerate() {
        if map.num_dims() as usize != num_loops {
            return Err(VerifyError::Malformed(format!(
                "indexing map #{idx} has {} dims, expected {num_loops}",
                map.num_dims()
            )));
        }
        let rank = s.operand_shape(idx).len();
        if map.num_results() != rank {
            return Err(VerifyError::Malformed(format!(
                "indexing map #{idx} has {} results, operand rank is {rank}",
                map.num_results()
            )));
        }
    }
    if s.num_inits() == 0 {
        return Err(VerifyError::Malformed("expected at least one init".into()));
    }
    if let Some(body) = s.body() {
        if program.block_args(body).len() != s.operands().len() {
            return Err(VerifyError::Malformed(
                "body must have one argument per operand".into(),
            ));
        }
        match program.terminator(body) {
            Some(t) if *program.kind(t) == OpKind::Linalg(LinalgOp::Yield) => {
                if program.operands(t).len() != s.num_inits() {
                    return Err(VerifyError::Malformed(
                        "yield must produce one value per init".into(),
                    ));
                }
            }
            _ => return Err(VerifyError::MissingTerminator),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::arith::{self, ArithOp};
    use crate::shape;

    #[test]
    fn test_named_matmul_structure() {
        let mut program = Program::new();
        let ty = |s| Type::memref(s, Dtype::Float32);
        let (_, body) = program.add_function(
            "mm",
            &[ty(shape![4, 8]), ty(shape![8, 16]), ty(shape![4, 16])],
            &[],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let mm = matmul(&mut b, args[0], args[1], args[2]);
        let s = Structured::get(&program, mm).unwrap();
        assert_eq!(s.num_inputs(), 2);
        assert_eq!(s.inits(), &args[2..]);
        assert!(s.has_buffer_semantics());
        assert_eq!(s.static_loop_ranges(), Some(vec![4, 16, 8]));
        assert!(verify(&program, mm).is_ok());
    }

    #[test]
    fn test_transpose_input_map_is_inverse_permutation() {
        let mut program = Program::new();
        let (_, body) = program.add_function(
            "t",
            &[
                Type::memref(shape![2, 3, 4], Dtype::Float32),
                Type::memref(shape![4, 2, 3], Dtype::Float32),
            ],
            &[],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let t = transpose(&mut b, args[0], args[1], vec![2, 0, 1]);
        let s = Structured::get(&program, t).unwrap();
        assert_eq!(
            s.indexing_maps()[0],
            AffineMap::new(3, 0, vec![d(1), d(2), d(0)])
        );
        assert_eq!(s.static_loop_ranges(), Some(vec![4, 2, 3]));
    }

    #[test]
    fn test_generic_on_tensors_has_results_and_verifies() {
        let mut program = Program::new();
        let t = Type::tensor(shape![4, 4], Dtype::Float32);
        let (_, body) = program.add_function("add", &[t.clone(), t.clone()], &[t]);
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let g = generic(
            &mut b,
            &[args[0]],
            &[args[1]],
            vec![AffineMap::identity(2), AffineMap::identity(2)],
            vec![IteratorType::Parallel; 2],
            |b, a| {
                let s = arith::binary(b, ArithOp::AddF, a[0], a[1]);
                yield_(b, &[s]);
            },
        );
        assert_eq!(program.results(g).len(), 1);
        assert!(Structured::get(&program, g).unwrap().has_tensor_semantics());
        assert!(verify(&program, g).is_ok());
    }

    #[test]
    fn test_verify_rejects_map_rank_mismatch() {
        let mut program = Program::new();
        let t = Type::memref(shape![4, 4], Dtype::Float32);
        let (_, body) = program.add_function("bad", &[t.clone(), t], &[]);
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let g = generic(
            &mut b,
            &[args[0]],
            &[args[1]],
            vec![AffineMap::new(2, 0, vec![d(0)]), AffineMap::identity(2)],
            vec![IteratorType::Parallel; 2],
            |b, a| {
                yield_(b, &[a[0]]);
            },
        );
        assert!(matches!(verify(&program, g), Err(VerifyError::Malformed(_))));
    }
}

use crate::common::{Dim, DimSize, Dtype, Shape};
use crate::dialect::{collapsed_shape, Offset, Reassociation, SliceAttrs};
use crate::ir::types::row_major_strides;
use crate::ir::{Builder, OpKind, ShapedType, Type, ValueId};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum MemRefOp {
    Alloc,
    Dealloc,
    SubView(SliceAttrs),
    /// `memref.copy %source, %target`.
    Copy,
    Load,
    Store,
    CollapseShape { reassociation: Reassociation },
    ExpandShape { reassociation: Reassociation },
}

impl MemRefOp {
    pub fn name(&self) -> &'static str {
        match self {
            MemRefOp::Alloc => "memref.alloc",
            MemRefOp::Dealloc => "memref.dealloc",
            MemRefOp::SubView(_) => "memref.subview",
            MemRefOp::Copy => "memref.copy",
            MemRefOp::Load => "memref.load",
            MemRefOp::Store => "memref.store",
            MemRefOp::CollapseShape { .. } => "memref.collapse_shape",
            MemRefOp::ExpandShape { .. } => "memref.expand_shape",
        }
    }
}

pub fn alloc(b: &mut Builder, shape: Shape, dtype: Dtype) -> ValueId {
    b.create_value(OpKind::MemRef(MemRefOp::Alloc), &[], Type::memref(shape, dtype))
}

pub fn dealloc(b: &mut Builder, buffer: ValueId) {
    b.create(OpKind::MemRef(MemRefOp::Dealloc), &[buffer], vec![], vec![]);
}

pub fn copy(b: &mut Builder, source: ValueId, target: ValueId) {
    b.create(OpKind::MemRef(MemRefOp::Copy), &[source, target], vec![], vec![]);
}

pub fn load(b: &mut Builder, buffer: ValueId, indices: &[ValueId]) -> ValueId {
    let dtype = b
        .value_type(buffer)
        .element_type()
        .expect("load from a non-shaped value");
    let operands: Vec<ValueId> = [buffer].into_iter().chain(indices.iter().copied()).collect();
    b.create_value(OpKind::MemRef(MemRefOp::Load), &operands, Type::Scalar(dtype))
}

pub fn store(b: &mut Builder, value: ValueId, buffer: ValueId, indices: &[ValueId]) {
    let operands: Vec<ValueId> = [value, buffer]
        .into_iter()
        .chain(indices.iter().copied())
        .collect();
    b.create(OpKind::MemRef(MemRefOp::Store), &operands, vec![], vec![]);
}

/// The strides of `ty`, with unknown entries as [Dim::Dynamic], and its offset.
fn strides_and_offset(ty: &ShapedType) -> (Vec<Dim>, Dim) {
    match &ty.layout {
        Some(layout) => (layout.strides.to_vec(), layout.offset),
        None => match ty.static_strides() {
            Some(strides) => (strides.into_iter().map(Dim::Static).collect(), Dim::Static(0)),
            None => (vec![Dim::Dynamic; ty.rank()], Dim::Static(0)),
        },
    }
}

/// The type of a subview of `source`: sizes become the shape, strides multiply and offsets
/// accumulate into the layout offset.
pub fn subview_type(source: &ShapedType, attrs: &SliceAttrs) -> ShapedType {
    let (src_strides, src_offset) = strides_and_offset(source);
    let strides: Vec<Dim> = src_strides
        .iter()
        .zip(&attrs.strides)
        .map(|(s, step)| match s {
            Dim::Static(s) => Dim::Static(s * step),
            Dim::Dynamic => Dim::Dynamic,
        })
        .collect();
    let offset = attrs
        .static_offsets
        .iter()
        .zip(&src_strides)
        .try_fold(src_offset.static_size(), |acc, (o, s)| match (acc, o, s) {
            (Some(acc), Some(o), Dim::Static(s)) => Some(Some(acc + (*o as DimSize) * s)),
            _ => None,
        })
        .flatten()
        .map_or(Dim::Dynamic, Dim::Static);
    let kept: Vec<Dim> = strides
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !attrs.dropped_dims.contains(i))
        .map(|(_, s)| s)
        .collect();
    ShapedType::memref_strided(attrs.result_shape(), source.dtype, offset, &kept)
}

pub fn subview(
    b: &mut Builder,
    source: ValueId,
    offsets: &[Offset],
    sizes: Vec<DimSize>,
    strides: Vec<DimSize>,
    dropped_dims: Vec<usize>,
) -> ValueId {
    let (attrs, dynamic) = SliceAttrs::new(offsets, sizes, strides, dropped_dims);
    let source_ty = b
        .value_type(source)
        .as_shaped()
        .expect("subview of a non-shaped value")
        .clone();
    let result = subview_type(&source_ty, &attrs);
    let operands: Vec<ValueId> = [source].into_iter().chain(dynamic).collect();
    b.create_value(
        OpKind::MemRef(MemRefOp::SubView(attrs)),
        &operands,
        Type::Shaped(result),
    )
}

/// The type of a collapsed buffer. Each group takes the stride of its innermost dimension.
pub fn collapse_shape_type(source: &ShapedType, reassociation: &[Vec<usize>]) -> ShapedType {
    let shape = collapsed_shape(&source.shape, reassociation);
    if source.has_identity_layout() {
        return ShapedType::memref(shape, source.dtype);
    }
    let (strides, offset) = strides_and_offset(source);
    let collapsed: SmallVec<[Dim; 5]> = reassociation
        .iter()
        .map(|group| group.last().map_or(Dim::Static(1), |&d| strides[d]))
        .collect();
    ShapedType::memref_strided(shape, source.dtype, offset, &collapsed)
}

pub fn collapse_shape(b: &mut Builder, source: ValueId, reassociation: Reassociation) -> ValueId {
    let source_ty = b
        .value_type(source)
        .as_shaped()
        .expect("collapse of a non-shaped value")
        .clone();
    let result = collapse_shape_type(&source_ty, &reassociation);
    b.create_value(
        OpKind::MemRef(MemRefOp::CollapseShape { reassociation }),
        &[source],
        Type::Shaped(result),
    )
}

/// Expands a contiguous buffer to `shape`.
pub fn expand_shape(
    b: &mut Builder,
    source: ValueId,
    reassociation: Reassociation,
    shape: Shape,
) -> ValueId {
    let dtype = b
        .value_type(source)
        .element_type()
        .expect("expand of a non-shaped value");
    b.create_value(
        OpKind::MemRef(MemRefOp::ExpandShape { reassociation }),
        &[source],
        Type::memref(shape, dtype),
    )
}

/// Row-major strides of a static shape as layout entries.
pub fn identity_strides(shape: &[DimSize]) -> Vec<Dim> {
    row_major_strides(shape).into_iter().map(Dim::Static).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Program;
    use crate::shape;

    #[test]
    fn test_subview_type_keeps_parent_strides() {
        let mut program = Program::new();
        let (_, body) = program.add_function(
            "f",
            &[Type::memref(shape![8, 32, 64], Dtype::Float32)],
            &[],
        );
        let src = program.block_args(body)[0];
        let mut b = Builder::at_end(&mut program, body);
        let view = subview(
            &mut b,
            src,
            &[Offset::Static(1), Offset::Static(0), Offset::Static(0)],
            vec![1, 32, 64],
            vec![1, 1, 1],
            vec![0],
        );
        let ty = program.shaped_type(view).unwrap();
        assert_eq!(ty.shape, shape![32, 64]);
        assert_eq!(ty.static_strides(), Some(vec![64, 1]));
        assert_eq!(ty.layout.as_ref().unwrap().offset, Dim::Static(2048));
    }

    #[test]
    fn test_subview_dynamic_offset() {
        let mut program = Program::new();
        let (_, body) = program.add_function(
            "f",
            &[Type::memref(shape![4, 16], Dtype::Float32), Type::Index],
            &[],
        );
        let args = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let view = subview(
            &mut b,
            args[0],
            &[Offset::Dynamic(args[1]), Offset::Static(0)],
            vec![2, 16],
            vec![1, 1],
            vec![],
        );
        let ty = program.shaped_type(view).unwrap();
        assert_eq!(ty.layout.as_ref().unwrap().offset, Dim::Dynamic);
        assert_eq!(ty.static_strides(), Some(vec![16, 1]));
        let op = program.defining_op(view).unwrap();
        assert_eq!(program.operands(op), &[args[0], args[1]]);
    }

    #[test]
    fn test_collapse_strided() {
        let ty = ShapedType::memref_strided(
            shape![2, 4, 8],
            Dtype::Float32,
            Dim::Static(0),
            &[Dim::Static(64), Dim::Static(8), Dim::Static(1)],
        );
        let collapsed = collapse_shape_type(&ty, &[vec![0], vec![1, 2]]);
        assert_eq!(collapsed.shape, shape![2, 32]);
        assert_eq!(collapsed.static_strides(), Some(vec![64, 1]));
    }
}

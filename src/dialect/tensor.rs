use crate::common::{DimSize, Dtype, Shape};
use crate::dialect::pack::PackAttrs;
use crate::dialect::{collapsed_shape, Offset, Reassociation, SliceAttrs};
use crate::ir::{Builder, OpKind, ShapedType, Type, ValueId};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum TensorOp {
    Empty,
    Cast,
    ExtractSlice(SliceAttrs),
    Pack(PackAttrs),
    Unpack(PackAttrs),
    CollapseShape { reassociation: Reassociation },
    ExpandShape { reassociation: Reassociation },
}

impl TensorOp {
    pub fn name(&self) -> &'static str {
        match self {
            TensorOp::Empty => "tensor.empty",
            TensorOp::Cast => "tensor.cast",
            TensorOp::ExtractSlice(_) => "tensor.extract_slice",
            TensorOp::Pack(_) => "tensor.pack",
            TensorOp::Unpack(_) => "tensor.unpack",
            TensorOp::CollapseShape { .. } => "tensor.collapse_shape",
            TensorOp::ExpandShape { .. } => "tensor.expand_shape",
        }
    }
}

pub fn empty(b: &mut Builder, shape: Shape, dtype: Dtype) -> ValueId {
    b.create_value(OpKind::Tensor(TensorOp::Empty), &[], Type::tensor(shape, dtype))
}

pub fn cast(b: &mut Builder, source: ValueId, to: ShapedType) -> ValueId {
    debug_assert!(to.is_tensor());
    b.create_value(OpKind::Tensor(TensorOp::Cast), &[source], Type::Shaped(to))
}

pub fn extract_slice(
    b: &mut Builder,
    source: ValueId,
    offsets: &[Offset],
    sizes: Vec<DimSize>,
    strides: Vec<DimSize>,
    dropped_dims: Vec<usize>,
) -> ValueId {
    let (attrs, dynamic) = SliceAttrs::new(offsets, sizes, strides, dropped_dims);
    let dtype = b
        .value_type(source)
        .element_type()
        .expect("slice of a non-shaped value");
    let ty = Type::tensor(attrs.result_shape(), dtype);
    let operands: Vec<ValueId> = [source].into_iter().chain(dynamic).collect();
    b.create_value(OpKind::Tensor(TensorOp::ExtractSlice(attrs)), &operands, ty)
}

pub fn collapse_shape(b: &mut Builder, source: ValueId, reassociation: Reassociation) -> ValueId {
    let source_ty = b
        .value_type(source)
        .as_shaped()
        .expect("collapse of a non-shaped value")
        .clone();
    let ty = Type::tensor(
        collapsed_shape(&source_ty.shape, &reassociation),
        source_ty.dtype,
    );
    b.create_value(
        OpKind::Tensor(TensorOp::CollapseShape { reassociation }),
        &[source],
        ty,
    )
}

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
        OpKind::Tensor(TensorOp::ExpandShape { reassociation }),
        &[source],
        Type::tensor(shape, dtype),
    )
}

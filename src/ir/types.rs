use crate::common::{is_static_shape, static_extents, Dim, DimSize, Dtype, Shape};
use crate::utils::join_into_string;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Type {
    Scalar(Dtype),
    Index,
    Shaped(ShapedType),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ShapedKind {
    Tensor,
    MemRef,
}

/// A tensor value or a buffer (memref) with an optional strided layout.
///
/// A buffer without a layout is laid out row-major and contiguous.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ShapedType {
    pub kind: ShapedKind,
    pub shape: Shape,
    pub dtype: Dtype,
    pub layout: Option<StridedLayout>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct StridedLayout {
    pub offset: Dim,
    pub strides: SmallVec<[Dim; 5]>,
}

impl Type {
    pub fn tensor(shape: Shape, dtype: Dtype) -> Type {
        Type::Shaped(ShapedType::tensor(shape, dtype))
    }

    pub fn memref(shape: Shape, dtype: Dtype) -> Type {
        Type::Shaped(ShapedType::memref(shape, dtype))
    }

    pub fn as_shaped(&self) -> Option<&ShapedType> {
        match self {
            Type::Shaped(s) => Some(s),
            _ => None,
        }
    }

    /// The element type of a shaped type, or the type itself for scalars.
    pub fn element_type(&self) -> Option<Dtype> {
        match self {
            Type::Scalar(d) => Some(*d),
            Type::Shaped(s) => Some(s.dtype),
            Type::Index => None,
        }
    }

    pub fn is_int_or_float(&self) -> bool {
        matches!(self, Type::Scalar(_))
    }

    pub fn is_shaped(&self) -> bool {
        matches!(self, Type::Shaped(_))
    }
}

impl ShapedType {
    pub fn tensor(shape: Shape, dtype: Dtype) -> ShapedType {
        ShapedType {
            kind: ShapedKind::Tensor,
            shape,
            dtype,
            layout: None,
        }
    }

    pub fn memref(shape: Shape, dtype: Dtype) -> ShapedType {
        ShapedType {
            kind: ShapedKind::MemRef,
            shape,
            dtype,
            layout: None,
        }
    }

    pub fn memref_strided(shape: Shape, dtype: Dtype, offset: Dim, strides: &[Dim]) -> ShapedType {
        debug_assert_eq!(shape.len(), strides.len());
        ShapedType {
            kind: ShapedKind::MemRef,
            shape,
            dtype,
            layout: Some(StridedLayout {
                offset,
                strides: strides.iter().copied().collect(),
            }),
        }
    }

    /// A type of the same kind and element type with a new shape and an identity layout.
    pub fn with_shape(&self, shape: Shape) -> ShapedType {
        ShapedType {
            kind: self.kind,
            shape,
            dtype: self.dtype,
            layout: None,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_tensor(&self) -> bool {
        self.kind == ShapedKind::Tensor
    }

    #[inline]
    pub fn is_memref(&self) -> bool {
        self.kind == ShapedKind::MemRef
    }

    pub fn has_static_shape(&self) -> bool {
        is_static_shape(&self.shape)
    }

    pub fn num_elements(&self) -> Option<DimSize> {
        static_extents(&self.shape).map(|e| e.iter().product())
    }

    pub fn has_identity_layout(&self) -> bool {
        match &self.layout {
            None => true,
            Some(layout) => {
                let Some(extents) = static_extents(&self.shape) else {
                    return false;
                };
                layout.offset == Dim::Static(0)
                    && row_major_strides(&extents)
                        .into_iter()
                        .zip(&layout.strides)
                        .all(|(expected, actual)| Dim::Static(expected) == *actual)
            }
        }
    }

    /// Returns the strides of a buffer when all of them are known statically.
    ///
    /// Tensors have no strides. A buffer with an identity layout has the row-major strides of its
    /// shape, which must then be static.
    pub fn static_strides(&self) -> Option<Vec<DimSize>> {
        if !self.is_memref() {
            return None;
        }
        match &self.layout {
            None => static_extents(&self.shape).map(|e| row_major_strides(&e)),
            Some(layout) => static_extents(&layout.strides),
        }
    }
}

/// Row-major (C-order) strides of a shape, in elements.
pub fn row_major_strides(extents: &[DimSize]) -> Vec<DimSize> {
    let mut strides = vec![1; extents.len()];
    for idx in (0..extents.len().saturating_sub(1)).rev() {
        strides[idx] = strides[idx + 1] * extents[idx + 1];
    }
    strides
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(d) => write!(f, "{d}"),
            Type::Index => write!(f, "index"),
            Type::Shaped(s) => write!(f, "{s}"),
        }
    }
}

impl Display for ShapedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            ShapedKind::Tensor => "tensor",
            ShapedKind::MemRef => "memref",
        };
        write!(f, "{name}<")?;
        for d in &self.shape {
            write!(f, "{d}x")?;
        }
        write!(f, "{}", self.dtype)?;
        if let Some(StridedLayout { offset, strides }) = &self.layout {
            write!(
                f,
                ", strided<[{}], offset: {offset}>",
                join_into_string(strides, ", ")
            )?;
        }
        write!(f, ">")
    }
}

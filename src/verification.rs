//! Reference semantics of `tensor.pack` and `tensor.unpack` over [ndarray] arrays: one element
//! copy per point of the iteration domain, with the padding value written at padded positions.
#![cfg(feature = "verification")]

use crate::common::{static_extents, Dim, DimSize};
use crate::dialect::pack::{PackError, PackInfo};

use ndarray::{ArrayD, ArrayViewD, Dimension, IxDyn};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReferenceError {
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error("Reference semantics need static tile sizes")]
    DynamicTiles,
    #[error("Packed position {0:?} lies in the padding but no padding value was given")]
    MissingPadding(Vec<usize>),
    #[error("Expected an array of shape {expected:?}; got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

fn static_shape(shape: &[usize]) -> Vec<Dim> {
    shape.iter().map(|s| Dim::Static(*s as DimSize)).collect()
}

fn to_usize(index: &[DimSize]) -> Vec<usize> {
    index.iter().map(|i| *i as usize).collect()
}

/// Packs `source` according to `info`. Without `padding` every tile must divide its dimension.
pub fn pack<T: Clone>(
    source: ArrayViewD<'_, T>,
    info: &PackInfo,
    padding: Option<T>,
) -> Result<ArrayD<T>, ReferenceError> {
    let tiles = info.static_tiles().ok_or(ReferenceError::DynamicTiles)?;
    let packed_shape = info.packed_shape(&static_shape(source.shape()), padding.is_some())?;
    let extents = static_extents(&packed_shape).ok_or(ReferenceError::DynamicTiles)?;
    let dims = to_usize(&extents);

    let mut values = Vec::with_capacity(dims.iter().product());
    for index in ndarray::indices(IxDyn(&dims)) {
        let packed_index: Vec<DimSize> = index.slice().iter().map(|i| *i as DimSize).collect();
        let source_index = to_usize(&info.source_index(&packed_index, &tiles));
        let in_bounds = source_index
            .iter()
            .zip(source.shape())
            .all(|(i, size)| i < size);
        let value = if in_bounds {
            source[IxDyn(&source_index)].clone()
        } else {
            padding
                .clone()
                .ok_or_else(|| ReferenceError::MissingPadding(index.slice().to_vec()))?
        };
        values.push(value);
    }
    let count = values.len();
    ArrayD::from_shape_vec(IxDyn(&dims), values).map_err(|_| ReferenceError::ShapeMismatch {
        expected: dims.clone(),
        actual: vec![count],
    })
}

/// Packs `source`, padding with zero. The padding tiles of TPP kernels are always zero-filled.
pub fn pack_zero_padded<T: Clone + num_traits::Zero>(
    source: ArrayViewD<'_, T>,
    info: &PackInfo,
) -> Result<ArrayD<T>, ReferenceError> {
    pack(source, info, Some(T::zero()))
}

/// Unpacks `packed` into an array of shape `dest_shape`, dropping padded positions.
pub fn unpack<T: Clone>(
    packed: ArrayViewD<'_, T>,
    info: &PackInfo,
    dest_shape: &[usize],
) -> Result<ArrayD<T>, ReferenceError> {
    let tiles = info.static_tiles().ok_or(ReferenceError::DynamicTiles)?;
    let expected = info.packed_shape(&static_shape(dest_shape), true)?;
    let expected = to_usize(&static_extents(&expected).ok_or(ReferenceError::DynamicTiles)?);
    if expected != packed.shape() {
        return Err(ReferenceError::ShapeMismatch {
            expected,
            actual: packed.shape().to_vec(),
        });
    }
    Ok(ArrayD::from_shape_fn(IxDyn(dest_shape), |index| {
        let dest_index: Vec<DimSize> = index.slice().iter().map(|i| *i as DimSize).collect();
        packed[IxDyn(&to_usize(&info.packed_index(&dest_index, &tiles)))].clone()
    }))
}

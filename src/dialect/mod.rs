pub mod arith;
pub mod func;
pub mod linalg;
pub mod memref;
pub mod pack;
pub mod scf;
pub mod tensor;
pub mod tpp;
pub mod xsmm;

use crate::common::{Dim, DimSize, Shape};
use crate::ir::ValueId;

use serde::{Deserialize, Serialize};

/// A mixed static/dynamic index operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offset {
    Static(i64),
    Dynamic(ValueId),
}

/// Offsets, sizes and strides of a slice. Dynamic offsets are operands of the slicing op, in
/// order, following the source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SliceAttrs {
    pub static_offsets: Vec<Option<i64>>,
    pub sizes: Vec<DimSize>,
    pub strides: Vec<DimSize>,
    /// Unit dimensions of the slice removed from the result type.
    pub dropped_dims: Vec<usize>,
}

/// Groups of consecutive dimensions merged by a collapse (or split by an expand).
pub type Reassociation = Vec<Vec<usize>>;

impl SliceAttrs {
    /// Splits mixed offsets into static attributes and the dynamic operand list.
    pub fn new(
        offsets: &[Offset],
        sizes: Vec<DimSize>,
        strides: Vec<DimSize>,
        dropped_dims: Vec<usize>,
    ) -> (SliceAttrs, Vec<ValueId>) {
        let mut dynamic = vec![];
        let static_offsets = offsets
            .iter()
            .map(|o| match o {
                Offset::Static(v) => Some(*v),
                Offset::Dynamic(v) => {
                    dynamic.push(*v);
                    None
                }
            })
            .collect();
        (
            SliceAttrs {
                static_offsets,
                sizes,
                strides,
                dropped_dims,
            },
            dynamic,
        )
    }

    /// The result shape after dropping unit dimensions.
    pub fn result_shape(&self) -> Shape {
        self.sizes
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.dropped_dims.contains(i))
            .map(|(_, s)| Dim::Static(*s))
            .collect()
    }
}

/// Returns `true` if `reassociation` partitions `0..rank` into consecutive, non-empty groups.
pub fn is_valid_reassociation(reassociation: &[Vec<usize>], rank: usize) -> bool {
    let mut next = 0;
    for group in reassociation {
        if group.is_empty() {
            return false;
        }
        for &d in group {
            if d != next {
                return false;
            }
            next += 1;
        }
    }
    next == rank
}

/// The shape obtained by merging each group of `reassociation`.
pub fn collapsed_shape(shape: &[Dim], reassociation: &[Vec<usize>]) -> Shape {
    reassociation
        .iter()
        .map(|group| {
            group.iter().try_fold(1, |acc, &d| shape[d].static_size().map(|s| acc * s))
                .map_or(Dim::Dynamic, Dim::Static)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn test_reassociation_validity() {
        assert!(is_valid_reassociation(&[vec![0, 1], vec![2]], 3));
        assert!(!is_valid_reassociation(&[vec![1, 0], vec![2]], 3));
        assert!(!is_valid_reassociation(&[vec![0]], 2));
        assert!(!is_valid_reassociation(&[vec![0], vec![], vec![1]], 2));
    }

    #[test]
    fn test_collapsed_shape_propagates_dynamic() {
        assert_eq!(
            collapsed_shape(&shape![2, 3, 4], &[vec![0, 1], vec![2]]),
            shape![6, 4]
        );
        assert_eq!(
            collapsed_shape(&shape![2, ?, 4], &[vec![0], vec![1, 2]]),
            shape![2, ?]
        );
    }
}

//! `tensor.pack` and `tensor.unpack`: conversion between a flat layout and a tiled (blocked)
//! layout.
//!
//! Packing a `13x15` tensor with `inner_dims_pos = [0, 1]` and `inner_tiles = [8, 2]` yields a
//! `2x8x8x2` tensor: the outer dims count tiles (rounded up, with padding on the high side) and
//! the inner dims index within a tile.

use crate::common::{Dim, DimSize, Dtype, Shape};
use crate::ir::verify::VerifyError;
use crate::ir::{Builder, OpId, OpKind, Program, ShapedType, Type, ValueId};
use crate::utils::{apply_permutation, invert_permutation, is_permutation};

use crate::dialect::tensor::{self, TensorOp};

use divrem::DivCeil;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum TileSize {
    Static(DimSize),
    /// Supplied at runtime by an index operand of the pack/unpack op.
    Dynamic,
}

/// The packing descriptor shared by `tensor.pack` and its inverse `tensor.unpack`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PackInfo {
    inner_dims_pos: Vec<usize>,
    inner_tiles: Vec<TileSize>,
    outer_dims_perm: Option<Vec<usize>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PackAttrs {
    pub info: PackInfo,
    pub has_padding: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub offset: DimSize,
    pub size: Dim,
    pub stride: DimSize,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PackError {
    #[error("Expected one tile per tiled dimension; got {tiles} tiles for {dims} dimensions")]
    TileCountMismatch { dims: usize, tiles: usize },
    #[error("Tiled dimension {0} is out of range for rank {1}")]
    DimOutOfRange(usize, usize),
    #[error("Tiled dimension {0} appears more than once")]
    DuplicateDim(usize),
    #[error("Tile sizes must be positive")]
    NonPositiveTile,
    #[error("Outer permutation {0:?} is not a permutation of {1} outer dimensions")]
    InvalidOuterPerm(Vec<usize>, usize),
    #[error("Tile {tile} does not divide dimension {dim} of size {size} and no padding value is given")]
    NotDivisible {
        dim: usize,
        size: DimSize,
        tile: DimSize,
    },
    #[error("Packed shape {0:?} has fewer dimensions than tiles")]
    PackedRankTooSmall(Shape),
    #[error("Operand is not a shaped value")]
    NotShaped,
}

/// The operands of a pack or unpack op, by role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackOperands {
    pub source: ValueId,
    pub dest: ValueId,
    pub padding: Option<ValueId>,
    pub dynamic_tiles: Vec<ValueId>,
}

impl PackInfo {
    pub fn new(
        inner_dims_pos: Vec<usize>,
        inner_tiles: Vec<TileSize>,
        outer_dims_perm: Option<Vec<usize>>,
    ) -> Result<Self, PackError> {
        if inner_dims_pos.len() != inner_tiles.len() {
            return Err(PackError::TileCountMismatch {
                dims: inner_dims_pos.len(),
                tiles: inner_tiles.len(),
            });
        }
        for (i, pos) in inner_dims_pos.iter().enumerate() {
            if inner_dims_pos[..i].contains(pos) {
                return Err(PackError::DuplicateDim(*pos));
            }
        }
        if inner_tiles.contains(&TileSize::Static(0)) {
            return Err(PackError::NonPositiveTile);
        }
        if let Some(perm) = &outer_dims_perm {
            if !is_permutation(perm) {
                return Err(PackError::InvalidOuterPerm(perm.clone(), perm.len()));
            }
        }
        Ok(PackInfo {
            inner_dims_pos,
            inner_tiles,
            outer_dims_perm,
        })
    }

    /// A descriptor with only static tiles.
    pub fn with_static_tiles(
        inner_dims_pos: Vec<usize>,
        tiles: &[DimSize],
        outer_dims_perm: Option<Vec<usize>>,
    ) -> Result<Self, PackError> {
        PackInfo::new(
            inner_dims_pos,
            tiles.iter().map(|t| TileSize::Static(*t)).collect(),
            outer_dims_perm,
        )
    }

    pub fn inner_dims_pos(&self) -> &[usize] {
        &self.inner_dims_pos
    }

    pub fn inner_tiles(&self) -> &[TileSize] {
        &self.inner_tiles
    }

    pub fn outer_dims_perm(&self) -> Option<&[usize]> {
        self.outer_dims_perm.as_deref()
    }

    pub fn num_tiles(&self) -> usize {
        self.inner_tiles.len()
    }

    pub fn num_dynamic_tiles(&self) -> usize {
        self.inner_tiles
            .iter()
            .filter(|t| **t == TileSize::Dynamic)
            .count()
    }

    /// Static tile sizes, if no tile is dynamic.
    pub fn static_tiles(&self) -> Option<Vec<DimSize>> {
        self.inner_tiles
            .iter()
            .map(|t| match t {
                TileSize::Static(s) => Some(*s),
                TileSize::Dynamic => None,
            })
            .collect()
    }

    /// The inverse of `outer_dims_perm`, if present.
    pub fn inverse_outer_perm(&self) -> Option<Vec<usize>> {
        self.outer_dims_perm.as_deref().map(invert_permutation)
    }

    /// The tile applied to source dimension `dim`, if it is tiled.
    pub fn tile_of(&self, dim: usize) -> Option<TileSize> {
        self.inner_dims_pos
            .iter()
            .position(|p| *p == dim)
            .map(|i| self.inner_tiles[i])
    }

    fn check_rank(&self, rank: usize) -> Result<(), PackError> {
        if let Some(bad) = self.inner_dims_pos.iter().find(|p| **p >= rank) {
            return Err(PackError::DimOutOfRange(*bad, rank));
        }
        if let Some(perm) = &self.outer_dims_perm {
            if perm.len() != rank {
                return Err(PackError::InvalidOuterPerm(perm.clone(), rank));
            }
        }
        Ok(())
    }

    /// Infers the packed shape of `source`.
    ///
    /// Without padding a static tile must divide its static dimension. If either is dynamic the
    /// outer extent is dynamic and divisibility is left to the caller.
    pub fn packed_shape(&self, source: &[Dim], has_padding: bool) -> Result<Shape, PackError> {
        self.check_rank(source.len())?;
        let mut outer: Vec<Dim> = Vec::with_capacity(source.len());
        for (dim, size) in source.iter().enumerate() {
            let outer_size = match (self.tile_of(dim), size) {
                (None, _) => *size,
                (Some(TileSize::Static(tile)), Dim::Static(size)) => {
                    if !has_padding && size % tile != 0 {
                        return Err(PackError::NotDivisible {
                            dim,
                            size: *size,
                            tile,
                        });
                    }
                    Dim::Static(DivCeil::div_ceil(*size, tile))
                }
                (Some(_), _) => Dim::Dynamic,
            };
            outer.push(outer_size);
        }
        if let Some(perm) = &self.outer_dims_perm {
            outer = apply_permutation(&outer, perm);
        }
        Ok(outer
            .into_iter()
            .chain(self.inner_tiles.iter().map(|t| match t {
                TileSize::Static(s) => Dim::Static(*s),
                TileSize::Dynamic => Dim::Dynamic,
            }))
            .collect())
    }

    pub fn packed_type(&self, source: &ShapedType, has_padding: bool) -> Result<ShapedType, PackError> {
        Ok(ShapedType::tensor(
            self.packed_shape(&source.shape, has_padding)?,
            source.dtype,
        ))
    }

    /// The shape covered by a packed shape: each tiled dimension becomes `outer * tile`.
    ///
    /// With padding, the actual unpacked extent may be smaller than the returned one.
    pub fn unpacked_shape(&self, packed: &[Dim]) -> Result<Shape, PackError> {
        if packed.len() < self.num_tiles() {
            return Err(PackError::PackedRankTooSmall(packed.iter().copied().collect()));
        }
        let rank = packed.len() - self.num_tiles();
        self.check_rank(rank)?;
        let mut outer: Vec<Dim> = packed[..rank].to_vec();
        if let Some(inverse) = self.inverse_outer_perm() {
            outer = apply_permutation(&outer, &inverse);
        }
        Ok(outer
            .into_iter()
            .enumerate()
            .map(|(dim, size)| match (self.tile_of(dim), size) {
                (None, size) => size,
                (Some(TileSize::Static(t)), Dim::Static(s)) => Dim::Static(s * t),
                (Some(_), _) => Dim::Dynamic,
            })
            .collect())
    }

    /// Maps a source index to its `(outer, inner)` packed index.
    pub fn packed_index(&self, source_index: &[DimSize], tiles: &[DimSize]) -> Vec<DimSize> {
        let mut outer: Vec<DimSize> = source_index.to_vec();
        let mut inner = Vec::with_capacity(tiles.len());
        for (&pos, &tile) in self.inner_dims_pos.iter().zip(tiles) {
            outer[pos] = source_index[pos] / tile;
            inner.push(source_index[pos] % tile);
        }
        if let Some(perm) = &self.outer_dims_perm {
            outer = apply_permutation(&outer, perm);
        }
        outer.extend(inner);
        outer
    }

    /// Maps a packed index back to the source index it covers (possibly in the padded region).
    pub fn source_index(&self, packed_index: &[DimSize], tiles: &[DimSize]) -> Vec<DimSize> {
        let rank = packed_index.len() - tiles.len();
        let mut outer: Vec<DimSize> = packed_index[..rank].to_vec();
        if let Some(inverse) = self.inverse_outer_perm() {
            outer = apply_permutation(&outer, &inverse);
        }
        for (i, (&pos, &tile)) in self.inner_dims_pos.iter().zip(tiles).enumerate() {
            outer[pos] = outer[pos] * tile + packed_index[rank + i];
        }
        outer
    }
}

impl fmt::Display for TileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileSize::Static(s) => write!(f, "{s}"),
            TileSize::Dynamic => write!(f, "?"),
        }
    }
}

fn whole(size: Dim) -> Range {
    Range {
        offset: 0,
        size,
        stride: 1,
    }
}

/// Splits the operands of a pack or unpack op.
pub fn pack_operands(program: &Program, op: OpId) -> Option<(PackOperands, &PackAttrs)> {
    let attrs = match program.kind(op) {
        OpKind::Tensor(TensorOp::Pack(attrs)) | OpKind::Tensor(TensorOp::Unpack(attrs)) => attrs,
        _ => return None,
    };
    let operands = program.operands(op);
    let (source, dest) = (operands[0], operands[1]);
    let (padding, rest) = if attrs.has_padding {
        (Some(operands[2]), &operands[3..])
    } else {
        (None, &operands[2..])
    };
    Some((
        PackOperands {
            source,
            dest,
            padding,
            dynamic_tiles: rest.to_vec(),
        },
        attrs,
    ))
}

/// The loops a pack or unpack op iterates over: the outer dims of the packed result for `pack`,
/// the dims of the unpacked result for `unpack`.
pub fn iteration_domain(program: &Program, op: OpId) -> Option<Vec<Range>> {
    let (operands, attrs) = pack_operands(program, op)?;
    match program.kind(op) {
        OpKind::Tensor(TensorOp::Pack(_)) => {
            let packed = program.shaped_type(operands.dest)?;
            let rank = packed.rank() - attrs.info.num_tiles();
            Some(packed.shape[..rank].iter().copied().map(whole).collect())
        }
        _ => {
            let dest = program.shaped_type(operands.dest)?;
            Some(dest.shape.iter().copied().map(whole).collect())
        }
    }
}

fn shaped(program: &Program, value: ValueId) -> Result<ShapedType, PackError> {
    program
        .shaped_type(value)
        .cloned()
        .ok_or(PackError::NotShaped)
}

/// Builds a `tensor.pack` of `source` into `dest`. `dynamic_tiles` supplies one index value per
/// dynamic tile, in order.
pub fn pack(
    b: &mut Builder,
    source: ValueId,
    dest: ValueId,
    info: PackInfo,
    padding: Option<ValueId>,
    dynamic_tiles: &[ValueId],
) -> Result<ValueId, PackError> {
    let source_ty = shaped(b.program, source)?;
    info.packed_shape(&source_ty.shape, padding.is_some())?;
    debug_assert_eq!(info.num_dynamic_tiles(), dynamic_tiles.len());
    let result_ty = b.value_type(dest).clone();
    let operands: Vec<ValueId> = [source, dest]
        .into_iter()
        .chain(padding)
        .chain(dynamic_tiles.iter().copied())
        .collect();
    let attrs = PackAttrs {
        info,
        has_padding: padding.is_some(),
    };
    Ok(b.create_value(OpKind::Tensor(TensorOp::Pack(attrs)), &operands, result_ty))
}

/// Packs `source` into a fresh `tensor.empty` of the inferred (static-tile) packed shape.
pub fn pack_into_empty(
    b: &mut Builder,
    source: ValueId,
    info: PackInfo,
    padding: Option<ValueId>,
) -> Result<ValueId, PackError> {
    let source_ty = shaped(b.program, source)?;
    let packed = info.packed_type(&source_ty, padding.is_some())?;
    let dest = tensor::empty(b, packed.shape, packed.dtype);
    pack(b, source, dest, info, padding, &[])
}

/// Builds a `tensor.unpack` of `source` into `dest`.
pub fn unpack(
    b: &mut Builder,
    source: ValueId,
    dest: ValueId,
    info: PackInfo,
    dynamic_tiles: &[ValueId],
) -> Result<ValueId, PackError> {
    let dest_ty = shaped(b.program, dest)?;
    info.packed_shape(&dest_ty.shape, true)?;
    debug_assert_eq!(info.num_dynamic_tiles(), dynamic_tiles.len());
    let operands: Vec<ValueId> = [source, dest]
        .into_iter()
        .chain(dynamic_tiles.iter().copied())
        .collect();
    let attrs = PackAttrs {
        info,
        has_padding: false,
    };
    Ok(b.create_value(
        OpKind::Tensor(TensorOp::Unpack(attrs)),
        &operands,
        Type::Shaped(dest_ty),
    ))
}

fn compatible(a: &[Dim], b: &[Dim]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x, y) {
            (Dim::Static(x), Dim::Static(y)) => x == y,
            _ => true,
        })
}

/// Verifies a pack or unpack op: the descriptor applies to the unpacked operand, its inferred
/// packed shape agrees with the packed operand, and operand counts and types line up.
pub fn verify(program: &Program, op: OpId) -> Result<(), VerifyError> {
    let Some((operands, attrs)) = pack_operands(program, op) else {
        return Ok(());
    };
    let is_pack = matches!(program.kind(op), OpKind::Tensor(TensorOp::Pack(_)));
    let source = shaped(program, operands.source)?;
    let dest = shaped(program, operands.dest)?;
    if source.dtype != dest.dtype {
        return Err(VerifyError::ElementTypeMismatch(source.dtype, dest.dtype));
    }
    if operands.dynamic_tiles.len() != attrs.info.num_dynamic_tiles() {
        return Err(VerifyError::Malformed(format!(
            "expected {} dynamic tile operands, got {}",
            attrs.info.num_dynamic_tiles(),
            operands.dynamic_tiles.len()
        )));
    }
    if let Some(padding) = operands.padding {
        if program.value_type(padding) != &Type::Scalar(source.dtype) {
            return Err(VerifyError::Malformed(
                "padding value must have the element type of the source".into(),
            ));
        }
    }
    let (unpacked, packed) = if is_pack { (&source, &dest) } else { (&dest, &source) };
    let expected = attrs
        .info
        .packed_shape(&unpacked.shape, !is_pack || attrs.has_padding)?;
    if !compatible(&expected, &packed.shape) {
        return Err(VerifyError::TypeMismatch {
            expected: ShapedType::tensor(expected, packed.dtype).to_string(),
            actual: packed.to_string(),
        });
    }
    Ok(())
}

/// Packing helpers for the VNNI layout, which interleaves pairs (or quads) of consecutive
/// reduction-dimension elements of the `B` operand for reduced-precision dot products.
pub mod vnni {
    use super::*;

    /// The number of elements interleaved along the reduction dimension.
    pub fn blocking_factor(dtype: Dtype) -> Option<DimSize> {
        match dtype {
            Dtype::Bfloat16 => Some(2),
            _ => None,
        }
    }

    /// The descriptor packing a `[.., K, N]` operand into `[.., K/v, N, v]`.
    pub fn pack_info(dtype: Dtype, rank: usize) -> Option<PackInfo> {
        let factor = blocking_factor(dtype)?;
        if rank < 2 {
            return None;
        }
        PackInfo::with_static_tiles(vec![rank - 2], &[factor], None).ok()
    }

    /// Returns `true` if `ty` has a trailing dimension equal to the blocking factor of its element
    /// type.
    pub fn is_vnni_packed(ty: &ShapedType) -> bool {
        match (blocking_factor(ty.dtype), ty.shape.last()) {
            (Some(f), Some(Dim::Static(last))) => ty.rank() >= 3 && *last == f,
            _ => false,
        }
    }
}

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

pub type DimSize = u64;
pub type Shape = SmallVec<[Dim; 5]>;

/// A single dimension extent: either known at compile time or dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Dim {
    Static(DimSize),
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Uint8,
    Sint8,
    Sint16,
    Sint32,
    Sint64,
    Float16,
    Bfloat16,
    Float32,
    Float64,
}

impl Dim {
    #[inline]
    pub fn is_static(&self) -> bool {
        matches!(self, Dim::Static(_))
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dim::Dynamic)
    }

    #[inline]
    pub fn static_size(&self) -> Option<DimSize> {
        match self {
            Dim::Static(s) => Some(*s),
            Dim::Dynamic => None,
        }
    }
}

impl From<DimSize> for Dim {
    fn from(value: DimSize) -> Self {
        Dim::Static(value)
    }
}

impl Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(s) => write!(f, "{s}"),
            Dim::Dynamic => write!(f, "?"),
        }
    }
}

/// Returns the static extents of `shape`, or `None` if any extent is dynamic.
pub fn static_extents(shape: &[Dim]) -> Option<Vec<DimSize>> {
    shape.iter().map(Dim::static_size).collect()
}

pub fn is_static_shape(shape: &[Dim]) -> bool {
    shape.iter().all(Dim::is_static)
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Sint16 | Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Sint32 | Dtype::Float32 => 4,
            Dtype::Sint64 | Dtype::Float64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            Dtype::Float16 | Dtype::Bfloat16 | Dtype::Float32 | Dtype::Float64
        )
    }

    pub fn is_int(&self) -> bool {
        !self.is_float()
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Sint64 => write!(f, "i64"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Float64 => write!(f, "f64"),
        }
    }
}

pub mod macros {
    /// Builds a [Shape](crate::common::Shape). `?` denotes a dynamic extent.
    ///
    /// ```
    /// # use tpp_lowering::{shape, common::Dim};
    /// let s = shape![4, ?, 8];
    /// assert_eq!(s[1], Dim::Dynamic);
    /// assert_eq!(s[2], Dim::Static(8));
    /// ```
    #[macro_export]
    macro_rules! shape {
        (@dim ?) => {
            $crate::common::Dim::Dynamic
        };
        (@dim $d:expr) => {
            $crate::common::Dim::Static($d)
        };
        ($($d:tt),* $(,)?) => {{
            // Bind to a variable with an explicit type to help out type inference.
            let s: $crate::common::Shape = $crate::smallvec::smallvec![ $( $crate::shape!(@dim $d) ),* ];
            s
        }};
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn test_shape_macro_mixes_static_and_dynamic() {
        let s = shape![2, ?, 4];
        assert_eq!(s.len(), 3);
        assert_eq!(s[0], Dim::Static(2));
        assert!(s[1].is_dynamic());
        assert!(!is_static_shape(&s));
        assert_eq!(static_extents(&shape![3, 5]), Some(vec![3, 5]));
        assert_eq!(static_extents(&s), None);
    }

    #[test]
    fn test_dtype_classes() {
        assert!(Dtype::Bfloat16.is_float());
        assert!(Dtype::Sint32.is_int());
        assert_eq!(Dtype::Bfloat16.size(), 2);
        assert_eq!(Dtype::Float32.to_string(), "f32");
    }
}

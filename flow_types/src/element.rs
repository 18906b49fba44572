use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar kinds storable in a container dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ScalarType {
    /// Encoded size of one scalar in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// True for the unsigned integer kinds accepted in reference tables.
    pub fn is_unsigned_int(&self) -> bool {
        matches!(self, Self::U8 | Self::U32 | Self::U64)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

/// Element descriptor of a dataset: a scalar kind plus an optional trailing
/// fixed shape. A plain column has an empty shape; a `(k, 2)` reference
/// table is `u64` with shape `[2]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementType {
    /// Scalar kind of every element in a row.
    pub scalar: ScalarType,
    /// Trailing fixed dimensions appended to the resizable first axis.
    pub shape: Vec<u32>,
}

impl ElementType {
    /// A plain scalar column of `scalar`.
    pub fn scalar(scalar: ScalarType) -> Self {
        Self {
            scalar,
            shape: Vec::new(),
        }
    }

    /// A column whose rows carry a trailing fixed shape.
    pub fn with_shape(scalar: ScalarType, shape: impl Into<Vec<u32>>) -> Self {
        Self {
            scalar,
            shape: shape.into(),
        }
    }

    /// Scalars per row.
    pub fn elements_per_row(&self) -> usize {
        self.shape.iter().map(|d| *d as usize).product()
    }

    /// Encoded size of one row in bytes.
    pub fn row_size(&self) -> usize {
        self.scalar.size() * self.elements_per_row()
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.is_empty() {
            write!(f, "{}", self.scalar)
        } else {
            write!(f, "{}{:?}", self.scalar, self.shape)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_sizes() {
        assert_eq!(ElementType::scalar(ScalarType::I64).row_size(), 8);
        assert_eq!(ElementType::with_shape(ScalarType::U64, [2]).row_size(), 16);
        assert_eq!(ElementType::with_shape(ScalarType::F32, [3, 4]).row_size(), 48);
        assert_eq!(ElementType::scalar(ScalarType::U8).row_size(), 1);
    }
}

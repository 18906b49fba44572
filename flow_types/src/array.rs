use crate::{ElementType, ScalarType};
use snafu::{ensure, Snafu};

/// Errors converting [`Array`] buffers to and from typed values.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("array holds {} elements, expected {}", actual, expected))]
    TypeMismatch { expected: String, actual: String },

    #[snafu(display("buffer of {} bytes is not a whole number of {}-byte rows", len, row_size))]
    RaggedBuffer { len: usize, row_size: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A raw, densely packed column buffer: `rows` rows of
/// [`ElementType::row_size`] bytes each, little-endian scalars.
///
/// This is the exchange format between the container, the data manager and
/// stages; typed views are produced on demand by the `to_*` accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: ElementType,
    data: Vec<u8>,
}

impl Array {
    /// An empty array of the given element type.
    pub fn new(element: ElementType) -> Self {
        Self {
            element,
            data: Vec::new(),
        }
    }

    /// An array of `rows` zero-filled rows.
    pub fn zeros(element: ElementType, rows: usize) -> Self {
        let data = vec![0u8; element.row_size() * rows];
        Self { element, data }
    }

    /// Wrap a raw buffer; `data` must contain a whole number of rows.
    pub fn from_raw(element: ElementType, data: Vec<u8>) -> Result<Self> {
        let row_size = element.row_size();
        ensure!(
            row_size > 0 && data.len() % row_size == 0,
            RaggedBufferSnafu {
                len: data.len(),
                row_size
            }
        );
        Ok(Self { element, data })
    }

    /// A plain `i64` column.
    pub fn from_i64s(values: &[i64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            element: ElementType::scalar(ScalarType::I64),
            data,
        }
    }

    /// A plain `u64` column.
    pub fn from_u64s(values: &[u64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            element: ElementType::scalar(ScalarType::U64),
            data,
        }
    }

    /// A plain `f64` column.
    pub fn from_f64s(values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            element: ElementType::scalar(ScalarType::F64),
            data,
        }
    }

    /// A `(k, 2)` table of `u64` pairs, the reference-table element type.
    pub fn from_u64_pairs(pairs: &[[u64; 2]]) -> Self {
        let mut data = Vec::with_capacity(pairs.len() * 16);
        for [a, b] in pairs {
            data.extend_from_slice(&a.to_le_bytes());
            data.extend_from_slice(&b.to_le_bytes());
        }
        Self {
            element: ElementType::with_shape(ScalarType::U64, [2]),
            data,
        }
    }

    /// Element descriptor of this buffer.
    pub fn element(&self) -> &ElementType {
        &self.element
    }

    /// Number of rows held.
    pub fn rows(&self) -> usize {
        let row_size = self.element.row_size();
        if row_size == 0 {
            0
        } else {
            self.data.len() / row_size
        }
    }

    /// True when no rows are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw little-endian bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume into the raw byte buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Raw bytes of row `idx`; panics when out of bounds (row counts are
    /// validated at the container boundary).
    pub fn row(&self, idx: usize) -> &[u8] {
        let row_size = self.element.row_size();
        &self.data[idx * row_size..(idx + 1) * row_size]
    }

    /// Decode every element as `i64`; requires an `i64` scalar kind.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        ensure!(
            self.element.scalar == ScalarType::I64,
            TypeMismatchSnafu {
                expected: "i64".to_string(),
                actual: self.element.to_string(),
            }
        );
        Ok(self
            .data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// Decode every element as `u64`, widening the narrower unsigned kinds;
    /// this is how 32-bit reference tables are read back.
    pub fn to_u64_vec(&self) -> Result<Vec<u64>> {
        match self.element.scalar {
            ScalarType::U8 => Ok(self.data.iter().map(|b| *b as u64).collect()),
            ScalarType::U32 => Ok(self
                .data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as u64)
                .collect()),
            ScalarType::U64 => Ok(self
                .data
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect()),
            _ => TypeMismatchSnafu {
                expected: "an unsigned integer kind".to_string(),
                actual: self.element.to_string(),
            }
            .fail(),
        }
    }

    /// Decode every element as `f64`; requires an `f64` scalar kind.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        ensure!(
            self.element.scalar == ScalarType::F64,
            TypeMismatchSnafu {
                expected: "f64".to_string(),
                actual: self.element.to_string(),
            }
        );
        Ok(self
            .data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// Decode a two-column unsigned table into index pairs.
    pub fn to_u64_pairs(&self) -> Result<Vec<[u64; 2]>> {
        ensure!(
            self.element.elements_per_row() == 2 && self.element.scalar.is_unsigned_int(),
            TypeMismatchSnafu {
                expected: "unsigned pairs".to_string(),
                actual: self.element.to_string(),
            }
        );
        let flat = self.to_u64_vec()?;
        Ok(flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
    }
}

use crate::{Array, ElementType, ScalarType};
use snafu::{ensure, Snafu};

/// Encoded size of one region entry (two little-endian `i64`s).
pub const REGION_ROW_SIZE: usize = 16;

/// Errors decoding region tables.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("region entry {} has negative offsets ({}, {})", index, start, stop))]
    NegativeOffset { index: usize, start: i64, stop: i64 },

    #[snafu(display("dataset is not a region table: {}", actual))]
    NotARegionTable { actual: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One row of a region table: the `[start, stop)` window into the canonical
/// reference table holding every reference row for this parent row.
/// `start == stop` means "no references".
///
/// Offsets are stored signed 64-bit for container parity, but negative
/// values are rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionEntry {
    /// First reference-table row for this parent.
    pub start: i64,
    /// One past the last reference-table row for this parent.
    pub stop: i64,
}

impl RegionEntry {
    /// The element descriptor used by region-table datasets.
    pub fn element_type() -> ElementType {
        ElementType::with_shape(ScalarType::I64, [2])
    }

    /// True when this parent has no references.
    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    /// Monotonically widen this entry to also cover `[start, stop)`.
    /// An empty entry is (re)initialized rather than widened, since its
    /// zero-fill offsets carry no information.
    pub fn widen(&mut self, start: i64, stop: i64) {
        if self.is_empty() {
            self.start = start;
            self.stop = stop;
        } else {
            self.start = self.start.min(start);
            self.stop = self.stop.max(stop);
        }
    }

    /// Encode as little-endian bytes.
    pub fn encode(&self) -> [u8; REGION_ROW_SIZE] {
        let mut buf = [0u8; REGION_ROW_SIZE];
        buf[..8].copy_from_slice(&self.start.to_le_bytes());
        buf[8..].copy_from_slice(&self.stop.to_le_bytes());
        buf
    }

    /// Decode a whole region-table buffer, validating offsets.
    pub fn decode_array(array: &Array) -> Result<Vec<Self>> {
        ensure!(
            *array.element() == Self::element_type(),
            NotARegionTableSnafu {
                actual: array.element().to_string(),
            }
        );
        let flat = array
            .bytes()
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect::<Vec<_>>();
        let entries: Vec<Self> = flat
            .chunks_exact(2)
            .map(|c| Self {
                start: c[0],
                stop: c[1],
            })
            .collect();
        for (index, entry) in entries.iter().enumerate() {
            ensure!(
                entry.start >= 0 && entry.stop >= 0,
                NegativeOffsetSnafu {
                    index,
                    start: entry.start,
                    stop: entry.stop,
                }
            );
        }
        Ok(entries)
    }

    /// Encode a slice of entries as a region-table buffer.
    pub fn encode_array(entries: &[Self]) -> Array {
        let mut data = Vec::with_capacity(entries.len() * REGION_ROW_SIZE);
        for entry in entries {
            data.extend_from_slice(&entry.encode());
        }
        Array::from_raw(Self::element_type(), data).expect("whole rows by construction")
    }
}

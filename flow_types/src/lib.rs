//! Shared vocabulary types for the flowline workspace: row slices, element
//! types, raw column buffers, reference-region entries and reserve specs.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod array;
mod element;
mod region;
mod slice;

pub use array::{Array, Error as ArrayError};
pub use element::{ElementType, ScalarType};
pub use region::{RegionEntry, Error as RegionError, REGION_ROW_SIZE};
pub use slice::RowSlice;

/// Access specification for coordinated appends, see `reserve_data`.
///
/// `Count(k)` requests `k` fresh rows at the end of the dataset; `Window`
/// asks for a specific range, growing the dataset if it does not reach that
/// far yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveSpec {
    /// Append `k` rows at the end of the dataset.
    Count(u64),
    /// Access (and possibly grow to cover) an explicit row window.
    Window(RowSlice),
}

impl From<u64> for ReserveSpec {
    fn from(count: u64) -> Self {
        Self::Count(count)
    }
}

impl From<RowSlice> for ReserveSpec {
    fn from(window: RowSlice) -> Self {
        Self::Window(window)
    }
}

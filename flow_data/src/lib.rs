//! Shared-store access layer: the store handle (primary/scratch routing),
//! the data manager (coordinated appends, bi-directional references,
//! region-table maintenance) and the reference algebra (single-hop and
//! chained dereference).

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod algebra;
pub mod manager;
pub mod store;

pub use algebra::{IndexGrid, MaskedData};
pub use manager::{DataManager, Deref, DerefOptions, Ragged, RefHandle, RefInfo};
pub use store::{AccessMode, Route, Store};

use flow_types::RowSlice;
use snafu::Snafu;
use std::path::PathBuf;

/// Dataset path inside its group, e.g. `stage0/obj0` -> `stage0/obj0/data`.
pub fn data_path(name: &str) -> String {
    format!("{}/data", name)
}

/// Canonical reference-table path for `a -> b`.
pub fn ref_path(a: &str, b: &str) -> String {
    format!("{}/ref/{}/ref", a, b)
}

/// Region-table path for endpoint `a` of `a <-> b`.
pub fn region_path(a: &str, b: &str) -> String {
    format!("{}/ref/{}/ref_region", a, b)
}

/// Errors of the shared-store access layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("cannot open store at {}: {}", path.display(), source))]
    StoreUnavailable {
        path: PathBuf,
        source: container_file::Error,
    },

    #[snafu(display("store operation on {} failed: {}", path, source))]
    Container {
        path: String,
        source: container_file::Error,
    },

    #[snafu(display("no dataset {}", name))]
    DatasetMissing { name: String },

    #[snafu(display("no references between {} and {}", parent, child))]
    ReferenceMissing { parent: String, child: String },

    #[snafu(display(
        "references for {} -> {} already exist in the opposite order",
        parent,
        child
    ))]
    ReferenceConflict { parent: String, child: String },

    #[snafu(display("incompatible reserve specs across workers: {}", reason))]
    SpecInvalid { reason: String },

    #[snafu(display(
        "write of {} to dataset {} is outside the reserved slice{}",
        requested,
        name,
        match reserved {
            Some(r) => format!(" {}", r),
            None => " (nothing reserved)".to_string(),
        },
    ))]
    WriteOutOfRange {
        name: String,
        requested: RowSlice,
        reserved: Option<RowSlice>,
    },

    #[snafu(display(
        "buffer of {} rows does not fit slice {} of dataset {}",
        rows,
        requested,
        name
    ))]
    WriteLengthMismatch {
        name: String,
        requested: RowSlice,
        rows: usize,
    },

    #[snafu(display("worker {} may not write to the store", rank))]
    ReadOnlyWorker { rank: usize },

    #[snafu(display("cannot remove scratch container: {}", source))]
    ScratchCleanup { source: std::io::Error },

    #[snafu(context(false), display("{}", source))]
    Comm { source: flow_comm::Error },

    #[snafu(context(false), display("{}", source))]
    Region { source: flow_types::RegionError },

    #[snafu(context(false), display("{}", source))]
    ArrayType { source: flow_types::ArrayError },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

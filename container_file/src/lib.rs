//! A single-file hierarchical binary container.
//!
//! The container holds a tree of groups; every node carries an attribute
//! bag, and leaf nodes may be datasets: 1-D columns of fixed-row-size
//! elements (a scalar kind plus an optional trailing fixed shape) that are
//! resizable on the first axis only, upward only. Row data lives in file
//! extents appended behind a fixed header; the tree itself (the TOC) is
//! serialized at the end of the file on flush, and the header is patched to
//! point at it.
//!
//! There is deliberately no rollback, no crash recovery and no space
//! reclamation on delete: the file is an append-oriented store and callers
//! that need to discard whole outputs route them to a scratch container
//! instead (see the store layer).

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod container;
mod toc;

pub use container::{ContainerFile, OpenMode, DEFAULT_CHUNK_ROWS};
pub use toc::{AttrValue, DatasetMeta};

use snafu::Snafu;
use std::path::PathBuf;

/// Errors surfaced by container operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("i/o failure on container {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{} is not a container file: {}", path.display(), reason))]
    InvalidFormat { path: PathBuf, reason: String },

    #[snafu(display("cannot encode container TOC: {}", source))]
    TocEncode { source: serde_json::Error },

    #[snafu(display("cannot decode container TOC: {}", source))]
    TocDecode { source: serde_json::Error },

    #[snafu(display("no object at {}", path))]
    NotFound { path: String },

    #[snafu(display("object at {} is not a group", path))]
    NotAGroup { path: String },

    #[snafu(display("object at {} is not a dataset", path))]
    NotADataset { path: String },

    #[snafu(display("an object already exists at {}", path))]
    AlreadyExists { path: String },

    #[snafu(display(
        "dataset {} holds {} elements, requested {}",
        path,
        existing,
        requested
    ))]
    ElementTypeMismatch {
        path: String,
        existing: String,
        requested: String,
    },

    #[snafu(display(
        "dataset {} has {} rows and cannot shrink to {}",
        path,
        rows,
        requested
    ))]
    ShrinkForbidden {
        path: String,
        rows: u64,
        requested: u64,
    },

    #[snafu(display(
        "row window [{}, {}) is out of bounds for dataset {} of {} rows",
        start,
        stop,
        path,
        rows
    ))]
    OutOfBounds {
        path: String,
        rows: u64,
        start: u64,
        stop: u64,
    },

    #[snafu(display("container {} is read-only", path.display()))]
    ReadOnly { path: PathBuf },

    #[snafu(display("buffer element type {} does not match dataset {} ({})", actual, path, expected))]
    BufferMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

//! This crate exists to coordinate versions of `tracing` and related crates
//! across the workspace: all other crates log through the re-export below so
//! that a version bump happens in exactly one place.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub use tracing;

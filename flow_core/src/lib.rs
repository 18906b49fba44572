//! The workflow engine: configuration model, stage/generator/resource
//! contracts, the build-time class registry, the chunk-producing source
//! iterator and the controller that drives stages over per-worker slices
//! with a per-iteration requirement cache.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod generator;
pub mod registry;
pub mod resource;
pub mod stage;

pub use cache::{Cache, CacheValue};
pub use config::{Requirement, WorkflowConfig};
pub use controller::{Controller, RunOptions};
pub use generator::{Generator, GeneratorBuild, LoopGenerator, DATASET_LOOP_GENERATOR};
pub use registry::Registry;
pub use resource::{Resource, ResourceBuild, ResourceSet};
pub use stage::{BoxedError, Stage, StageBuild, StageContext, StageResult};

use snafu::Snafu;

/// Errors of the workflow engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid workflow configuration: {}", reason))]
    ConfigInvalid { reason: String },

    #[snafu(display("cannot parse workflow configuration: {}", source))]
    ConfigParse { source: serde_yaml::Error },

    #[snafu(display("cannot read workflow configuration {}: {}", path, source))]
    ConfigRead { path: String, source: std::io::Error },

    #[snafu(display("{} failed in {} hook: {}", stage, phase, source))]
    StageFatal {
        stage: String,
        phase: &'static str,
        source: BoxedError,
    },

    #[snafu(context(false), display("{}", source))]
    Data { source: flow_data::Error },

    #[snafu(context(false), display("{}", source))]
    Comm { source: flow_comm::Error },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

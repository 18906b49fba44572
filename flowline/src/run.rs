//! Drives a sequence of workflows over one output container.

use crate::Config;
use flow_comm::{run_workers, SoloComm};
use flow_core::{Controller, Registry, RunOptions, WorkflowConfig};
use flow_data::{AccessMode, DataManager, Store};
use observability_deps::tracing::{debug, error, info};
use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::sync::Arc;

/// Driver errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("error loading workflow {}: {}", path.display(), source))]
    LoadConfig {
        path: PathBuf,
        source: flow_core::Error,
    },

    #[snafu(display("worker {} failed: {}", rank, source))]
    Worker { rank: usize, source: flow_core::Error },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Run every configured workflow with the built-in class registry.
pub fn command(config: Config) -> Result<()> {
    command_with_registry(config, &Registry::new())
}

/// Run every configured workflow, resolving stage/generator/resource
/// classes through `registry`. Workflows run in sequence; after the first,
/// each consumes the output container as its input.
pub fn command_with_registry(config: Config, registry: &Registry) -> Result<()> {
    let workers = config.effective_workers();
    let mut input = config.input_filename.clone();

    for path in &config.configs {
        let workflow = WorkflowConfig::from_path(path).context(LoadConfigSnafu { path })?;
        info!(
            config = %path.display(),
            output = %config.output_filename.display(),
            workers,
            "running workflow",
        );
        if let Ok(text) = std::fs::read_to_string(path) {
            debug!(config = %path.display(), "\n{}", text);
        }

        let mut drop_list = workflow.flow.drop.clone();
        drop_list.extend(config.drop.iter().cloned());

        let mode = if workers == 1 {
            AccessMode::ReadWriteSolo
        } else {
            AccessMode::ReadWriteCollective
        };
        let store = Store::new(&config.output_filename, mode, drop_list);
        let opts = RunOptions {
            input_filename: input.clone().or_else(|| Some(config.output_filename.clone())),
            start_position: config.start_position,
            end_position: config.end_position,
        };

        if workers == 1 {
            let dm = DataManager::new(store, Arc::new(SoloComm));
            Controller::build(&workflow, registry, dm, &opts)
                .and_then(|mut controller| controller.execute())
                .context(WorkerSnafu { rank: 0usize })?;
        } else {
            let results = run_workers(workers, |comm| -> flow_core::Result<()> {
                let dm = DataManager::new(Arc::clone(&store), comm);
                Controller::build(&workflow, registry, dm, &opts)?.execute()
            });
            let mut first_failure = None;
            for (rank, result) in results.into_iter().enumerate() {
                if let Err(e) = result {
                    error!(rank, %e, "worker failed");
                    if first_failure.is_none() {
                        first_failure = Some((rank, e));
                    }
                }
            }
            if let Some((rank, source)) = first_failure {
                return Err(Error::Worker { rank, source });
            }
        }

        // subsequent workflows consume this output
        input = Some(config.output_filename.clone());
    }
    Ok(())
}

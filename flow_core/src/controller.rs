//! The workflow controller: builds the pipeline from configuration and
//! drives the init / run / finish phases over per-worker source slices.

use crate::cache::{Cache, CacheValue};
use crate::config::{Requirement, WorkflowConfig};
use crate::generator::{Generator, GeneratorBuild, DATASET_LOOP_GENERATOR};
use crate::registry::Registry;
use crate::resource::{ResourceBuild, ResourceSet};
use crate::stage::{Stage, StageBuild, StageContext};
use crate::{BoxedError, ConfigInvalidSnafu, Error, Result};
use flow_data::{DataManager, Deref, DerefOptions};
use flow_types::RowSlice;
use hashbrown::HashSet;
use observability_deps::tracing::{debug, info, warn};
use std::path::PathBuf;

/// Per-run options handed down from the driver.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Input container staged into the output by the loop generator.
    pub input_filename: Option<PathBuf>,
    /// First source row to process.
    pub start_position: Option<u64>,
    /// One past the last source row to process.
    pub end_position: Option<u64>,
}

struct StageSlot {
    name: String,
    stage: Box<dyn Stage>,
}

/// Drives one workflow on one worker.
pub struct Controller {
    dm: DataManager,
    resources: ResourceSet,
    generator: Box<dyn Generator>,
    stages: Vec<StageSlot>,
    /// Union of requirements of stages `0..=k`, per stage index; entry `k`
    /// is the live set while stage `k` runs.
    cumulative: Vec<Vec<Requirement>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("source", &self.generator.dset_name())
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn fatal<'a>(stage: &'a str, phase: &'static str) -> impl FnOnce(BoxedError) -> Error + 'a {
    move |source| Error::StageFatal {
        stage: stage.to_string(),
        phase,
        source,
    }
}

impl Controller {
    /// Build the pipeline described by `config`: resolve the generator (or
    /// fall back to the default loop generator over the source dataset),
    /// construct every stage and resource through the registry, and
    /// precompute the per-stage live requirement sets.
    pub fn build(
        config: &WorkflowConfig,
        registry: &Registry,
        dm: DataManager,
        opts: &RunOptions,
    ) -> Result<Self> {
        let source_key = &config.flow.source;
        let (classname, dset_name, params) = match config.sections.get(source_key) {
            Some(section) => (
                section.classname.clone(),
                section
                    .dset_name
                    .clone()
                    .unwrap_or_else(|| source_key.clone()),
                section.params.clone(),
            ),
            None => {
                if dm.rank() == 0 {
                    warn!(
                        source = source_key.as_str(),
                        "no generator section found, using default loop behavior"
                    );
                }
                (
                    DATASET_LOOP_GENERATOR.to_string(),
                    source_key.clone(),
                    serde_yaml::Value::Null,
                )
            }
        };
        let generator = registry.build_generator(&GeneratorBuild {
            name: source_key,
            classname: &classname,
            dset_name: &dset_name,
            input_filename: opts.input_filename.as_deref(),
            start_position: opts.start_position,
            end_position: opts.end_position,
            params: &params,
        })?;

        let mut stages = Vec::new();
        let mut cumulative: Vec<Vec<Requirement>> = Vec::new();
        let mut acc: Vec<Requirement> = Vec::new();
        for key in &config.flow.stages {
            let section = config.sections.get(key).ok_or_else(|| {
                ConfigInvalidSnafu {
                    reason: format!("no section for stage {}", key),
                }
                .build()
            })?;
            let stage = registry.build_stage(&StageBuild {
                name: key,
                classname: &section.classname,
                params: &section.params,
            })?;
            for requirement in section.requirements() {
                if !acc.iter().any(|r| r.name == requirement.name) {
                    acc.push(requirement);
                }
            }
            cumulative.push(acc.clone());
            stages.push(StageSlot {
                name: key.clone(),
                stage,
            });
        }

        let mut resources = ResourceSet::default();
        for rc in &config.resources {
            let resource = registry.build_resource(&ResourceBuild {
                classname: &rc.classname,
                path: rc.path.as_deref(),
                params: &rc.params,
            })?;
            resources.insert(rc.classname.clone(), resource);
        }

        Ok(Self {
            dm,
            resources,
            generator,
            stages,
            cumulative,
        })
    }

    /// The source dataset name of this run.
    pub fn source(&self) -> &str {
        self.generator.dset_name()
    }

    /// Init phase: stage input data, initialize resources, the generator
    /// and every stage in order, then a world barrier.
    pub fn init(&mut self) -> Result<()> {
        let source = self.generator.dset_name().to_string();
        self.generator
            .stage_input(&StageContext {
                data_manager: &self.dm,
                resources: &self.resources,
            })
            .map_err(fatal(&source, "stage_input"))?;
        self.resources
            .init_all(&self.dm, &source)
            .map_err(fatal("resources", "init"))?;
        self.generator
            .init(&StageContext {
                data_manager: &self.dm,
                resources: &self.resources,
            })
            .map_err(fatal(&source, "init"))?;
        for slot in &mut self.stages {
            debug!(stage = slot.name.as_str(), source = source.as_str(), "init stage");
            slot.stage
                .init(
                    &StageContext {
                        data_manager: &self.dm,
                        resources: &self.resources,
                    },
                    &source,
                )
                .map_err(fatal(&slot.name, "init"))?;
        }
        self.dm.comm().barrier()?;
        Ok(())
    }

    /// Run phase: per chunk, build a fresh cache and drive every stage over
    /// it. The loop terminates only when every worker reports the EMPTY
    /// slice in the same step, so workers that ran out early keep entering
    /// the collectives with an empty chunk.
    pub fn run(&mut self) -> Result<()> {
        let source = self.generator.dset_name().to_string();
        let mut iterations = 0u64;
        loop {
            let local = self
                .generator
                .next(&StageContext {
                    data_manager: &self.dm,
                    resources: &self.resources,
                })
                .map_err(fatal(&source, "next"))?;
            let slice = local.unwrap_or(RowSlice::EMPTY);

            let gathered = self.dm.comm().all_gather(&[slice.start, slice.stop])?;
            if gathered.iter().all(|words| words[1] <= words[0]) {
                break;
            }
            iterations += 1;
            debug!(%slice, iterations, "processing chunk");

            let mut cache = Cache::new();
            for k in 0..self.stages.len() {
                let live: HashSet<&str> = self.cumulative[k]
                    .iter()
                    .map(|r| r.name.as_str())
                    .collect();
                cache.trim(&live, &source);

                if !cache.contains(&source) {
                    let rows = self.dm.read_data(&source, slice)?;
                    cache.insert(source.clone(), CacheValue::SourceRows(rows));
                }
                for requirement in &self.cumulative[k] {
                    if !cache.contains(&requirement.name) {
                        let value = load_requirement(&self.dm, &source, slice, requirement)?;
                        cache.insert(requirement.name.clone(), value);
                    }
                }

                let slot = &mut self.stages[k];
                debug!(
                    stage = slot.name.as_str(),
                    %slice,
                    cached = cache.len(),
                    "run stage"
                );
                slot.stage
                    .run(
                        &StageContext {
                            data_manager: &self.dm,
                            resources: &self.resources,
                        },
                        &source,
                        slice,
                        &mut cache,
                    )
                    .map_err(fatal(&slot.name, "run"))?;
            }
        }
        self.dm.comm().barrier()?;
        info!(iterations, "run loop complete");
        Ok(())
    }

    /// Finish phase: generator, stages and resources wind down, then the
    /// data manager drops configured outputs and closes the store.
    pub fn finish(&mut self) -> Result<()> {
        let source = self.generator.dset_name().to_string();
        self.generator
            .finish(&StageContext {
                data_manager: &self.dm,
                resources: &self.resources,
            })
            .map_err(fatal(&source, "finish"))?;
        self.dm.comm().barrier()?;
        for slot in &mut self.stages {
            slot.stage
                .finish(
                    &StageContext {
                        data_manager: &self.dm,
                        resources: &self.resources,
                    },
                    &source,
                )
                .map_err(fatal(&slot.name, "finish"))?;
        }
        self.dm.comm().barrier()?;
        self.resources
            .finish_all(&self.dm, &source)
            .map_err(fatal("resources", "finish"))?;
        self.dm.finish()?;
        Ok(())
    }

    /// Run all three phases; on any failure the store is closed
    /// best-effort before the error propagates.
    pub fn execute(&mut self) -> Result<()> {
        let result = self
            .init()
            .and_then(|_| self.run())
            .and_then(|_| self.finish());
        if result.is_err() {
            let _ = self.dm.store().close();
        }
        result
    }
}

/// Resolve one requirement against the current source slice. Missing
/// datasets or references are soft failures recorded as
/// [`CacheValue::Unresolved`]; anything else propagates.
fn load_requirement(
    dm: &DataManager,
    source: &str,
    slice: RowSlice,
    requirement: &Requirement,
) -> Result<CacheValue> {
    let attempt = (|| -> flow_data::Result<CacheValue> {
        if requirement.path.len() == 1 {
            let rows = dm.read_data(&requirement.path[0], slice)?;
            return Ok(CacheValue::SourceRows(rows));
        }
        let names: Vec<&str> = std::iter::once(source)
            .chain(requirement.path.iter().map(String::as_str))
            .collect();
        let sel: Vec<u64> = slice.range().collect();
        let opts = DerefOptions {
            indices_only: requirement.index_only,
        };
        Ok(match dm.dereference_chain(&names, &sel, None, opts)? {
            Deref::Data(data) => CacheValue::Data(data),
            Deref::Indices(grid) => CacheValue::Indices(grid),
        })
    })();

    match attempt {
        Ok(value) => Ok(value),
        Err(
            e @ (flow_data::Error::DatasetMissing { .. }
            | flow_data::Error::ReferenceMissing { .. }),
        ) => {
            info!(requirement = requirement.name.as_str(), %e, "requirement unresolved");
            Ok(CacheValue::Unresolved)
        }
        Err(e) => Err(e.into()),
    }
}

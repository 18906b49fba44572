//! The stage contract consumed by workflow plug-ins.

use crate::cache::Cache;
use crate::resource::ResourceSet;
use flow_data::DataManager;
use flow_types::RowSlice;

/// Errors surfaced from plug-in hooks; any of them is fatal to the run.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a plug-in hook.
pub type StageResult<T = ()> = std::result::Result<T, BoxedError>;

/// What a stage (or generator) sees of the running workflow: the worker's
/// data manager and the run's resource bag. Resources are reached through
/// this context rather than process-global state.
#[derive(Debug)]
pub struct StageContext<'a> {
    /// This worker's data manager.
    pub data_manager: &'a DataManager,
    /// The run's named singleton resources.
    pub resources: &'a ResourceSet,
}

impl StageContext<'_> {
    /// This worker's rank.
    pub fn rank(&self) -> usize {
        self.data_manager.rank()
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.data_manager.size()
    }
}

/// Everything a stage factory gets to construct an instance.
#[derive(Debug)]
pub struct StageBuild<'a> {
    /// Instance name (the configuration key).
    pub name: &'a str,
    /// Registered class name.
    pub classname: &'a str,
    /// The untyped parameter bag from the configuration; factories
    /// deserialize it into their own typed config.
    pub params: &'a serde_yaml::Value,
}

/// A workflow stage.
///
/// Stages are constructed per worker from the registry and then driven
/// through three hooks: `init` once before the loop (create datasets and
/// references, write metadata), `run` once per source slice, and `finish`
/// once after the loop. Hooks returning an error abort the whole run.
pub trait Stage: Send {
    /// Version string recorded by convention in output attributes.
    fn class_version(&self) -> &'static str {
        "0.0.0"
    }

    /// Called once before the run loop.
    fn init(&mut self, _ctx: &StageContext<'_>, _source: &str) -> StageResult {
        Ok(())
    }

    /// Called once per source slice. `cache` holds the source rows plus
    /// every declared requirement; requirements that could not be resolved
    /// are present as [`crate::CacheValue::Unresolved`] and must be
    /// tolerated.
    fn run(
        &mut self,
        ctx: &StageContext<'_>,
        source: &str,
        slice: RowSlice,
        cache: &mut Cache,
    ) -> StageResult;

    /// Called once after the run loop.
    fn finish(&mut self, _ctx: &StageContext<'_>, _source: &str) -> StageResult {
        Ok(())
    }
}

//! Named singleton resources shared by every stage of a run.

use crate::stage::StageResult;
use flow_data::DataManager;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

/// A static resource with optional setup/teardown hooks. Stages reach a
/// resource through [`ResourceSet::get`] and downcast to its concrete type.
pub trait Resource: Send {
    /// Called once before the generator is initialized.
    fn init(&mut self, _dm: &DataManager, _source: &str) -> StageResult {
        Ok(())
    }

    /// Called once after stages have finished.
    fn finish(&mut self, _dm: &DataManager, _source: &str) -> StageResult {
        Ok(())
    }

    /// Downcasting hook for typed access.
    fn as_any(&self) -> &dyn Any;
}

/// Everything a resource factory gets to construct an instance.
#[derive(Debug)]
pub struct ResourceBuild<'a> {
    /// Registered class name.
    pub classname: &'a str,
    /// Optional output path the resource writes under.
    pub path: Option<&'a str>,
    /// Untyped parameter bag.
    pub params: &'a serde_yaml::Value,
}

/// The run's resources, keyed by class name.
#[derive(Default)]
pub struct ResourceSet {
    by_name: BTreeMap<String, Box<dyn Resource>>,
}

impl fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSet")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceSet {
    /// Insert a constructed resource under its class name.
    pub fn insert(&mut self, classname: impl Into<String>, resource: Box<dyn Resource>) {
        self.by_name.insert(classname.into(), resource);
    }

    /// Typed access to a resource by class name.
    pub fn get<T: 'static>(&self, classname: &str) -> Option<&T> {
        self.by_name
            .get(classname)
            .and_then(|r| r.as_any().downcast_ref())
    }

    /// True when no resources are configured.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Run every resource's `init` hook.
    pub fn init_all(&mut self, dm: &DataManager, source: &str) -> StageResult {
        for resource in self.by_name.values_mut() {
            resource.init(dm, source)?;
        }
        Ok(())
    }

    /// Run every resource's `finish` hook.
    pub fn finish_all(&mut self, dm: &DataManager, source: &str) -> StageResult {
        for resource in self.by_name.values_mut() {
            resource.finish(dm, source)?;
        }
        Ok(())
    }
}

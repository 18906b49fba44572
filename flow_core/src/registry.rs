//! The build-time class registry.
//!
//! Stage, generator and resource implementations register factory
//! functions under string keys; configurations refer to the same keys.
//! This replaces runtime module scanning with explicit registration.

use crate::generator::{Generator, GeneratorBuild, LoopGenerator, DATASET_LOOP_GENERATOR};
use crate::resource::{Resource, ResourceBuild};
use crate::stage::{Stage, StageBuild, StageResult};
use crate::{ConfigInvalidSnafu, Result};
use hashbrown::HashMap;
use std::fmt;

type StageFactory = Box<dyn Fn(&StageBuild<'_>) -> StageResult<Box<dyn Stage>> + Send + Sync>;
type GeneratorFactory =
    Box<dyn Fn(&GeneratorBuild<'_>) -> StageResult<Box<dyn Generator>> + Send + Sync>;
type ResourceFactory =
    Box<dyn Fn(&ResourceBuild<'_>) -> StageResult<Box<dyn Resource>> + Send + Sync>;

/// Class-name → factory map for stages, generators and resources.
pub struct Registry {
    stages: HashMap<String, StageFactory>,
    generators: HashMap<String, GeneratorFactory>,
    resources: HashMap<String, ResourceFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("generators", &self.generators.keys().collect::<Vec<_>>())
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Registry {
    /// A registry holding the built-in classes.
    fn default() -> Self {
        let mut registry = Self {
            stages: HashMap::new(),
            generators: HashMap::new(),
            resources: HashMap::new(),
        };
        registry.register_generator(DATASET_LOOP_GENERATOR, |build| {
            Ok(Box::new(LoopGenerator::from_build(build)?))
        });
        registry
    }
}

impl Registry {
    /// A registry holding the built-in classes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage class.
    pub fn register_stage<F>(&mut self, classname: impl Into<String>, factory: F)
    where
        F: Fn(&StageBuild<'_>) -> StageResult<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.stages.insert(classname.into(), Box::new(factory));
    }

    /// Register a generator class.
    pub fn register_generator<F>(&mut self, classname: impl Into<String>, factory: F)
    where
        F: Fn(&GeneratorBuild<'_>) -> StageResult<Box<dyn Generator>> + Send + Sync + 'static,
    {
        self.generators.insert(classname.into(), Box::new(factory));
    }

    /// Register a resource class.
    pub fn register_resource<F>(&mut self, classname: impl Into<String>, factory: F)
    where
        F: Fn(&ResourceBuild<'_>) -> StageResult<Box<dyn Resource>> + Send + Sync + 'static,
    {
        self.resources.insert(classname.into(), Box::new(factory));
    }

    /// Construct the stage `build` describes.
    pub fn build_stage(&self, build: &StageBuild<'_>) -> Result<Box<dyn Stage>> {
        let factory = self.stages.get(build.classname).ok_or_else(|| {
            ConfigInvalidSnafu {
                reason: format!("unknown stage class {}", build.classname),
            }
            .build()
        })?;
        factory(build).map_err(|e| {
            ConfigInvalidSnafu {
                reason: format!("cannot construct stage {} ({}): {}", build.name, build.classname, e),
            }
            .build()
        })
    }

    /// Construct the generator `build` describes.
    pub fn build_generator(&self, build: &GeneratorBuild<'_>) -> Result<Box<dyn Generator>> {
        let factory = self.generators.get(build.classname).ok_or_else(|| {
            ConfigInvalidSnafu {
                reason: format!("unknown generator class {}", build.classname),
            }
            .build()
        })?;
        factory(build).map_err(|e| {
            ConfigInvalidSnafu {
                reason: format!(
                    "cannot construct generator {} ({}): {}",
                    build.name, build.classname, e
                ),
            }
            .build()
        })
    }

    /// Construct the resource `build` describes.
    pub fn build_resource(&self, build: &ResourceBuild<'_>) -> Result<Box<dyn Resource>> {
        let factory = self.resources.get(build.classname).ok_or_else(|| {
            ConfigInvalidSnafu {
                reason: format!("unknown resource class {}", build.classname),
            }
            .build()
        })?;
        factory(build).map_err(|e| {
            ConfigInvalidSnafu {
                reason: format!("cannot construct resource {}: {}", build.classname, e),
            }
            .build()
        })
    }
}

//! The workflow configuration model.
//!
//! A workflow file is YAML with a `flow` section naming the source and the
//! ordered stage keys, an optional `resources` list, and one section per
//! stage or generator key holding its class name, requirements and
//! parameter bag.

use crate::{ConfigParseSnafu, ConfigReadSnafu, Result};
use serde::Deserialize;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::path::Path;

/// A parsed workflow file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    /// The `flow` section: source, stage order, drop-list.
    pub flow: FlowSection,
    /// Named singleton resources, constructed before the generator.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Per-key stage/generator sections.
    #[serde(flatten)]
    pub sections: BTreeMap<String, SectionConfig>,
}

/// The `flow` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowSection {
    /// Source dataset name, or the key of a generator section.
    pub source: String,
    /// Stage keys, in execution order.
    pub stages: Vec<String>,
    /// Paths whose outputs must not survive in the primary container.
    #[serde(default)]
    pub drop: Vec<String>,
}

/// One stage or generator section.
#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
    /// Registered class name.
    pub classname: String,
    /// Plug-in locator hint. Accepted for compatibility; the registry
    /// resolves classes by name alone.
    #[serde(default)]
    pub path: Option<String>,
    /// Source dataset produced or consumed by a generator section.
    #[serde(default)]
    pub dset_name: Option<String>,
    /// Declared requirements, normalized via [`SectionConfig::requirements`].
    #[serde(default)]
    pub requires: Vec<RequireConfig>,
    /// Untyped parameter bag handed to the class factory.
    #[serde(default)]
    pub params: serde_yaml::Value,
}

/// A resource declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    /// Registered class name.
    pub classname: String,
    /// Optional output path the resource writes its metadata under.
    #[serde(default)]
    pub path: Option<String>,
    /// Untyped parameter bag.
    #[serde(default)]
    pub params: serde_yaml::Value,
}

/// A requirement as written in the file: either a bare name or the full
/// form with an explicit dereference path.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RequireConfig {
    /// `- hits`: load dataset `hits` aligned with the source slice.
    Name(String),
    /// The explicit form.
    Full {
        /// Cache key.
        name: String,
        /// Datasets to traverse, starting from the source.
        #[serde(default)]
        path: Option<PathSpec>,
        /// Load indices instead of data.
        #[serde(default, alias = "indices_only")]
        index_only: bool,
    },
}

/// One dataset or a list of datasets.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    /// A single dataset.
    One(String),
    /// A dereference chain.
    Many(Vec<String>),
}

/// A normalized requirement: cache key, dereference path, index flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Cache key.
    pub name: String,
    /// Datasets to traverse from the source; a single element means "load
    /// that dataset sliced by the source slice".
    pub path: Vec<String>,
    /// Load indices instead of data.
    pub index_only: bool,
}

impl SectionConfig {
    /// The section's requirements in normalized form.
    pub fn requirements(&self) -> Vec<Requirement> {
        self.requires
            .iter()
            .map(|r| match r {
                RequireConfig::Name(name) => Requirement {
                    name: name.clone(),
                    path: vec![name.clone()],
                    index_only: false,
                },
                RequireConfig::Full {
                    name,
                    path,
                    index_only,
                } => Requirement {
                    name: name.clone(),
                    path: match path {
                        None => vec![name.clone()],
                        Some(PathSpec::One(p)) => vec![p.clone()],
                        Some(PathSpec::Many(ps)) => ps.clone(),
                    },
                    index_only: *index_only,
                },
            })
            .collect()
    }
}

impl WorkflowConfig {
    /// Parse a workflow from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context(ConfigParseSnafu)
    }

    /// Read and parse a workflow file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ConfigReadSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
flow:
  source: events
  stages: [stage0, stage1]
  drop: ['stage0/scratch']

resources:
  - classname: RunInfo
    path: meta
    params:
      run: 12

events:
  classname: DatasetLoopGenerator
  dset_name: raw/events
  params:
    chunk_size: 64

stage0:
  classname: Doubler
  requires: ['raw/hits']
  params:
    output: stage0/out

stage1:
  classname: Collector
  requires:
    - name: tracks
      path: ['stage0/out', 'tracks']
      index_only: true
"#;

    #[test]
    fn parses_full_example() {
        let config = WorkflowConfig::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.flow.source, "events");
        assert_eq!(config.flow.stages, vec!["stage0", "stage1"]);
        assert_eq!(config.flow.drop, vec!["stage0/scratch"]);
        assert_eq!(config.resources.len(), 1);
        assert_eq!(config.resources[0].classname, "RunInfo");

        let events = &config.sections["events"];
        assert_eq!(events.classname, "DatasetLoopGenerator");
        assert_eq!(events.dset_name.as_deref(), Some("raw/events"));

        let stage0 = &config.sections["stage0"];
        assert_eq!(
            stage0.requirements(),
            vec![Requirement {
                name: "raw/hits".to_string(),
                path: vec!["raw/hits".to_string()],
                index_only: false,
            }]
        );

        let stage1 = &config.sections["stage1"];
        assert_eq!(
            stage1.requirements(),
            vec![Requirement {
                name: "tracks".to_string(),
                path: vec!["stage0/out".to_string(), "tracks".to_string()],
                index_only: true,
            }]
        );
    }

    #[test]
    fn minimal_flow_only() {
        let config = WorkflowConfig::from_yaml("flow:\n  source: d\n  stages: []\n").unwrap();
        assert!(config.flow.drop.is_empty());
        assert!(config.resources.is_empty());
        assert!(config.sections.is_empty());
    }

    #[test]
    fn rejects_malformed() {
        assert!(WorkflowConfig::from_yaml("flow: 3").is_err());
        assert!(WorkflowConfig::from_yaml("stages: []").is_err());
    }
}

//! The container's table of contents: the group/dataset tree and attribute
//! bags, serialized as JSON at the end of the file on every flush.

use flow_types::ElementType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single attribute value. The tag survives serialization so that signed,
/// unsigned and float scalars round-trip without guessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum AttrValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer scalar.
    Int(i64),
    /// Unsigned integer scalar.
    Uint(u64),
    /// Float scalar.
    Float(f64),
    /// String value.
    Str(String),
    /// Small list of signed integers.
    IntList(Vec<i64>),
    /// Small list of floats.
    FloatList(Vec<f64>),
    /// Small list of strings.
    StrList(Vec<String>),
}

impl AttrValue {
    /// The string payload, if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a signed integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// One contiguous run of rows in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Absolute file offset of the first byte.
    pub offset: u64,
    /// First row covered by this extent.
    pub start_row: u64,
    /// Rows covered.
    pub rows: u64,
}

/// Dataset bookkeeping held in the TOC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    /// Element descriptor; immutable after creation.
    pub element: ElementType,
    /// Current row count (first axis).
    pub rows: u64,
    /// Layout hint consumed by auto-chunking iterators.
    pub chunk_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DatasetNode {
    pub(crate) meta: DatasetMeta,
    pub(crate) extents: Vec<Extent>,
    #[serde(default)]
    pub(crate) attrs: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct GroupNode {
    #[serde(default)]
    pub(crate) attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub(crate) children: BTreeMap<String, Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Node {
    Group(GroupNode),
    Dataset(DatasetNode),
}

impl Node {
    pub(crate) fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        match self {
            Self::Group(g) => &g.attrs,
            Self::Dataset(d) => &d.attrs,
        }
    }

    pub(crate) fn attrs_mut(&mut self) -> &mut BTreeMap<String, AttrValue> {
        match self {
            Self::Group(g) => &mut g.attrs,
            Self::Dataset(d) => &mut d.attrs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Toc {
    pub(crate) root: GroupNode,
}

/// Split a container path into its non-empty components.
pub(crate) fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

impl Toc {
    pub(crate) fn node(&self, path: &str) -> Option<&Node> {
        let mut parts = components(path).into_iter();
        let first = parts.next()?;
        let mut node = self.root.children.get(first)?;
        for part in parts {
            match node {
                Node::Group(g) => node = g.children.get(part)?,
                Node::Dataset(_) => return None,
            }
        }
        Some(node)
    }

    pub(crate) fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut parts = components(path).into_iter();
        let first = parts.next()?;
        let mut node = self.root.children.get_mut(first)?;
        for part in parts {
            match node {
                Node::Group(g) => node = g.children.get_mut(part)?,
                Node::Dataset(_) => return None,
            }
        }
        Some(node)
    }

    /// The group holding the last component of `path`, creating intermediate
    /// groups on the way. Returns `None` when an intermediate component is a
    /// dataset.
    pub(crate) fn parent_group_mut(&mut self, path: &str) -> Option<(&mut GroupNode, String)> {
        let parts = components(path);
        let (last, dirs) = parts.split_last()?;
        let mut group = &mut self.root;
        for part in dirs {
            let child = group
                .children
                .entry(part.to_string())
                .or_insert_with(|| Node::Group(GroupNode::default()));
            match child {
                Node::Group(g) => group = g,
                Node::Dataset(_) => return None,
            }
        }
        Some((group, last.to_string()))
    }
}

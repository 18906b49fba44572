//! The per-iteration requirement cache.
//!
//! One cache is created per source slice, filled lazily as stages come up,
//! trimmed down to the requirements still live, and discarded with the
//! iteration.

use flow_data::{IndexGrid, MaskedData};
use flow_types::Array;
use hashbrown::{HashMap, HashSet};

/// A resolved cache entry.
#[derive(Debug, Clone)]
pub enum CacheValue {
    /// Raw rows of a dataset aligned with the source slice.
    SourceRows(Array),
    /// Dereferenced child rows plus mask.
    Data(MaskedData),
    /// Dereferenced child indices plus mask.
    Indices(IndexGrid),
    /// The requirement could not be resolved (missing dataset or missing
    /// reference); stages must tolerate this.
    Unresolved,
}

impl CacheValue {
    /// The raw rows, when this entry holds them.
    pub fn as_rows(&self) -> Option<&Array> {
        match self {
            Self::SourceRows(a) => Some(a),
            _ => None,
        }
    }

    /// The masked data, when this entry holds it.
    pub fn as_data(&self) -> Option<&MaskedData> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    /// The index grid, when this entry holds one.
    pub fn as_indices(&self) -> Option<&IndexGrid> {
        match self {
            Self::Indices(g) => Some(g),
            _ => None,
        }
    }

    /// True for the unresolved sentinel.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }
}

/// Requirement name → resolved value for the current iteration.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<String, CacheValue>,
}

impl Cache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry.
    pub fn get(&self, name: &str) -> Option<&CacheValue> {
        self.entries.get(name)
    }

    /// True when `name` is present (possibly as `Unresolved`).
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, name: impl Into<String>, value: CacheValue) {
        self.entries.insert(name.into(), value);
    }

    /// Evict everything not in `live`, except the source row entry, which
    /// survives the whole iteration.
    pub fn trim(&mut self, live: &HashSet<&str>, source: &str) {
        self.entries
            .retain(|name, _| name == source || live.contains(name.as_str()));
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

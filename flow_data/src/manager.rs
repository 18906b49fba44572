//! The data manager: the single write path into the shared store.
//!
//! Every worker holds its own manager over the run's shared [`Store`] and
//! its own [`Comm`] handle. Append coordination (`reserve_data`,
//! `write_ref`) is collective: workers gather their contributions, then
//! every worker drives the store toward the same agreed target, which makes
//! the underlying resizes idempotent and order-free. Reads of current
//! lengths happen strictly before the gather so that a fast peer cannot
//! perturb them.

use crate::algebra::{self, IndexGrid, MaskedData};
use crate::store::Store;
use crate::{
    data_path, ref_path, region_path, DatasetMissingSnafu, ReferenceConflictSnafu,
    ReferenceMissingSnafu, Result, ScratchCleanupSnafu, SpecInvalidSnafu,
};
use container_file::{AttrValue, DEFAULT_CHUNK_ROWS};
use flow_comm::Comm;
use flow_types::{Array, ElementType, RegionEntry, ReserveSpec, RowSlice, ScalarType};
use hashbrown::{HashMap, HashSet};
use itertools::{Itertools, MinMaxResult};
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Attribute linking a reference table to its canonical parent dataset.
pub const ATTR_DSET0: &str = "dset0";
/// Attribute linking a reference table to its canonical child dataset.
pub const ATTR_DSET1: &str = "dset1";
/// Attribute pointing a reference table at the parent-side region table.
pub const ATTR_REF_REGION0: &str = "ref_region0";
/// Attribute pointing a reference table at the child-side region table.
pub const ATTR_REF_REGION1: &str = "ref_region1";
/// Attribute pointing a region table back at its canonical reference table.
pub const ATTR_REF: &str = "ref";

/// A resolved reference table: its canonical path, the direction that maps
/// the caller's `(parent, child)` order onto the stored columns, and the
/// table length at resolution time.
#[derive(Debug, Clone)]
pub struct RefHandle {
    /// Canonical table path, `A/ref/B/ref`.
    pub path: String,
    /// `(s, t)`: caller's parent indices live in column `s`, child indices
    /// in column `t`. `(0, 1)` for canonical order, `(1, 0)` for the
    /// logical reverse view.
    pub direction: (usize, usize),
    /// Table length when the handle was resolved.
    pub rows: u64,
}

/// A reference table anchored on a dataset, with both endpoints resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefInfo {
    /// Canonical table path.
    pub ref_table: String,
    /// Canonical parent dataset name.
    pub dset0: String,
    /// Canonical child dataset name.
    pub dset1: String,
    /// Parent-side region-table path.
    pub region0: String,
    /// Child-side region-table path.
    pub region1: String,
}

/// Result of a dereference: fetched child rows or bare indices.
#[derive(Debug, Clone)]
pub enum Deref {
    /// Fetched child rows plus mask.
    Data(MaskedData),
    /// Bare child indices plus mask.
    Indices(IndexGrid),
}

impl Deref {
    /// The fetched rows, if this is a data result.
    pub fn into_data(self) -> Option<MaskedData> {
        match self {
            Self::Data(d) => Some(d),
            Self::Indices(_) => None,
        }
    }

    /// The bare indices, if this is an index result.
    pub fn into_indices(self) -> Option<IndexGrid> {
        match self {
            Self::Indices(g) => Some(g),
            Self::Data(_) => None,
        }
    }
}

/// Ragged dereference result, one list per selected parent.
#[derive(Debug, Clone)]
pub enum Ragged {
    /// Child indices per parent, ascending.
    Indices(Vec<Vec<u64>>),
    /// Child rows per parent, in ascending child-index order.
    Data(Vec<Array>),
}

/// Options for [`DataManager::dereference`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DerefOptions {
    /// Return indices into the child dataset instead of fetched rows.
    pub indices_only: bool,
}

/// Coordinates all access to the run's output store for one worker.
#[derive(Debug, Clone)]
pub struct DataManager {
    store: Arc<Store>,
    comm: Arc<dyn Comm>,
    /// Most recent slice granted per dataset; writes must stay inside it.
    reservations: Arc<Mutex<HashMap<String, RowSlice>>>,
}

impl DataManager {
    /// A manager for the worker holding `comm`, over the run's shared store.
    pub fn new(store: Arc<Store>, comm: Arc<dyn Comm>) -> Self {
        Self {
            store,
            comm,
            reservations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// This worker's communicator.
    pub fn comm(&self) -> &Arc<dyn Comm> {
        &self.comm
    }

    /// This worker's rank.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.comm.size()
    }

    fn ensure_writable(&self) -> Result<()> {
        ensure!(
            self.store.writable(self.comm.rank()),
            crate::ReadOnlyWorkerSnafu {
                rank: self.comm.rank()
            }
        );
        Ok(())
    }

    // ---- existence checks ------------------------------------------------

    /// True when any object exists at `path`.
    pub fn exists(&self, path: &str) -> Result<bool> {
        self.store.exists(path)
    }

    /// True when the dataset `name` exists.
    pub fn dset_exists(&self, name: &str) -> Result<bool> {
        self.exists(&data_path(name))
    }

    /// True when a reference table links `parent` and `child` in either
    /// order.
    pub fn ref_exists(&self, parent: &str, child: &str) -> Result<bool> {
        Ok(self.exists(&ref_path(parent, child))? || self.exists(&ref_path(child, parent))?)
    }

    /// True when the `parent`-side region table of `parent <-> child`
    /// exists.
    pub fn ref_region_exists(&self, parent: &str, child: &str) -> Result<bool> {
        self.exists(&region_path(parent, child))
    }

    /// True when object `name` carries attribute `key`.
    pub fn attr_exists(&self, name: &str, key: &str) -> Result<bool> {
        if !self.exists(name)? {
            return Ok(false);
        }
        Ok(self.get_attr(name, key)?.is_some())
    }

    // ---- datasets --------------------------------------------------------

    /// Create the 1-D dataset `name` with the given element type, if it does
    /// not already exist.
    pub fn create_dset(&self, name: &str, element: ElementType) -> Result<()> {
        self.ensure_writable()?;
        let path = data_path(name);
        self.store
            .with_routed(&path, |c| c.create_dataset(&path, element, DEFAULT_CHUNK_ROWS))
    }

    /// Current length of dataset `name`.
    pub fn dset_len(&self, name: &str) -> Result<u64> {
        let path = data_path(name);
        ensure!(self.exists(&path)?, DatasetMissingSnafu { name });
        self.store.with_routed(&path, |c| c.dataset_rows(&path))
    }

    /// Element type of dataset `name`.
    pub fn dset_element(&self, name: &str) -> Result<ElementType> {
        let path = data_path(name);
        ensure!(self.exists(&path)?, DatasetMissingSnafu { name });
        self.store
            .with_routed(&path, |c| Ok(c.dataset_meta(&path)?.element))
    }

    /// Chunk-layout hint of dataset `name`, for auto-chunking iterators.
    pub fn dset_chunk_rows(&self, name: &str) -> Result<u64> {
        let path = data_path(name);
        ensure!(self.exists(&path)?, DatasetMissingSnafu { name });
        self.store
            .with_routed(&path, |c| Ok(c.dataset_meta(&path)?.chunk_rows))
    }

    /// Read rows `window` of dataset `name`.
    pub fn read_data(&self, name: &str, window: RowSlice) -> Result<Array> {
        let path = data_path(name);
        ensure!(self.exists(&path)?, DatasetMissingSnafu { name });
        self.store
            .with_routed(&path, |c| c.read_rows(&path, window.start, window.stop))
    }

    // ---- attributes ------------------------------------------------------

    /// The attribute bag of object `name`.
    pub fn get_attrs(&self, name: &str) -> Result<BTreeMap<String, AttrValue>> {
        self.store.with_routed(name, |c| c.get_attrs(name))
    }

    /// One attribute of object `name`.
    pub fn get_attr(&self, name: &str, key: &str) -> Result<Option<AttrValue>> {
        self.store.with_routed(name, |c| c.get_attr(name, key))
    }

    /// Set attributes on `name`, creating the group when needed. Existing
    /// keys are overwritten.
    pub fn set_attrs<I>(&self, name: &str, attrs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, AttrValue)>,
    {
        self.ensure_writable()?;
        self.store.with_routed(name, |c| {
            if !c.exists(name) {
                c.create_group(name)?;
            }
            for (key, value) in attrs {
                c.set_attr(name, &key, value)?;
            }
            Ok(())
        })
    }

    // ---- references ------------------------------------------------------

    /// Create the bi-directional reference tables for `parent -> child`:
    /// the canonical `(k, 2)` table under `parent` plus one region table per
    /// endpoint, sized to the current dataset lengths and zero-filled.
    ///
    /// Re-creating the same direction is a no-op; the opposite direction is
    /// rejected, the existing canonical table must be used through its
    /// reverse view instead.
    pub fn create_ref(&self, parent: &str, child: &str) -> Result<()> {
        self.ensure_writable()?;
        ensure!(self.dset_exists(parent)?, DatasetMissingSnafu { name: parent });
        ensure!(self.dset_exists(child)?, DatasetMissingSnafu { name: child });
        ensure!(
            !self.exists(&ref_path(child, parent))?,
            ReferenceConflictSnafu { parent, child }
        );
        let table = ref_path(parent, child);
        if self.exists(&table)? {
            return Ok(());
        }

        let len_parent = self.dset_len(parent)?;
        let len_child = self.dset_len(child)?;
        let region_parent = region_path(parent, child);
        let region_child = region_path(child, parent);

        self.store.with_routed(&table, |c| {
            c.create_dataset(
                &table,
                ElementType::with_shape(ScalarType::U64, [2]),
                DEFAULT_CHUNK_ROWS,
            )?;
            c.set_attr(&table, ATTR_DSET0, data_path(parent).into())?;
            c.set_attr(&table, ATTR_DSET1, data_path(child).into())?;
            c.set_attr(&table, ATTR_REF_REGION0, region_parent.as_str().into())?;
            c.set_attr(&table, ATTR_REF_REGION1, region_child.as_str().into())
        })?;
        for (region, len) in [(&region_parent, len_parent), (&region_child, len_child)] {
            self.store.with_routed(region, |c| {
                c.create_dataset(region, RegionEntry::element_type(), DEFAULT_CHUNK_ROWS)?;
                c.resize_dataset(region, len)?;
                c.set_attr(region, ATTR_REF, table.as_str().into())
            })?;
        }
        debug!(parent, child, "created reference tables");
        Ok(())
    }

    /// Resolve the reference table between `parent` and `child`, in either
    /// stored order.
    pub fn get_ref(&self, parent: &str, child: &str) -> Result<RefHandle> {
        for (path, direction) in [
            (ref_path(parent, child), (0, 1)),
            (ref_path(child, parent), (1, 0)),
        ] {
            if self.exists(&path)? {
                let rows = self.store.with_routed(&path, |c| c.dataset_rows(&path))?;
                return Ok(RefHandle {
                    path,
                    direction,
                    rows,
                });
            }
        }
        ReferenceMissingSnafu { parent, child }.fail()
    }

    /// Every reference table anchored on `name`, resolved through the
    /// region tables stored under its group.
    pub fn get_refs(&self, name: &str) -> Result<Vec<RefInfo>> {
        self.anchored_refs(name, true)
    }

    fn anchored_refs(&self, name: &str, include_scratch: bool) -> Result<Vec<RefInfo>> {
        let mut region_paths: Vec<String> = self
            .store
            .with_primary(|c| Ok(c.datasets_under(name)))?
            .into_iter()
            .filter(|p| p.ends_with("/ref_region"))
            .collect();
        if include_scratch && self.store.scratch_on_disk() {
            region_paths.extend(
                self.store
                    .with_scratch(|c| Ok(c.datasets_under(name)))?
                    .into_iter()
                    .filter(|p| p.ends_with("/ref_region")),
            );
        }

        let mut seen = HashSet::new();
        let mut infos = Vec::new();
        for region in region_paths {
            let table = match self.get_attr(&region, ATTR_REF)? {
                Some(AttrValue::Str(t)) => t,
                _ => continue,
            };
            if !seen.insert(table.clone()) || !self.exists(&table)? {
                continue;
            }
            let attr_string = |key: &str| -> Result<Option<String>> {
                Ok(self
                    .get_attr(&table, key)?
                    .and_then(|v| v.as_str().map(str::to_string)))
            };
            let (dset0, dset1, region0, region1) = match (
                attr_string(ATTR_DSET0)?,
                attr_string(ATTR_DSET1)?,
                attr_string(ATTR_REF_REGION0)?,
                attr_string(ATTR_REF_REGION1)?,
            ) {
                (Some(d0), Some(d1), Some(r0), Some(r1)) => (d0, d1, r0, r1),
                _ => continue,
            };
            infos.push(RefInfo {
                ref_table: table,
                dset0: dset0.trim_end_matches("/data").to_string(),
                dset1: dset1.trim_end_matches("/data").to_string(),
                region0,
                region1,
            });
        }
        Ok(infos)
    }

    /// Length of the `parent`-side region table.
    pub fn region_len(&self, parent: &str, child: &str) -> Result<u64> {
        let path = region_path(parent, child);
        ensure!(self.exists(&path)?, ReferenceMissingSnafu { parent, child });
        self.store.with_routed(&path, |c| c.dataset_rows(&path))
    }

    /// Read `window` of the `parent`-side region table.
    pub fn read_region(&self, parent: &str, child: &str, window: RowSlice) -> Result<Vec<RegionEntry>> {
        let path = region_path(parent, child);
        ensure!(self.exists(&path)?, ReferenceMissingSnafu { parent, child });
        let array = self
            .store
            .with_routed(&path, |c| c.read_rows(&path, window.start, window.stop))?;
        Ok(RegionEntry::decode_array(&array)?)
    }

    fn read_ref_rows(&self, handle: &RefHandle, window: RowSlice) -> Result<Vec<[u64; 2]>> {
        let path = &handle.path;
        let array = self
            .store
            .with_routed(path, |c| c.read_rows(path, window.start, window.stop))?;
        Ok(array.to_u64_pairs()?)
    }

    // ---- coordinated appends ---------------------------------------------

    /// Grow dataset `name` to `target` rows and keep every region table
    /// anchored on it sized to its endpoint datasets.
    fn resize_data_and_regions(&self, name: &str, target: u64) -> Result<()> {
        let path = data_path(name);
        self.store
            .with_routed(&path, |c| c.resize_dataset(&path, target))?;
        for info in self.anchored_refs(name, true)? {
            let len0 = self.dset_len(&info.dset0)?;
            let len1 = self.dset_len(&info.dset1)?;
            for (region, len) in [(&info.region0, len0), (&info.region1, len1)] {
                self.store.with_routed(region, |c| {
                    if c.dataset_rows(region)? < len {
                        c.resize_dataset(region, len)?;
                    }
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// Coordinate access into dataset `name` across all workers.
    ///
    /// With [`ReserveSpec::Count`], every worker contributes its count and
    /// receives a disjoint slice at the end of the dataset, laid out in
    /// rank order. With [`ReserveSpec::Window`], the dataset grows to cover
    /// the furthest requested stop and each worker gets its own window
    /// back. Collective: every worker must call with the same spec kind.
    pub fn reserve_data(&self, name: &str, spec: impl Into<ReserveSpec>) -> Result<RowSlice> {
        self.ensure_writable()?;
        let spec = spec.into();
        // Read the stable length before the gather; afterwards a fast peer
        // may already have grown the dataset.
        let curr = self.dset_len(name)?;
        let words = match spec {
            ReserveSpec::Count(k) => [0, k, 0],
            ReserveSpec::Window(w) => [1, w.start, w.stop],
        };
        let gathered = self.comm.all_gather(&words)?;
        let tag = words[0];
        ensure!(
            gathered.iter().all(|w| w[0] == tag),
            SpecInvalidSnafu {
                reason: "workers mixed append-count and window reservations".to_string(),
            }
        );

        let granted = match spec {
            ReserveSpec::Count(_) => {
                let counts: Vec<u64> = gathered.iter().map(|w| w[1]).collect();
                let before: u64 = counts[..self.comm.rank()].iter().sum();
                let total: u64 = counts.iter().sum();
                self.resize_data_and_regions(name, curr + total)?;
                RowSlice::new(curr + before, curr + before + counts[self.comm.rank()])
            }
            ReserveSpec::Window(w) => {
                let furthest = gathered.iter().map(|words| words[2]).max().unwrap_or(0);
                if furthest > curr {
                    self.resize_data_and_regions(name, furthest)?;
                }
                w
            }
        };
        self.reservations
            .lock()
            .insert(name.to_string(), granted);
        Ok(granted)
    }

    /// Write `data` into the previously reserved `window` of dataset
    /// `name`. Pointwise; the window must be contained in the slice granted
    /// to this worker by the most recent reservation.
    pub fn write_data(&self, name: &str, window: RowSlice, data: &Array) -> Result<()> {
        self.ensure_writable()?;
        ensure!(
            data.rows() as u64 == window.len(),
            crate::WriteLengthMismatchSnafu {
                name,
                requested: window,
                rows: data.rows(),
            }
        );
        let reserved = self.reservations.lock().get(name).copied();
        ensure!(
            reserved.map(|r| r.contains(&window)).unwrap_or(false),
            crate::WriteOutOfRangeSnafu {
                name,
                requested: window,
                reserved,
            }
        );
        let path = data_path(name);
        self.store
            .with_routed(&path, |c| c.write_rows(&path, window.start, data))
    }

    /// Append reference rows for `parent -> child`. `rows[i] = [p, c]` with
    /// `p` indexing `parent` and `c` indexing `child`. Collective; rows are
    /// laid out in rank order and both region tables are widened
    /// monotonically, so repeated calls in any worker order converge to the
    /// same tables.
    pub fn write_ref(&self, parent: &str, child: &str, rows: &[[u64; 2]]) -> Result<()> {
        self.ensure_writable()?;
        // Resolve (and stable-read the length of) the table before the
        // gather, see `reserve_data`.
        let handle = self.get_ref(parent, child)?;
        let parent_needed = rows.iter().map(|r| r[0] + 1).max().unwrap_or(0);
        let child_needed = rows.iter().map(|r| r[1] + 1).max().unwrap_or(0);
        let gathered = self
            .comm
            .all_gather(&[rows.len() as u64, parent_needed, child_needed])?;

        let counts: Vec<u64> = gathered.iter().map(|w| w[0]).collect();
        let total: u64 = counts.iter().sum();
        let before: u64 = counts[..self.comm.rank()].iter().sum();
        let offset = handle.rows + before;
        let parent_target = gathered.iter().map(|w| w[1]).max().unwrap_or(0);
        let child_target = gathered.iter().map(|w| w[2]).max().unwrap_or(0);

        // Everyone drives the table to the same agreed length.
        let table = &handle.path;
        let element = self
            .store
            .with_routed(table, |c| Ok(c.dataset_meta(table)?.element))?;
        self.store.with_routed(table, |c| {
            let target = handle.rows + total;
            if c.dataset_rows(table)? < target {
                c.resize_dataset(table, target)?;
            }
            Ok(())
        })?;

        if !rows.is_empty() {
            let canonical: Vec<[u64; 2]> = if handle.direction == (0, 1) {
                rows.to_vec()
            } else {
                rows.iter().map(|[p, c]| [*c, *p]).collect()
            };
            let buffer = encode_pairs(&element, &canonical)?;
            self.store
                .with_routed(table, |c| c.write_rows(table, offset, &buffer))?;
        }

        self.update_region(
            &region_path(parent, child),
            parent_target,
            rows.iter().map(|r| r[0]),
            offset,
        )?;
        self.update_region(
            &region_path(child, parent),
            child_target,
            rows.iter().map(|r| r[1]),
            offset,
        )?;
        Ok(())
    }

    /// Widen one side's region table for a batch of reference rows starting
    /// at absolute table offset `batch_offset`. The read-merge-write runs
    /// under the container lock, and widening is commutative-monotone, so
    /// overlapping updates from peer workers converge regardless of order.
    fn update_region(
        &self,
        region: &str,
        target_len: u64,
        batch_values: impl Iterator<Item = u64>,
        batch_offset: u64,
    ) -> Result<()> {
        // window of each value's first/last position within this batch
        let mut windows: HashMap<u64, (u64, u64)> = HashMap::new();
        for (pos, value) in batch_values.enumerate() {
            let pos = pos as u64;
            windows
                .entry(value)
                .and_modify(|(_, last)| *last = pos)
                .or_insert((pos, pos));
        }

        self.store.with_routed(region, |c| {
            if c.dataset_rows(region)? < target_len {
                c.resize_dataset(region, target_len)?;
            }
            let (lo, hi) = match windows.keys().minmax() {
                MinMaxResult::NoElements => return Ok(()),
                MinMaxResult::OneElement(v) => (*v, *v + 1),
                MinMaxResult::MinMax(a, b) => (*a, *b + 1),
            };
            let array = c.read_rows(region, lo, hi)?;
            let mut entries = RegionEntry::decode_array(&array).map_err(|e| {
                container_file::Error::InvalidFormat {
                    path: region.into(),
                    reason: e.to_string(),
                }
            })?;
            for (value, (first, last)) in &windows {
                let entry = &mut entries[(value - lo) as usize];
                entry.widen(
                    (batch_offset + first) as i64,
                    (batch_offset + last + 1) as i64,
                );
            }
            c.write_rows(region, lo, &RegionEntry::encode_array(&entries))
        })
    }

    // ---- dereferencing ---------------------------------------------------

    /// One dereference hop: resolve the table, narrow it through the region
    /// table when one exists, and group the matching rows by `sel`.
    fn deref_step(
        &self,
        parent: &str,
        child: &str,
        sel: &[u64],
        mask: Option<&[bool]>,
    ) -> Result<IndexGrid> {
        let handle = self.get_ref(parent, child)?;
        let empty = IndexGrid {
            shape: vec![sel.len(), 0],
            indices: Vec::new(),
            mask: Vec::new(),
        };

        let window = if self.ref_region_exists(parent, child)? {
            let region_len = self.region_len(parent, child)?;
            let valid: Vec<u64> = sel
                .iter()
                .enumerate()
                .filter(|(i, v)| {
                    !mask.map(|m| m[*i]).unwrap_or(false) && **v < region_len
                })
                .map(|(_, v)| *v)
                .collect();
            let (lo, hi) = match valid.iter().minmax() {
                MinMaxResult::NoElements => return Ok(empty),
                MinMaxResult::OneElement(v) => (*v, *v + 1),
                MinMaxResult::MinMax(a, b) => (*a, *b + 1),
            };
            let entries = self.read_region(parent, child, RowSlice::new(lo, hi))?;
            let mut span: Option<(i64, i64)> = None;
            for v in &valid {
                let entry = entries[(v - lo) as usize];
                if !entry.is_empty() {
                    span = Some(match span {
                        None => (entry.start, entry.stop),
                        Some((s, t)) => (s.min(entry.start), t.max(entry.stop)),
                    });
                }
            }
            match span {
                Some((start, stop)) => RowSlice::new(start as u64, stop as u64),
                None => return Ok(empty),
            }
        } else {
            RowSlice::new(0, handle.rows)
        };

        let refs = self.read_ref_rows(&handle, window)?;
        Ok(algebra::group_children(sel, mask, &refs, handle.direction))
    }

    /// Fetch the child rows selected by `grid` from dataset `name`,
    /// zero-filling masked slots. The read is narrowed to the window of
    /// indices actually used.
    pub fn gather_rows(&self, name: &str, grid: &IndexGrid) -> Result<MaskedData> {
        let element = self.dset_element(name)?;
        let (lo, hi) = match grid.valid_indices().minmax() {
            MinMaxResult::NoElements => {
                return Ok(MaskedData {
                    shape: grid.shape.clone(),
                    values: Array::zeros(element, grid.len()),
                    mask: grid.mask.clone(),
                })
            }
            MinMaxResult::OneElement(v) => (v, v + 1),
            MinMaxResult::MinMax(a, b) => (a, b + 1),
        };
        let window = self.read_data(name, RowSlice::new(lo, hi))?;
        let row_size = element.row_size();
        let mut bytes = vec![0u8; grid.len() * row_size];
        for (slot, (index, masked)) in grid.indices.iter().zip(grid.mask.iter()).enumerate() {
            if !masked {
                let src = window.row((index - lo) as usize);
                bytes[slot * row_size..(slot + 1) * row_size].copy_from_slice(src);
            }
        }
        Ok(MaskedData {
            shape: grid.shape.clone(),
            values: Array::from_raw(element, bytes)?,
            mask: grid.mask.clone(),
        })
    }

    /// Dereference `sel` (indices into `parent`) through the reference
    /// table into `child`, returning a rectangular masked result.
    pub fn dereference(
        &self,
        parent: &str,
        child: &str,
        sel: &[u64],
        mask: Option<&[bool]>,
        opts: DerefOptions,
    ) -> Result<Deref> {
        let grid = self.deref_step(parent, child, sel, mask)?;
        if opts.indices_only {
            Ok(Deref::Indices(grid))
        } else {
            Ok(Deref::Data(self.gather_rows(child, &grid)?))
        }
    }

    /// The ragged variant of [`DataManager::dereference`]: one list per
    /// entry of `sel` instead of a padded rectangle.
    pub fn dereference_ragged(
        &self,
        parent: &str,
        child: &str,
        sel: &[u64],
        mask: Option<&[bool]>,
        opts: DerefOptions,
    ) -> Result<Ragged> {
        let grid = self.deref_step(parent, child, sel, mask)?;
        let width = grid.width();
        let lists: Vec<Vec<u64>> = (0..sel.len())
            .map(|row| {
                (0..width)
                    .filter(|slot| !grid.mask[row * width + slot])
                    .map(|slot| grid.indices[row * width + slot])
                    .collect()
            })
            .collect();
        if opts.indices_only {
            return Ok(Ragged::Indices(lists));
        }
        let element = self.dset_element(child)?;
        let row_size = element.row_size();
        let flat: Vec<u64> = lists.iter().flatten().copied().collect();
        let window = match (flat.iter().min(), flat.iter().max()) {
            (Some(lo), Some(hi)) => Some((*lo, self.read_data(child, RowSlice::new(*lo, hi + 1))?)),
            _ => None,
        };
        let data = lists
            .iter()
            .map(|list| {
                let mut bytes = Vec::with_capacity(list.len() * row_size);
                if let Some((lo, window)) = &window {
                    for index in list {
                        bytes.extend_from_slice(window.row((index - lo) as usize));
                    }
                }
                Ok(Array::from_raw(element.clone(), bytes)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Ragged::Data(data))
    }

    /// Walk the dataset chain `names[0] -> names[1] -> … -> names[k]`,
    /// stacking one result axis per hop; the final shape is
    /// `(sel.len(), K₁, …, Kₖ)` and the mask accumulates across hops.
    pub fn dereference_chain(
        &self,
        names: &[&str],
        sel: &[u64],
        mask: Option<&[bool]>,
        opts: DerefOptions,
    ) -> Result<Deref> {
        ensure!(
            names.len() >= 2,
            SpecInvalidSnafu {
                reason: format!("dereference chain needs at least two datasets, got {:?}", names),
            }
        );
        let mut shape = vec![sel.len()];
        let mut indices = sel.to_vec();
        let mut acc_mask: Vec<bool> = mask
            .map(<[bool]>::to_vec)
            .unwrap_or_else(|| vec![false; sel.len()]);
        for pair in names.windows(2) {
            let grid = self.deref_step(pair[0], pair[1], &indices, Some(&acc_mask))?;
            shape.push(grid.width());
            indices = grid.indices;
            acc_mask = grid.mask;
        }
        let grid = IndexGrid {
            shape,
            indices,
            mask: acc_mask,
        };
        if opts.indices_only {
            Ok(Deref::Indices(grid))
        } else {
            let last = names.last().expect("validated above");
            Ok(Deref::Data(self.gather_rows(last, &grid)?))
        }
    }

    // ---- teardown --------------------------------------------------------

    /// Remove dataset `name` and every reference table anchored on it from
    /// the primary container only; scratch entries are left in place.
    /// Missing objects are ignored.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        for info in self.anchored_refs(name, false)? {
            for region in [&info.region0, &info.region1] {
                let group = region
                    .strip_suffix("/ref_region")
                    .unwrap_or(region)
                    .to_string();
                self.store.with_primary(|c| {
                    if c.exists(&group) {
                        c.delete(&group)?;
                    }
                    Ok(())
                })?;
            }
        }
        self.store.with_primary(|c| {
            if c.exists(name) {
                c.delete(name)?;
            }
            Ok(())
        })
    }

    /// Delete every path on the drop-list, close the store and remove the
    /// scratch container (worker 0, after a barrier).
    pub fn finish(&self) -> Result<()> {
        for path in self.store.drop_list().to_vec() {
            info!(path = path.as_str(), "deleting dropped output");
            self.delete(&path)?;
        }
        self.store.close()?;
        self.comm.barrier()?;
        if self.comm.rank() == 0 {
            self.store.remove_scratch().context(ScratchCleanupSnafu)?;
        }
        Ok(())
    }
}

fn encode_pairs(element: &ElementType, pairs: &[[u64; 2]]) -> Result<Array> {
    match element.scalar {
        ScalarType::U64 => Ok(Array::from_u64_pairs(pairs)),
        ScalarType::U32 => {
            let mut bytes = Vec::with_capacity(pairs.len() * 8);
            for [a, b] in pairs {
                bytes.extend_from_slice(&(*a as u32).to_le_bytes());
                bytes.extend_from_slice(&(*b as u32).to_le_bytes());
            }
            Ok(Array::from_raw(element.clone(), bytes)?)
        }
        _ => SpecInvalidSnafu {
            reason: format!("reference table has element type {}", element),
        }
        .fail(),
    }
}

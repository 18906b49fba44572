//! The reference algebra: grouping reference rows by parent into
//! rectangular index grids (plus masks) or ragged lists.
//!
//! Everything here is pure index arithmetic over in-memory reference rows;
//! the data manager narrows the on-disk tables to the relevant windows,
//! calls into this module, and gathers child rows for the resulting grids
//! (see [`crate::DataManager::dereference`]).

use flow_types::Array;
use hashbrown::HashMap;

/// A rectangular grid of indices into a child dataset, one row per selected
/// parent entry, padded to the widest parent with mask bits.
///
/// For chained dereferencing the grid grows one trailing axis per hop;
/// `indices` and `mask` are row-major over `shape`. `mask[i] == true` means
/// "slot empty or selection invalid".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexGrid {
    /// Row-major extent, `(n, K₁, …, Kₖ)`.
    pub shape: Vec<usize>,
    /// Child indices; padding slots hold 0 under a set mask bit.
    pub indices: Vec<u64>,
    /// True = slot empty / invalid.
    pub mask: Vec<bool>,
}

impl IndexGrid {
    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True when the grid has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Extent of the innermost axis.
    pub fn width(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// The unmasked indices, in row-major order.
    pub fn valid_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.indices
            .iter()
            .zip(self.mask.iter())
            .filter(|(_, m)| !**m)
            .map(|(i, _)| *i)
    }
}

/// Masked dereferenced data: dense row-major child rows plus the mask of
/// [`IndexGrid`] it was gathered from. Masked slots are zero-filled.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedData {
    /// Row-major extent, `(n, K₁, …, Kₖ)`.
    pub shape: Vec<usize>,
    /// One child row per slot.
    pub values: Array,
    /// True = slot empty / invalid.
    pub mask: Vec<bool>,
}

impl MaskedData {
    /// Decode slot `flat` as `i64`, `None` when masked.
    pub fn i64_at(&self, flat: usize) -> Option<i64> {
        if self.mask[flat] {
            return None;
        }
        let row = self.values.row(flat);
        Some(i64::from_le_bytes(row[..8].try_into().unwrap()))
    }
}

/// Group the reference rows in `refs` by the parent entries selected in
/// `sel`, producing a `(sel.len(), K)` grid where `K` is the widest parent.
///
/// `direction = (s, t)`: column `s` of every reference row is matched
/// against `sel`, column `t` provides the child index. Within one parent,
/// children appear in ascending index order (rows are ordered
/// lexicographically by `(s, t)`), which keeps the result deterministic
/// across workers. Entries of `sel` flagged in `sel_mask` produce fully
/// masked rows.
pub fn group_children(
    sel: &[u64],
    sel_mask: Option<&[bool]>,
    refs: &[[u64; 2]],
    direction: (usize, usize),
) -> IndexGrid {
    let is_masked = |i: usize| sel_mask.map(|m| m[i]).unwrap_or(false);

    // positions in `sel` per parent value, skipping invalid entries
    let mut positions: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, parent) in sel.iter().enumerate() {
        if !is_masked(i) {
            positions.entry(*parent).or_default().push(i);
        }
    }

    let mut matched: Vec<(u64, u64)> = refs
        .iter()
        .filter(|r| positions.contains_key(&r[direction.0]))
        .map(|r| (r[direction.0], r[direction.1]))
        .collect();
    matched.sort_unstable();

    let mut width = 0;
    {
        let mut run = 0;
        let mut prev = None;
        for (parent, _) in &matched {
            if prev == Some(*parent) {
                run += 1;
            } else {
                run = 1;
                prev = Some(*parent);
            }
            width = width.max(run);
        }
    }

    let mut grid = IndexGrid {
        shape: vec![sel.len(), width],
        indices: vec![0; sel.len() * width],
        mask: vec![true; sel.len() * width],
    };

    let mut start = 0;
    while start < matched.len() {
        let parent = matched[start].0;
        let mut stop = start;
        while stop < matched.len() && matched[stop].0 == parent {
            stop += 1;
        }
        if let Some(rows) = positions.get(&parent) {
            for &row in rows {
                for (slot, (_, child)) in matched[start..stop].iter().enumerate() {
                    grid.indices[row * width + slot] = *child;
                    grid.mask[row * width + slot] = false;
                }
            }
        }
        start = stop;
    }

    grid
}

/// The ragged variant of [`group_children`]: per selected parent, the
/// ascending child indices. Invalid selections yield empty lists.
pub fn group_children_ragged(
    sel: &[u64],
    sel_mask: Option<&[bool]>,
    refs: &[[u64; 2]],
    direction: (usize, usize),
) -> Vec<Vec<u64>> {
    let grid = group_children(sel, sel_mask, refs, direction);
    let width = grid.width();
    sel.iter()
        .enumerate()
        .map(|(row, _)| {
            (0..width)
                .filter(|slot| !grid.mask[row * width + slot])
                .map(|slot| grid.indices[row * width + slot])
                .collect()
        })
        .collect()
}

use std::fmt;
use std::ops::Range;

/// A half-open `[start, stop)` window of row positions within a dataset.
///
/// The zero-length slice doubles as the generator's "locally exhausted"
/// sentinel, so `RowSlice::EMPTY` compares equal to any other empty window
/// for termination purposes (see [`RowSlice::is_empty`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowSlice {
    /// First row covered by the window.
    pub start: u64,
    /// One past the last row covered by the window.
    pub stop: u64,
}

/// The zero-length sentinel returned by exhausted generators.
pub const EMPTY: RowSlice = RowSlice { start: 0, stop: 0 };

impl RowSlice {
    /// The zero-length sentinel returned by exhausted generators.
    pub const EMPTY: Self = EMPTY;

    /// Create a window covering `[start, stop)`. `stop < start` collapses to
    /// the empty window at `start`.
    pub fn new(start: u64, stop: u64) -> Self {
        Self {
            start,
            stop: stop.max(start),
        }
    }

    /// Number of rows covered.
    pub fn len(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    /// True when this window covers no rows.
    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    /// True when `other` lies entirely within this window.
    pub fn contains(&self, other: &Self) -> bool {
        other.is_empty() || (other.start >= self.start && other.stop <= self.stop)
    }

    /// The covered positions as a `Range` for iteration.
    pub fn range(&self) -> Range<u64> {
        self.start..self.stop
    }
}

impl fmt::Display for RowSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

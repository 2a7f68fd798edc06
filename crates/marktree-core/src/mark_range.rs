//! Mark ranges: half-open `[begin, end)` intervals of mark numbers within
//! one part, kept sorted and non-overlapping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which strategy produced a part's candidate ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchAlgorithm {
    /// No search ran (predicate unconstrained, or nothing to search).
    Unknown,
    /// Boundary location by halving; needs a single continuous key interval.
    BinarySearch,
    /// Stack-driven exclusion of implausible sub-ranges.
    GenericExclusionSearch,
}

impl fmt::Display for SearchAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchAlgorithm::Unknown => write!(f, "none"),
            SearchAlgorithm::BinarySearch => write!(f, "binary search"),
            SearchAlgorithm::GenericExclusionSearch => write!(f, "generic exclusion search"),
        }
    }
}

/// Half-open interval `[begin, end)` of mark numbers. `begin <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRange {
    pub begin: usize,
    pub end: usize,
}

impl MarkRange {
    pub fn new(begin: usize, end: usize) -> Self {
        MarkRange { begin, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

impl fmt::Display for MarkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.begin, self.end)
    }
}

/// Ordered, non-overlapping mark ranges for one part, tagged with the
/// algorithm that produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkRanges {
    pub ranges: Vec<MarkRange>,
    pub search_algorithm: Option<SearchAlgorithm>,
}

impl MarkRanges {
    pub fn new() -> Self {
        MarkRanges { ranges: Vec::new(), search_algorithm: None }
    }

    /// The full search space of a part: `[0, marks)` as a single range.
    pub fn whole_part(marks: usize) -> Self {
        let ranges = if marks == 0 { Vec::new() } else { vec![MarkRange::new(0, marks)] };
        MarkRanges { ranges, search_algorithm: None }
    }

    pub fn from_ranges(ranges: Vec<MarkRange>) -> Self {
        MarkRanges { ranges, search_algorithm: None }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MarkRange> {
        self.ranges.iter()
    }

    /// Total number of marks covered by all ranges.
    pub fn total_marks(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    /// Append `range`, merging it into the previous range when the gap is
    /// within `min_marks_for_seek`. Bounds the number of disk seeks a reader
    /// will pay for the result set. `range.begin` must not precede the
    /// current tail.
    pub fn append_or_merge(&mut self, range: MarkRange, min_marks_for_seek: usize) {
        if range.is_empty() {
            return;
        }
        match self.ranges.last_mut() {
            Some(last) if range.begin <= last.end + min_marks_for_seek => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => self.ranges.push(range),
        }
    }

    /// True when ranges are sorted, non-overlapping and non-empty.
    pub fn is_ascending(&self) -> bool {
        if self.ranges.iter().any(|r| r.begin >= r.end) {
            return false;
        }
        self.ranges.windows(2).all(|w| w[0].end <= w[1].begin)
    }

    /// Mark coverage subset test against `other` (used by filtering stages
    /// that may only narrow).
    pub fn is_subset_of(&self, other: &MarkRanges) -> bool {
        self.ranges.iter().all(|r| {
            other
                .ranges
                .iter()
                .any(|o| o.begin <= r.begin && r.end <= o.end)
        })
    }
}

impl<'a> IntoIterator for &'a MarkRanges {
    type Item = &'a MarkRange;
    type IntoIter = std::slice::Iter<'a, MarkRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

impl fmt::Display for MarkRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, "]")
    }
}

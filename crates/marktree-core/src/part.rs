//! Part metadata the pruning engine reads: identity, the mark index (row
//! offsets per mark), minmax bounds and the loaded primary-key prefix.
//!
//! Parts are created and owned by the storage layer. This engine only ever
//! holds `Arc<Part>` references for the duration of one query and never
//! mutates them.

use crate::key::{KeyValue, ValueRange};
use crate::mark_range::{MarkRange, MarkRanges};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Default number of rows between marks.
pub const DEFAULT_ROWS_PER_MARK: u64 = 8192;

/// Per-part granularity scale used to convert row/byte settings into mark
/// counts. `bytes_per_mark == 0` means the part has no byte-based marks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexGranularityInfo {
    pub fixed_rows_per_mark: u64,
    pub bytes_per_mark: u64,
}

impl Default for IndexGranularityInfo {
    fn default() -> Self {
        IndexGranularityInfo { fixed_rows_per_mark: DEFAULT_ROWS_PER_MARK, bytes_per_mark: 0 }
    }
}

/// The mark index of one part: cumulative row counts per mark.
///
/// A part may carry a final stub mark (zero rows) after its last full mark;
/// searches exclude it unless it is the query's absolute tail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexGranularity {
    /// `partial_sums[m]` is the number of rows in marks `0..=m`.
    partial_sums: Vec<u64>,
    has_final_mark: bool,
}

impl IndexGranularity {
    /// Uniform granularity: every mark holds `rows_per_mark` rows except a
    /// possibly short last one.
    pub fn fixed(rows_per_mark: u64, total_rows: u64, with_final_mark: bool) -> Self {
        let mut partial_sums = Vec::new();
        let mut acc = 0u64;
        while acc < total_rows {
            acc = (acc + rows_per_mark).min(total_rows);
            partial_sums.push(acc);
        }
        if with_final_mark {
            partial_sums.push(acc);
        }
        IndexGranularity { partial_sums, has_final_mark: with_final_mark }
    }

    /// Adaptive granularity from explicit per-mark row counts.
    pub fn adaptive(rows_per_mark: &[u64], with_final_mark: bool) -> Self {
        let mut partial_sums = Vec::with_capacity(rows_per_mark.len() + 1);
        let mut acc = 0u64;
        for rows in rows_per_mark {
            acc += rows;
            partial_sums.push(acc);
        }
        if with_final_mark {
            partial_sums.push(acc);
        }
        IndexGranularity { partial_sums, has_final_mark: with_final_mark }
    }

    pub fn marks_count(&self) -> usize {
        self.partial_sums.len()
    }

    pub fn has_final_mark(&self) -> bool {
        self.has_final_mark
    }

    /// Marks that may contain rows; the search space of every strategy.
    pub fn marks_count_without_final(&self) -> usize {
        self.partial_sums.len() - self.has_final_mark as usize
    }

    pub fn total_rows(&self) -> u64 {
        self.partial_sums.last().copied().unwrap_or(0)
    }

    /// First row number of `mark`; `marks_count` maps to `total_rows`.
    pub fn mark_starting_row(&self, mark: usize) -> u64 {
        if mark == 0 {
            0
        } else {
            self.partial_sums[mark - 1]
        }
    }

    pub fn rows_in_range(&self, range: &MarkRange) -> u64 {
        self.mark_starting_row(range.end) - self.mark_starting_row(range.begin)
    }

    pub fn rows_in_ranges(&self, ranges: &MarkRanges) -> u64 {
        ranges.iter().map(|r| self.rows_in_range(r)).sum()
    }

    /// Index of the mark containing the given part-global row number;
    /// `total_rows` and beyond map past the last mark.
    pub fn mark_containing_row(&self, row: u64) -> usize {
        self.partial_sums.partition_point(|&end| end <= row)
    }

    /// How many marks the first `rows` rows starting at `from_mark` span.
    /// Maps a row offset inside an index granule back to a mark offset.
    pub fn count_marks_for_rows(&self, from_mark: usize, rows: u64) -> usize {
        let target = self.mark_starting_row(from_mark) + rows;
        self.mark_containing_row(target) - from_mark
    }
}

/// Loaded prefix of the primary-key index: per loaded key column, the value
/// at each mark's first row. May cover fewer columns than the sort key;
/// unloaded columns evaluate as unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimaryIndex {
    columns: Vec<Vec<KeyValue>>,
}

impl PrimaryIndex {
    pub fn new(columns: Vec<Vec<KeyValue>>) -> Self {
        PrimaryIndex { columns }
    }

    pub fn loaded_columns(&self) -> usize {
        self.columns.len()
    }

    /// Entries available per loaded column (0 when nothing is loaded).
    pub fn entries(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn column_len(&self, column: usize) -> usize {
        self.columns.get(column).map(|c| c.len()).unwrap_or(0)
    }

    /// Value of `column` at `mark`, or `None` when the column is not loaded
    /// or the mark is past the stored entries.
    pub fn value_at(&self, column: usize, mark: usize) -> Option<&KeyValue> {
        self.columns.get(column).and_then(|c| c.get(mark))
    }
}

/// One immutable, sorted-by-key unit of storage.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub uuid: Option<Uuid>,
    pub partition_id: String,
    /// The partition key tuple shared by every row of the part.
    pub partition_value: Vec<KeyValue>,
    /// Minmax bounds per partition minmax column, inclusive.
    pub minmax: Option<Vec<ValueRange>>,
    pub max_block: i64,
    pub bytes_on_disk: u64,
    pub granularity_info: IndexGranularityInfo,
    pub granularity: IndexGranularity,
    pub primary_index: Option<PrimaryIndex>,
}

impl Part {
    pub fn new(name: impl Into<String>, partition_id: impl Into<String>, granularity: IndexGranularity) -> Self {
        Part {
            name: name.into(),
            uuid: None,
            partition_id: partition_id.into(),
            partition_value: Vec::new(),
            minmax: None,
            max_block: 0,
            bytes_on_disk: 0,
            granularity_info: IndexGranularityInfo::default(),
            granularity,
            primary_index: None,
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_partition_value(mut self, value: Vec<KeyValue>) -> Self {
        self.partition_value = value;
        self
    }

    pub fn with_minmax(mut self, minmax: Vec<ValueRange>) -> Self {
        self.minmax = Some(minmax);
        self
    }

    pub fn with_max_block(mut self, max_block: i64) -> Self {
        self.max_block = max_block;
        self
    }

    pub fn with_bytes_on_disk(mut self, bytes: u64) -> Self {
        self.bytes_on_disk = bytes;
        self
    }

    pub fn with_granularity_info(mut self, info: IndexGranularityInfo) -> Self {
        self.granularity_info = info;
        self
    }

    pub fn with_primary_index(mut self, index: PrimaryIndex) -> Self {
        self.primary_index = Some(index);
        self
    }

    pub fn rows_count(&self) -> u64 {
        self.granularity.total_rows()
    }

    pub fn marks_count(&self) -> usize {
        self.granularity.marks_count()
    }
}

/// Final per-part analysis output: the ranges a reader must visit, the
/// subset proven free of false positives, and optional per-part read hints
/// from vector indexes.
#[derive(Debug, Clone)]
pub struct RangesInPart {
    pub part: Arc<Part>,
    pub part_index_in_query: usize,
    /// Row number of this part's first row within the query-wide
    /// concatenation of selected parts.
    pub part_starting_offset_in_query: u64,
    pub ranges: MarkRanges,
    pub exact_ranges: MarkRanges,
    pub read_hints: Option<crate::skip_index::VectorSearchHits>,
}

impl RangesInPart {
    pub fn new(part: Arc<Part>, part_index_in_query: usize) -> Self {
        RangesInPart {
            part,
            part_index_in_query,
            part_starting_offset_in_query: 0,
            ranges: MarkRanges::new(),
            exact_ranges: MarkRanges::new(),
            read_hints: None,
        }
    }

    pub fn rows(&self) -> u64 {
        self.part.granularity.rows_in_ranges(&self.ranges)
    }
}

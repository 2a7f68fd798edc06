//! Engine tunables and the row/byte-to-mark arithmetic they feed.

use crate::part::IndexGranularityInfo;
use serde::{Deserialize, Serialize};

fn default_coarse_index_granularity() -> usize {
    8
}

fn default_min_rows_for_concurrent_read() -> u64 {
    163_840
}

fn default_min_bytes_for_concurrent_read() -> u64 {
    251_658_240
}

fn default_true() -> bool {
    true
}

/// Per-query pruning settings. All fields have serde defaults so partial
/// config files load cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectSettings {
    /// Rows below this distance between candidate ranges are read through
    /// rather than paying a seek.
    #[serde(default)]
    pub merge_tree_min_rows_for_seek: u64,
    /// Byte analogue of `merge_tree_min_rows_for_seek`; only applies to
    /// parts with byte-scaled marks.
    #[serde(default)]
    pub merge_tree_min_bytes_for_seek: u64,
    /// Fan-out of the generic exclusion search. Must be greater than 1.
    #[serde(default = "default_coarse_index_granularity")]
    pub merge_tree_coarse_index_granularity: usize,
    #[serde(default = "default_min_rows_for_concurrent_read")]
    pub merge_tree_min_rows_for_concurrent_read: u64,
    #[serde(default = "default_min_bytes_for_concurrent_read")]
    pub merge_tree_min_bytes_for_concurrent_read: u64,
    /// Cap on worker threads for the per-part index stage; 0 means no cap
    /// beyond the stream count.
    #[serde(default)]
    pub max_threads_for_indexes: usize,
    /// Fail queries that touch more distinct partitions than this.
    #[serde(default)]
    pub max_partitions_to_read: Option<usize>,
    /// Concurrency gate: maximum simultaneously registered queries. 0
    /// disables the gate.
    #[serde(default)]
    pub max_concurrent_queries: usize,
    /// Queries selecting at least this many marks register under the
    /// concurrency gate. 0 disables the gate.
    #[serde(default)]
    pub min_marks_to_honor_max_concurrent_queries: usize,
    #[serde(default = "default_true")]
    pub use_skip_indexes: bool,
    /// Ask bulk-capable indexes for one reduction over all granules instead
    /// of a call per granule.
    #[serde(default = "default_true")]
    pub secondary_indices_enable_bulk_filtering: bool,
    #[serde(default = "default_true")]
    pub use_query_condition_cache: bool,
    /// Fail when neither partition-key pruning path can ever prune.
    #[serde(default)]
    pub force_index_by_date: bool,
    /// Fail when the primary-key condition cannot ever prune.
    #[serde(default)]
    pub force_primary_key: bool,
}

impl Default for SelectSettings {
    fn default() -> Self {
        SelectSettings {
            merge_tree_min_rows_for_seek: 0,
            merge_tree_min_bytes_for_seek: 0,
            merge_tree_coarse_index_granularity: default_coarse_index_granularity(),
            merge_tree_min_rows_for_concurrent_read: default_min_rows_for_concurrent_read(),
            merge_tree_min_bytes_for_concurrent_read: default_min_bytes_for_concurrent_read(),
            max_threads_for_indexes: 0,
            max_partitions_to_read: None,
            max_concurrent_queries: 0,
            min_marks_to_honor_max_concurrent_queries: 0,
            use_skip_indexes: true,
            secondary_indices_enable_bulk_filtering: true,
            use_query_condition_cache: true,
            force_index_by_date: false,
            force_primary_key: false,
        }
    }
}

impl SelectSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_rows_for_seek(mut self, rows: u64) -> Self {
        self.merge_tree_min_rows_for_seek = rows;
        self
    }

    pub fn with_min_bytes_for_seek(mut self, bytes: u64) -> Self {
        self.merge_tree_min_bytes_for_seek = bytes;
        self
    }

    pub fn with_coarse_index_granularity(mut self, granularity: usize) -> Self {
        self.merge_tree_coarse_index_granularity = granularity;
        self
    }

    pub fn with_max_threads_for_indexes(mut self, threads: usize) -> Self {
        self.max_threads_for_indexes = threads;
        self
    }

    pub fn with_max_partitions_to_read(mut self, limit: Option<usize>) -> Self {
        self.max_partitions_to_read = limit;
        self
    }

    pub fn with_concurrency_gate(mut self, max_queries: usize, min_marks: usize) -> Self {
        self.max_concurrent_queries = max_queries;
        self.min_marks_to_honor_max_concurrent_queries = min_marks;
        self
    }

    pub fn with_use_skip_indexes(mut self, enabled: bool) -> Self {
        self.use_skip_indexes = enabled;
        self
    }

    pub fn with_bulk_filtering(mut self, enabled: bool) -> Self {
        self.secondary_indices_enable_bulk_filtering = enabled;
        self
    }

    pub fn with_query_condition_cache(mut self, enabled: bool) -> Self {
        self.use_query_condition_cache = enabled;
        self
    }

    pub fn with_force_index_by_date(mut self, enabled: bool) -> Self {
        self.force_index_by_date = enabled;
        self
    }

    pub fn with_force_primary_key(mut self, enabled: bool) -> Self {
        self.force_primary_key = enabled;
        self
    }

    /// Seek-coalescing threshold for one part, in marks.
    pub fn min_marks_for_seek(&self, info: &IndexGranularityInfo) -> usize {
        round_rows_or_bytes_to_marks(
            self.merge_tree_min_rows_for_seek,
            self.merge_tree_min_bytes_for_seek,
            info.fixed_rows_per_mark,
            info.bytes_per_mark,
        )
    }
}

/// Convert row and byte thresholds to a mark count for a part with the given
/// granularity scales. The byte term participates only for parts with
/// byte-scaled marks.
pub fn round_rows_or_bytes_to_marks(
    rows_setting: u64,
    bytes_setting: u64,
    rows_granularity: u64,
    bytes_granularity: u64,
) -> usize {
    let rows_granularity = rows_granularity.max(1);
    let res = (rows_setting.div_ceil(rows_granularity)) as usize;
    if bytes_granularity == 0 {
        res
    } else {
        res.max(bytes_setting.div_ceil(bytes_granularity) as usize)
    }
}

/// Lower bound on marks one reader should take in a single step, at least 1.
pub fn min_marks_for_concurrent_read(
    rows_setting: u64,
    bytes_setting: u64,
    rows_granularity: u64,
    bytes_granularity: u64,
) -> usize {
    round_rows_or_bytes_to_marks(rows_setting, bytes_setting, rows_granularity, bytes_granularity)
        .max(1)
}

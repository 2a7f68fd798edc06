//! Query-level coordinator. Runs every pruning stage in order and reports
//! what each stage kept and dropped.
//!
//! The stages, in the order they run:
//!
//! 1. part selection (allow-list, block ceiling, minmax index, partition
//!    pruner, optional UUID deduplication),
//! 2. sampling analysis, which may push key-value bounds into the primary
//!    key condition or prove the query reads nothing,
//! 3. per-part primary key mark search,
//! 4. intersection with cached WHERE-condition bitmaps,
//! 5. skip indexes, stand-alone then merged,
//! 6. resource limits: partition count and the concurrency gate.
//!
//! Stages 3-5 run per part, in parallel when the query brings enough
//! streams, and never grow a part's mark ranges.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::condition::{KeyCondition, OffsetConditions};
use crate::condition_cache::{filter_ranges_with_cached_marks, QueryConditionCache};
use crate::error::{SelectError, SelectResult};
use crate::indexes::InMemoryIndexStore;
use crate::mark_range::{MarkRange, MarkRanges, SearchAlgorithm};
use crate::mark_search::mark_ranges_from_key_range;
use crate::part::{Part, RangesInPart};
use crate::partition::{
    select_parts_to_read, select_parts_to_read_with_uuid_filter, IgnoredPartUuids,
    PartFilterCounters, PartFilterSnapshot, PartitionPruner, PinnedPartUuids,
};
use crate::sampling::{
    build_sampling, ParallelReplicas, Ratio, SampleRequest, SamplingKey, SamplingPlan,
};
use crate::settings::SelectSettings;
use crate::skip_index::{
    filter_marks_by_index, filter_marks_by_merged_index, IndexStore, MutationsSnapshot,
    UsefulSkipIndexes,
};

// ===== Query status =====

/// Shared cancellation and deadline token. The per-part stage checks it once
/// per part, so long queries stop within one part's worth of work.
#[derive(Debug, Default)]
pub struct QueryStatus {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl QueryStatus {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        QueryStatus {
            cancelled: AtomicBool::new(false),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> SelectResult<()> {
        if self.is_cancelled() {
            return Err(SelectError::Cancelled("query was cancelled".into()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(SelectError::Timeout("query deadline exceeded".into()));
            }
        }
        Ok(())
    }
}

// ===== Concurrency gate =====

/// Table-wide set of query ids currently holding a concurrency slot.
#[derive(Debug, Default)]
pub struct ConcurrentQueryRegistry {
    query_ids: Mutex<HashSet<String>>,
}

impl ConcurrentQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_queries(&self) -> usize {
        self.query_ids.lock().len()
    }

    /// Take a slot for `query_id`. A repeated registration of an id that
    /// already holds a slot shares it and returns no holder, so only the
    /// first registration's drop releases the slot.
    pub fn try_register(
        self: &Arc<Self>,
        query_id: &str,
        max_queries: usize,
    ) -> SelectResult<Option<QueryIdHolder>> {
        let mut ids = self.query_ids.lock();
        if ids.contains(query_id) {
            return Ok(None);
        }
        if ids.len() >= max_queries {
            return Err(SelectError::ResourceLimit(format!(
                "too many concurrent queries: {} active, max {}",
                ids.len(),
                max_queries
            )));
        }
        ids.insert(query_id.to_string());
        Ok(Some(QueryIdHolder { query_id: query_id.to_string(), registry: Arc::clone(self) }))
    }

    fn unregister(&self, query_id: &str) {
        self.query_ids.lock().remove(query_id);
    }
}

/// Releases a query's concurrency slot when dropped.
#[derive(Debug)]
pub struct QueryIdHolder {
    query_id: String,
    registry: Arc<ConcurrentQueryRegistry>,
}

impl QueryIdHolder {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl Drop for QueryIdHolder {
    fn drop(&mut self) {
        self.registry.unregister(&self.query_id);
    }
}

// ===== Stage statistics =====

/// Which pruning stage a statistics row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    None,
    MinMax,
    Partition,
    PrimaryKey,
    Skip,
}

/// One row of the per-stage pruning report. `num_parts_before` and friends
/// count that stage's own input, so consecutive rows chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStat {
    pub index_type: IndexType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub used_keys: Vec<usize>,
    pub num_parts_before: u64,
    pub num_parts_after: u64,
    pub num_granules_before: u64,
    pub num_granules_after: u64,
    #[serde(default)]
    pub search_algorithm: Option<SearchAlgorithm>,
    #[serde(default)]
    pub elapsed_us: u64,
}

/// Counters one per-part stage accumulates across parts and worker threads.
#[derive(Default)]
struct StageStat {
    total_parts: AtomicU64,
    parts_dropped: AtomicU64,
    total_granules: AtomicU64,
    granules_dropped: AtomicU64,
    elapsed_us: AtomicU64,
}

struct StageSnapshot {
    total_parts: u64,
    parts_dropped: u64,
    total_granules: u64,
    granules_dropped: u64,
    elapsed_us: u64,
}

impl StageStat {
    fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            total_parts: self.total_parts.load(Ordering::Relaxed),
            parts_dropped: self.parts_dropped.load(Ordering::Relaxed),
            total_granules: self.total_granules.load(Ordering::Relaxed),
            granules_dropped: self.granules_dropped.load(Ordering::Relaxed),
            elapsed_us: self.elapsed_us.load(Ordering::Relaxed),
        }
    }
}

// ===== Query =====

/// Everything one query brings to the analysis. Build with [`SelectQuery::new`]
/// and the `with_*` methods; every stage input is optional except the primary
/// key condition, which may be [`KeyCondition::always_true`].
pub struct SelectQuery {
    pub key_condition: KeyCondition,
    pub offset_conditions: OffsetConditions,
    /// Checked against each part's minmax index of partition-key columns.
    pub minmax_condition: Option<KeyCondition>,
    pub partition_pruner: Option<PartitionPruner>,
    pub skip_indexes: UsefulSkipIndexes,
    pub sampling: Option<SampleRequest>,
    pub sampling_key: Option<SamplingKey>,
    pub parallel_replicas: Option<ParallelReplicas>,
    /// Allow-list of part names; `None` admits every part.
    pub part_values: Option<HashSet<String>>,
    /// Per-partition ceiling on part block numbers; partitions without an
    /// entry are not read at all.
    pub max_block_numbers_to_read: Option<HashMap<String, i64>>,
    /// Key of this query's cached WHERE-condition bitmaps.
    pub where_condition_hash: Option<u64>,
    pub query_id: String,
    pub num_streams: usize,
    pub find_exact_ranges: bool,
}

impl SelectQuery {
    pub fn new(key_condition: KeyCondition) -> Self {
        SelectQuery {
            key_condition,
            offset_conditions: OffsetConditions::default(),
            minmax_condition: None,
            partition_pruner: None,
            skip_indexes: UsefulSkipIndexes::new(),
            sampling: None,
            sampling_key: None,
            parallel_replicas: None,
            part_values: None,
            max_block_numbers_to_read: None,
            where_condition_hash: None,
            query_id: String::new(),
            num_streams: 1,
            find_exact_ranges: false,
        }
    }

    pub fn with_offset_conditions(mut self, conditions: OffsetConditions) -> Self {
        self.offset_conditions = conditions;
        self
    }

    pub fn with_minmax_condition(mut self, condition: KeyCondition) -> Self {
        self.minmax_condition = Some(condition);
        self
    }

    pub fn with_partition_pruner(mut self, pruner: PartitionPruner) -> Self {
        self.partition_pruner = Some(pruner);
        self
    }

    pub fn with_skip_indexes(mut self, indexes: UsefulSkipIndexes) -> Self {
        self.skip_indexes = indexes;
        self
    }

    pub fn with_sampling(mut self, request: SampleRequest, key: SamplingKey) -> Self {
        self.sampling = Some(request);
        self.sampling_key = Some(key);
        self
    }

    /// Declare the table's sampling key without a `SAMPLE` clause; needed
    /// for replica splits of unsampled queries.
    pub fn with_sampling_key(mut self, key: SamplingKey) -> Self {
        self.sampling_key = Some(key);
        self
    }

    pub fn with_parallel_replicas(mut self, replicas: ParallelReplicas) -> Self {
        self.parallel_replicas = Some(replicas);
        self
    }

    pub fn with_part_values(mut self, values: HashSet<String>) -> Self {
        self.part_values = Some(values);
        self
    }

    pub fn with_max_block_numbers(mut self, limits: HashMap<String, i64>) -> Self {
        self.max_block_numbers_to_read = Some(limits);
        self
    }

    pub fn with_where_condition_hash(mut self, hash: u64) -> Self {
        self.where_condition_hash = Some(hash);
        self
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self
    }

    pub fn with_num_streams(mut self, num_streams: usize) -> Self {
        self.num_streams = num_streams;
        self
    }

    pub fn with_find_exact_ranges(mut self, enabled: bool) -> Self {
        self.find_exact_ranges = enabled;
        self
    }
}

// ===== Result =====

/// What the analysis decided: the ranges to read per part, a statistics row
/// per stage, and the totals readers plan capacity from.
#[derive(Debug, Default)]
pub struct AnalysisResult {
    pub parts_with_ranges: Vec<RangesInPart>,
    pub index_stats: Vec<IndexStat>,
    pub part_filter_counters: PartFilterSnapshot,
    pub sampling: SamplingPlan,
    /// Proven-empty result; `parts_with_ranges` is empty and no reader
    /// needs to start.
    pub read_nothing: bool,
    pub total_parts: u64,
    pub selected_parts: u64,
    pub selected_ranges: u64,
    pub selected_marks: u64,
    pub selected_rows: u64,
    /// Keep alive until the read finishes; dropping it releases the
    /// concurrency slot.
    pub query_id_holder: Option<QueryIdHolder>,
}

// ===== Executor =====

/// Runs the full pruning pipeline for queries against one table's parts.
///
/// The executor owns the cross-query state: settings, the index artifact
/// store, the mutations snapshot, the condition cache and the concurrency
/// registry. Each [`analyze`](Self::analyze) call is read-only with respect
/// to the parts it receives.
pub struct SelectExecutor {
    settings: SelectSettings,
    index_store: Arc<dyn IndexStore>,
    mutations: MutationsSnapshot,
    condition_cache: Option<Arc<QueryConditionCache>>,
    query_registry: Arc<ConcurrentQueryRegistry>,
    pinned_uuids: Option<Arc<PinnedPartUuids>>,
    ignored_uuids: Arc<IgnoredPartUuids>,
}

impl SelectExecutor {
    pub fn new(settings: SelectSettings) -> Self {
        SelectExecutor {
            settings,
            index_store: Arc::new(InMemoryIndexStore::new()),
            mutations: MutationsSnapshot::new(),
            condition_cache: None,
            query_registry: Arc::new(ConcurrentQueryRegistry::new()),
            pinned_uuids: None,
            ignored_uuids: Arc::new(IgnoredPartUuids::new()),
        }
    }

    pub fn with_index_store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.index_store = store;
        self
    }

    pub fn with_mutations(mut self, mutations: MutationsSnapshot) -> Self {
        self.mutations = mutations;
        self
    }

    pub fn with_condition_cache(mut self, cache: Arc<QueryConditionCache>) -> Self {
        self.condition_cache = Some(cache);
        self
    }

    pub fn with_query_registry(mut self, registry: Arc<ConcurrentQueryRegistry>) -> Self {
        self.query_registry = registry;
        self
    }

    /// Enable UUID deduplication against other executions of the same
    /// queries, e.g. on other replicas reading the same shard.
    pub fn with_uuid_deduplication(
        mut self,
        pinned: Arc<PinnedPartUuids>,
        ignored: Arc<IgnoredPartUuids>,
    ) -> Self {
        self.pinned_uuids = Some(pinned);
        self.ignored_uuids = ignored;
        self
    }

    pub fn settings(&self) -> &SelectSettings {
        &self.settings
    }

    /// Run the whole pipeline and decide which mark ranges of which parts
    /// the query must read.
    pub fn analyze(
        &self,
        parts: &[Arc<Part>],
        query: &SelectQuery,
        status: &QueryStatus,
    ) -> SelectResult<AnalysisResult> {
        status.check()?;

        let mut index_stats = Vec::new();
        let counters = PartFilterCounters::new();
        let selected =
            self.filter_parts_by_partition(parts, query, &counters, &mut index_stats)?;

        // Sampling mutates the key condition, so it works on a copy; whether
        // the query's own condition can prune is decided before the sampling
        // bounds are pushed in.
        let mut key_condition = query.key_condition.clone();
        let key_condition_useless = key_condition.always_unknown_or_true();
        let approx_total_rows = match &query.sampling {
            Some(request) if request.size > Ratio::ONE || request.offset > Ratio::ONE => {
                approximate_total_rows(&selected, &key_condition, &self.settings)?
            }
            _ => 0,
        };
        let sampling = build_sampling(
            query.sampling.as_ref(),
            query.sampling_key.as_ref(),
            query.parallel_replicas,
            &mut key_condition,
            approx_total_rows,
        )?;
        if sampling.read_nothing {
            return Ok(AnalysisResult {
                index_stats,
                part_filter_counters: counters.snapshot(),
                sampling,
                read_nothing: true,
                total_parts: parts.len() as u64,
                ..Default::default()
            });
        }

        if self.settings.force_primary_key && key_condition_useless {
            return Err(SelectError::Configuration(
                "the primary key is not used and force_primary_key is set".into(),
            ));
        }

        let parts_with_ranges = self.filter_parts_by_primary_key_and_skip_indexes(
            selected,
            query,
            &key_condition,
            status,
            &mut index_stats,
        )?;

        let selected_parts = parts_with_ranges.len() as u64;
        let selected_ranges: u64 = parts_with_ranges.iter().map(|p| p.ranges.len() as u64).sum();
        let selected_marks: u64 =
            parts_with_ranges.iter().map(|p| p.ranges.total_marks() as u64).sum();
        let selected_rows: u64 = parts_with_ranges.iter().map(|p| p.rows()).sum();

        self.check_partition_limit(&parts_with_ranges)?;
        let query_id_holder = self.hold_query_slot(&query.query_id, selected_marks)?;

        debug!(
            parts = selected_parts,
            ranges = selected_ranges,
            marks = selected_marks,
            rows = selected_rows,
            "analysis finished"
        );

        Ok(AnalysisResult {
            parts_with_ranges,
            index_stats,
            part_filter_counters: counters.snapshot(),
            sampling,
            read_nothing: false,
            total_parts: parts.len() as u64,
            selected_parts,
            selected_ranges,
            selected_marks,
            selected_rows,
            query_id_holder,
        })
    }

    fn filter_parts_by_partition(
        &self,
        parts: &[Arc<Part>],
        query: &SelectQuery,
        counters: &PartFilterCounters,
        index_stats: &mut Vec<IndexStat>,
    ) -> SelectResult<Vec<Arc<Part>>> {
        if self.settings.force_index_by_date {
            let minmax_useless =
                query.minmax_condition.as_ref().map_or(true, |c| c.always_unknown_or_true());
            let pruner_useless =
                query.partition_pruner.as_ref().map_or(true, |p| p.useless());
            if minmax_useless && pruner_useless {
                return Err(SelectError::Configuration(
                    "neither the minmax index nor the partition expression can prune and \
                     force_index_by_date is set"
                        .into(),
                ));
            }
        }

        let selected = match &self.pinned_uuids {
            Some(pinned) => select_parts_to_read_with_uuid_filter(
                parts,
                query.part_values.as_ref(),
                query.max_block_numbers_to_read.as_ref(),
                query.minmax_condition.as_ref(),
                query.partition_pruner.as_ref(),
                pinned,
                &self.ignored_uuids,
                counters,
            )?,
            None => select_parts_to_read(
                parts,
                query.part_values.as_ref(),
                query.max_block_numbers_to_read.as_ref(),
                query.minmax_condition.as_ref(),
                query.partition_pruner.as_ref(),
                counters,
            ),
        };

        let snapshot = counters.snapshot();
        let total_granules: u64 =
            parts.iter().map(|p| p.granularity.marks_count_without_final() as u64).sum();

        index_stats.push(IndexStat {
            index_type: IndexType::None,
            name: String::new(),
            description: String::new(),
            condition: String::new(),
            used_keys: Vec::new(),
            num_parts_before: parts.len() as u64,
            num_parts_after: snapshot.num_initial_selected_parts,
            num_granules_before: total_granules,
            num_granules_after: snapshot.num_initial_selected_granules,
            search_algorithm: None,
            elapsed_us: 0,
        });
        if let Some(condition) = &query.minmax_condition {
            index_stats.push(IndexStat {
                index_type: IndexType::MinMax,
                name: String::new(),
                description: String::new(),
                condition: condition.to_string(),
                used_keys: condition.used_key_columns(),
                num_parts_before: snapshot.num_initial_selected_parts,
                num_parts_after: snapshot.num_parts_after_minmax,
                num_granules_before: snapshot.num_initial_selected_granules,
                num_granules_after: snapshot.num_granules_after_minmax,
                search_algorithm: None,
                elapsed_us: 0,
            });
        }
        if let Some(pruner) = &query.partition_pruner {
            index_stats.push(IndexStat {
                index_type: IndexType::Partition,
                name: String::new(),
                description: String::new(),
                condition: pruner.condition().to_string(),
                used_keys: pruner.condition().used_key_columns(),
                num_parts_before: snapshot.num_parts_after_minmax,
                num_parts_after: snapshot.num_parts_after_partition_pruner,
                num_granules_before: snapshot.num_granules_after_minmax,
                num_granules_after: snapshot.num_granules_after_partition_pruner,
                search_algorithm: None,
                elapsed_us: 0,
            });
        }

        debug!(
            total = parts.len(),
            selected = selected.len(),
            "part selection finished"
        );
        Ok(selected)
    }

    fn filter_parts_by_primary_key_and_skip_indexes(
        &self,
        selected: Vec<Arc<Part>>,
        query: &SelectQuery,
        key_condition: &KeyCondition,
        status: &QueryStatus,
        index_stats: &mut Vec<IndexStat>,
    ) -> SelectResult<Vec<RangesInPart>> {
        let mut parts_with_ranges = Vec::with_capacity(selected.len());
        let mut rows_so_far = 0u64;
        for (index, part) in selected.into_iter().enumerate() {
            let rows = part.rows_count();
            let mut ranges_in_part = RangesInPart::new(part, index);
            ranges_in_part.part_starting_offset_in_query = rows_so_far;
            rows_so_far += rows;
            parts_with_ranges.push(ranges_in_part);
        }

        let use_skip_indexes = self.settings.use_skip_indexes && !query.skip_indexes.is_empty();
        // Vector conditions rank rows globally; a bitmap cut below them would
        // silently change the ranking input, so the cache stage stands down.
        let has_vector_search =
            query.skip_indexes.useful.iter().any(|entry| entry.condition.is_vector_search());
        let cache_inputs: Option<(&QueryConditionCache, u64)> =
            if self.settings.use_query_condition_cache && !has_vector_search {
                match (&self.condition_cache, query.where_condition_hash) {
                    (Some(cache), Some(hash)) => Some((cache.as_ref(), hash)),
                    _ => None,
                }
            } else {
                None
            };

        let pk_stat = StageStat::default();
        let pk_search_algorithm: Mutex<Option<SearchAlgorithm>> = Mutex::new(None);
        let parts_after_pk = AtomicU64::new(0);
        let marks_after_pk_total = AtomicU64::new(0);
        let cache_stat = StageStat::default();
        let useful_stats: Vec<StageStat> =
            query.skip_indexes.useful.iter().map(|_| StageStat::default()).collect();
        let merged_stats: Vec<StageStat> =
            query.skip_indexes.merged.iter().map(|_| StageStat::default()).collect();

        let process_part = |ranges_in_part: &mut RangesInPart| -> SelectResult<()> {
            status.check()?;
            let part = Arc::clone(&ranges_in_part.part);

            let total_marks = part.granularity.marks_count_without_final() as u64;
            pk_stat.total_parts.fetch_add(1, Ordering::Relaxed);
            pk_stat.total_granules.fetch_add(total_marks, Ordering::Relaxed);
            let pk_started = Instant::now();

            ranges_in_part.ranges = mark_ranges_from_key_range(
                &part,
                key_condition,
                &query.offset_conditions,
                ranges_in_part.part_starting_offset_in_query,
                &self.settings,
                if query.find_exact_ranges {
                    Some(&mut ranges_in_part.exact_ranges)
                } else {
                    None
                },
            )?;
            pk_stat.elapsed_us.fetch_add(pk_started.elapsed().as_micros() as u64, Ordering::Relaxed);

            if let Some(algorithm) = ranges_in_part.ranges.search_algorithm {
                *pk_search_algorithm.lock() = Some(algorithm);
            }
            let marks_after = ranges_in_part.ranges.total_marks() as u64;
            pk_stat.granules_dropped.fetch_add(total_marks - marks_after, Ordering::Relaxed);
            marks_after_pk_total.fetch_add(marks_after, Ordering::Relaxed);
            if ranges_in_part.ranges.is_empty() {
                pk_stat.parts_dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                parts_after_pk.fetch_add(1, Ordering::Relaxed);
            }

            if let Some((cache, condition_hash)) = cache_inputs {
                if !ranges_in_part.ranges.is_empty() {
                    cache_stat.total_parts.fetch_add(1, Ordering::Relaxed);
                    cache_stat
                        .total_granules
                        .fetch_add(ranges_in_part.ranges.total_marks() as u64, Ordering::Relaxed);
                    if let Some(bitmap) = cache.read(&part.name, condition_hash) {
                        let min_marks_for_seek =
                            self.settings.min_marks_for_seek(&part.granularity_info);
                        let filtered = filter_ranges_with_cached_marks(
                            &ranges_in_part.ranges,
                            &bitmap,
                            min_marks_for_seek,
                        );
                        cache_stat
                            .granules_dropped
                            .fetch_add(filtered.granules_dropped, Ordering::Relaxed);
                        let algorithm = ranges_in_part.ranges.search_algorithm;
                        ranges_in_part.ranges = filtered.ranges;
                        ranges_in_part.ranges.search_algorithm = algorithm;
                        if ranges_in_part.ranges.is_empty() {
                            cache_stat.parts_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }

            if use_skip_indexes {
                for (position, entry) in query.skip_indexes.useful.iter().enumerate() {
                    if ranges_in_part.ranges.is_empty() {
                        break;
                    }
                    let stat = &useful_stats[position];
                    let started = Instant::now();
                    let marks_before = ranges_in_part.ranges.total_marks() as u64;
                    stat.total_parts.fetch_add(1, Ordering::Relaxed);
                    stat.total_granules.fetch_add(marks_before, Ordering::Relaxed);

                    let input = std::mem::take(&mut ranges_in_part.ranges);
                    let result = filter_marks_by_index(
                        &part,
                        &entry.index,
                        entry.condition.as_ref(),
                        self.index_store.as_ref(),
                        &self.mutations,
                        input,
                        &self.settings,
                    )?;
                    stat.granules_dropped.fetch_add(
                        marks_before - result.ranges.total_marks() as u64,
                        Ordering::Relaxed,
                    );
                    if result.ranges.is_empty() {
                        stat.parts_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    stat.elapsed_us
                        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                    if result.vector_hits.is_some() {
                        ranges_in_part.read_hints = result.vector_hits;
                    }
                    ranges_in_part.ranges = result.ranges;
                }

                for (position, filter) in query.skip_indexes.merged.iter().enumerate() {
                    if ranges_in_part.ranges.is_empty() {
                        break;
                    }
                    let stat = &merged_stats[position];
                    let started = Instant::now();
                    let marks_before = ranges_in_part.ranges.total_marks() as u64;
                    stat.total_parts.fetch_add(1, Ordering::Relaxed);
                    stat.total_granules.fetch_add(marks_before, Ordering::Relaxed);

                    let input = std::mem::take(&mut ranges_in_part.ranges);
                    let result = filter_marks_by_merged_index(
                        &part,
                        filter,
                        self.index_store.as_ref(),
                        &self.mutations,
                        input,
                        &self.settings,
                    )?;
                    stat.granules_dropped.fetch_add(
                        marks_before - result.ranges.total_marks() as u64,
                        Ordering::Relaxed,
                    );
                    if result.ranges.is_empty() {
                        stat.parts_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    stat.elapsed_us
                        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                    ranges_in_part.ranges = result.ranges;
                }
            }

            // Later stages only shrink `ranges`; exact ranges must stay a
            // subset of what is actually read.
            if query.find_exact_ranges && !ranges_in_part.exact_ranges.is_empty() {
                ranges_in_part.exact_ranges =
                    intersect_ranges(&ranges_in_part.exact_ranges, &ranges_in_part.ranges);
            }
            Ok(())
        };

        let mut num_threads = query.num_streams.min(parts_with_ranges.len());
        if self.settings.max_threads_for_indexes != 0 {
            num_threads = num_threads.min(self.settings.max_threads_for_indexes);
        }

        if num_threads <= 1 {
            for ranges_in_part in parts_with_ranges.iter_mut() {
                process_part(ranges_in_part)?;
            }
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .thread_name(|i| format!("marktree-index-{i}"))
                .build()
                .map_err(|e| {
                    SelectError::ResourceLimit(format!(
                        "cannot start {} index threads: {}",
                        num_threads, e
                    ))
                })?;
            pool.install(|| parts_with_ranges.par_iter_mut().try_for_each(&process_part))?;
        }

        parts_with_ranges.retain(|p| !p.ranges.is_empty());

        let pk = pk_stat.snapshot();
        debug!(
            threads = num_threads,
            granules_kept = pk.total_granules - pk.granules_dropped,
            granules_total = pk.total_granules,
            elapsed_us = pk.elapsed_us,
            "primary key filtering finished"
        );
        index_stats.push(IndexStat {
            index_type: IndexType::PrimaryKey,
            name: String::new(),
            description: String::new(),
            condition: key_condition.to_string(),
            used_keys: key_condition.used_key_columns(),
            num_parts_before: pk.total_parts,
            num_parts_after: parts_after_pk.load(Ordering::Relaxed),
            num_granules_before: pk.total_granules,
            num_granules_after: marks_after_pk_total.load(Ordering::Relaxed),
            search_algorithm: *pk_search_algorithm.lock(),
            elapsed_us: pk.elapsed_us,
        });

        if cache_inputs.is_some() {
            let cache = cache_stat.snapshot();
            debug!(
                granules_dropped = cache.granules_dropped,
                granules_total = cache.total_granules,
                "query condition cache filtering finished"
            );
        }

        if use_skip_indexes {
            for (position, entry) in query.skip_indexes.useful.iter().enumerate() {
                let stat = useful_stats[position].snapshot();
                debug!(
                    index = %entry.index.name,
                    granules_dropped = stat.granules_dropped,
                    granules_total = stat.total_granules,
                    "skip index filtering finished"
                );
                index_stats.push(IndexStat {
                    index_type: IndexType::Skip,
                    name: entry.index.name.clone(),
                    description: format!("GRANULARITY {}", entry.index.granularity),
                    condition: String::new(),
                    used_keys: Vec::new(),
                    num_parts_before: stat.total_parts,
                    num_parts_after: stat.total_parts - stat.parts_dropped,
                    num_granules_before: stat.total_granules,
                    num_granules_after: stat.total_granules - stat.granules_dropped,
                    search_algorithm: None,
                    elapsed_us: stat.elapsed_us,
                });
            }
            for (position, filter) in query.skip_indexes.merged.iter().enumerate() {
                let stat = merged_stats[position].snapshot();
                let granularity =
                    filter.indexes.first().map(|index| index.granularity).unwrap_or(1);
                index_stats.push(IndexStat {
                    index_type: IndexType::Skip,
                    name: "Merged".to_string(),
                    description: format!("MERGED GRANULARITY {}", granularity),
                    condition: String::new(),
                    used_keys: Vec::new(),
                    num_parts_before: stat.total_parts,
                    num_parts_after: stat.total_parts - stat.parts_dropped,
                    num_granules_before: stat.total_granules,
                    num_granules_after: stat.total_granules - stat.granules_dropped,
                    search_algorithm: None,
                    elapsed_us: stat.elapsed_us,
                });
            }
        }

        Ok(parts_with_ranges)
    }

    fn check_partition_limit(&self, parts_with_ranges: &[RangesInPart]) -> SelectResult<()> {
        let Some(max_partitions) = self.settings.max_partitions_to_read else {
            return Ok(());
        };
        let partitions: BTreeSet<&str> = parts_with_ranges
            .iter()
            .map(|p| p.part.partition_id.as_str())
            .collect();
        if partitions.len() > max_partitions {
            return Err(SelectError::ResourceLimit(format!(
                "query touches {} partitions, max_partitions_to_read is {}",
                partitions.len(),
                max_partitions
            )));
        }
        Ok(())
    }

    /// Register the query under the concurrency gate when it is big enough
    /// to matter. Small queries and queries without an id pass freely.
    fn hold_query_slot(
        &self,
        query_id: &str,
        selected_marks: u64,
    ) -> SelectResult<Option<QueryIdHolder>> {
        let max_queries = self.settings.max_concurrent_queries;
        let min_marks = self.settings.min_marks_to_honor_max_concurrent_queries;
        if max_queries == 0 || min_marks == 0 || query_id.is_empty() {
            return Ok(None);
        }
        if selected_marks < min_marks as u64 {
            return Ok(None);
        }
        self.query_registry.try_register(query_id, max_queries)
    }
}

/// Clip `ranges` to the parts of it that fall inside `kept`. Both inputs are
/// sorted and non-overlapping, and so is the result.
fn intersect_ranges(ranges: &MarkRanges, kept: &MarkRanges) -> MarkRanges {
    let mut result = MarkRanges::new();
    for range in ranges.iter() {
        for other in kept.iter() {
            let begin = range.begin.max(other.begin);
            let end = range.end.min(other.end);
            if begin < end {
                result.ranges.push(MarkRange::new(begin, end));
            }
        }
    }
    result
}

// ===== Row estimate =====

/// Rows the query would read with sampling off: an unrestricted mark-range
/// pass over every part. Used to turn absolute `SAMPLE n` row counts into a
/// fraction of the readable data.
pub fn approximate_total_rows(
    parts: &[Arc<Part>],
    key_condition: &KeyCondition,
    settings: &SelectSettings,
) -> SelectResult<u64> {
    let offset_conditions = OffsetConditions::default();
    let mut total = 0u64;
    for part in parts {
        let ranges =
            mark_ranges_from_key_range(part, key_condition, &offset_conditions, 0, settings, None)?;
        total += part.granularity.rows_in_ranges(&ranges);
    }
    Ok(total)
}

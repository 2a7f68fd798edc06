//! Data-skipping index filtering.
//!
//! A skipping index summarizes blocks of `granularity` consecutive data
//! granules into one index granule. Filtering walks the index granules
//! covering the candidate mark ranges, asks the index condition whether each
//! block may contain matching rows, and keeps only the covered data marks.
//! The verdict is one-sided: an index may keep a block with no matches, but
//! must never drop a block that has one.
//!
//! A part without the index artifact, or with indexed columns touched by an
//! unfinished mutation, passes through unfiltered.

use crate::error::{SelectError, SelectResult};
use crate::mark_range::{MarkRange, MarkRanges};
use crate::part::Part;
use crate::settings::SelectSettings;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Index descriptors and seams
// ============================================================================

/// Descriptor of one skipping index: its identity, the columns it
/// summarizes and how many data granules one index granule covers.
#[derive(Debug, Clone)]
pub struct SkipIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub granularity: usize,
}

impl SkipIndex {
    pub fn new(name: impl Into<String>, columns: Vec<String>, granularity: usize) -> Self {
        SkipIndex { name: name.into(), columns, granularity: granularity.max(1) }
    }

    /// Number of index granules a fully materialized artifact holds for
    /// `part`. The final stub mark carries no rows and is not summarized.
    pub fn index_granules_count(&self, part: &Part) -> usize {
        part.granularity.marks_count_without_final().div_ceil(self.granularity)
    }
}

/// Summary of one block of data granules. Conditions downcast to the
/// concrete granule type they were built for.
pub trait IndexGranule: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// The per-index predicate: decides whether a summarized block may contain
/// matching rows.
pub trait IndexCondition: Send + Sync {
    /// True when the predicate can never exclude a block; filtering with
    /// such a condition is a no-op and is skipped upfront.
    fn always_unknown(&self) -> bool;

    fn may_be_true_on_granule(&self, granule: &dyn IndexGranule) -> SelectResult<bool>;

    /// Whether `possible_granules` is implemented natively; bulk filtering
    /// hands the whole granule set to the condition in one call.
    fn supports_bulk_filtering(&self) -> bool {
        false
    }

    /// Positions (ascending) of the granules that may contain matches.
    fn possible_granules(&self, granules: &[Arc<dyn IndexGranule>]) -> SelectResult<Vec<usize>> {
        let mut possible = Vec::new();
        for (position, granule) in granules.iter().enumerate() {
            if self.may_be_true_on_granule(granule.as_ref())? {
                possible.push(position);
            }
        }
        Ok(possible)
    }

    /// Vector-search conditions rank rows instead of excluding blocks; they
    /// answer through `nearest_rows` over the whole part.
    fn is_vector_search(&self) -> bool {
        false
    }

    fn nearest_rows(&self, _granules: &[Arc<dyn IndexGranule>]) -> SelectResult<VectorSearchHits> {
        Err(SelectError::Internal(
            "nearest_rows called on a non-vector index condition".to_string(),
        ))
    }
}

/// Predicate spanning several indexes at once; receives the granules of all
/// constituent indexes for one block, in declaration order.
pub trait MergedIndexCondition: Send + Sync {
    fn may_be_true_on_granules(&self, granules: &[Arc<dyn IndexGranule>]) -> SelectResult<bool>;
}

/// One skipping index paired with the condition derived from the query
/// predicate.
pub struct SkipIndexWithCondition {
    pub index: SkipIndex,
    pub condition: Arc<dyn IndexCondition>,
}

/// Several equal-granularity indexes filtered through one combined
/// condition.
pub struct MergedIndexFilter {
    pub indexes: Vec<SkipIndex>,
    pub condition: Arc<dyn MergedIndexCondition>,
}

/// The skip indexes that can serve one query: stand-alone indexes first,
/// then merged composites. Both lists may be empty.
#[derive(Default)]
pub struct UsefulSkipIndexes {
    pub useful: Vec<SkipIndexWithCondition>,
    pub merged: Vec<MergedIndexFilter>,
}

impl UsefulSkipIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.useful.is_empty() && self.merged.is_empty()
    }
}

/// Part-local row numbers of the nearest neighbors found by a vector
/// index, ascending. Carried through to readers as row-level hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorSearchHits {
    pub rows: Vec<u64>,
}

/// Random-access view over the granules of one index artifact.
pub struct IndexGranuleStream {
    part_name: String,
    index_name: String,
    granules: Arc<Vec<Arc<dyn IndexGranule>>>,
}

impl IndexGranuleStream {
    pub fn new(
        part_name: impl Into<String>,
        index_name: impl Into<String>,
        granules: Arc<Vec<Arc<dyn IndexGranule>>>,
    ) -> Self {
        IndexGranuleStream { part_name: part_name.into(), index_name: index_name.into(), granules }
    }

    pub fn len(&self) -> usize {
        self.granules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granules.is_empty()
    }

    pub fn read(&self, index_mark: usize) -> SelectResult<Arc<dyn IndexGranule>> {
        self.granules.get(index_mark).cloned().ok_or_else(|| {
            SelectError::Consistency(format!(
                "index {} of part {} has {} granules but granule {} was requested",
                self.index_name,
                self.part_name,
                self.granules.len(),
                index_mark
            ))
        })
    }

    pub fn all(&self) -> &[Arc<dyn IndexGranule>] {
        &self.granules
    }
}

/// Source of materialized index artifacts. `open` returns `None` when the
/// part carries no artifact for the index.
pub trait IndexStore: Send + Sync {
    fn open(&self, part: &Part, index: &SkipIndex) -> Option<IndexGranuleStream>;
}

/// Columns with unfinished mutations, per part. An index over such a column
/// summarizes data the mutation is about to rewrite and cannot be trusted.
#[derive(Debug, Clone, Default)]
pub struct MutationsSnapshot {
    updated_columns: HashMap<String, HashSet<String>>,
}

impl MutationsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update(&mut self, part_name: impl Into<String>, columns: &[&str]) {
        let entry = self.updated_columns.entry(part_name.into()).or_default();
        for column in columns {
            entry.insert((*column).to_string());
        }
    }

    pub fn has_pending_update(&self, part_name: &str, columns: &[String]) -> bool {
        match self.updated_columns.get(part_name) {
            Some(updated) => columns.iter().any(|c| updated.contains(c)),
            None => false,
        }
    }
}

// ============================================================================
// Filtering
// ============================================================================

/// Outcome of filtering one part through one index.
#[derive(Debug, Clone)]
pub struct IndexFilterResult {
    pub ranges: MarkRanges,
    pub granules_checked: u64,
    pub granules_dropped: u64,
    /// Set by vector indexes only.
    pub vector_hits: Option<VectorSearchHits>,
}

impl IndexFilterResult {
    fn passthrough(ranges: MarkRanges) -> Self {
        IndexFilterResult { ranges, granules_checked: 0, granules_dropped: 0, vector_hits: None }
    }
}

/// Index granules covering the data marks of `range`.
fn index_range_for(range: &MarkRange, granularity: usize) -> MarkRange {
    MarkRange::new(range.begin / granularity, range.end.div_ceil(granularity))
}

/// Data marks of index granule `index_mark`, clipped to `range`.
fn data_range_for(range: &MarkRange, index_mark: usize, granularity: usize) -> MarkRange {
    MarkRange::new(
        range.begin.max(index_mark * granularity),
        range.end.min((index_mark + 1) * granularity),
    )
}

/// Filter the candidate ranges of `part` through one skipping index.
/// Returns the input unchanged when the artifact is missing or stale.
pub fn filter_marks_by_index(
    part: &Part,
    index: &SkipIndex,
    condition: &dyn IndexCondition,
    store: &dyn IndexStore,
    mutations: &MutationsSnapshot,
    ranges: MarkRanges,
    settings: &SelectSettings,
) -> SelectResult<IndexFilterResult> {
    if ranges.is_empty() {
        return Ok(IndexFilterResult::passthrough(ranges));
    }
    if mutations.has_pending_update(&part.name, &index.columns) {
        debug!(
            "index {} is stale for part {}: an unfinished mutation updates indexed columns",
            index.name, part.name
        );
        return Ok(IndexFilterResult::passthrough(ranges));
    }
    let Some(stream) = store.open(part, index) else {
        debug!("part {} has no artifact for index {}, skipping it", part.name, index.name);
        return Ok(IndexFilterResult::passthrough(ranges));
    };

    if condition.is_vector_search() {
        return filter_marks_by_vector_index(part, index, condition, &stream, ranges);
    }
    if settings.secondary_indices_enable_bulk_filtering && condition.supports_bulk_filtering() {
        return filter_marks_bulk(part, index, condition, &stream, ranges, settings);
    }

    let min_marks_for_seek = settings.min_marks_for_seek(&part.granularity_info);
    let mut res = MarkRanges::new();
    res.search_algorithm = ranges.search_algorithm;

    let mut checked = 0u64;
    let mut dropped = 0u64;
    let mut current: Option<(usize, Arc<dyn IndexGranule>)> = None;

    for range in &ranges {
        let index_range = index_range_for(range, index.granularity);
        for index_mark in index_range.begin..index_range.end {
            // Adjacent data ranges can share a boundary index granule;
            // reuse it instead of reading again.
            let granule = match &current {
                Some((mark, granule)) if *mark == index_mark => granule.clone(),
                _ => {
                    let granule = stream.read(index_mark)?;
                    current = Some((index_mark, granule.clone()));
                    granule
                }
            };
            checked += 1;

            if !condition.may_be_true_on_granule(granule.as_ref())? {
                dropped += 1;
                continue;
            }
            res.append_or_merge(data_range_for(range, index_mark, index.granularity), min_marks_for_seek);
        }
    }

    debug!(
        "index {} dropped {}/{} granules of part {}",
        index.name, dropped, checked, part.name
    );
    Ok(IndexFilterResult { ranges: res, granules_checked: checked, granules_dropped: dropped, vector_hits: None })
}

/// Bulk variant: collects every index granule the ranges touch, asks the
/// condition once, then rebuilds the clipped data ranges from the kept
/// positions.
fn filter_marks_bulk(
    part: &Part,
    index: &SkipIndex,
    condition: &dyn IndexCondition,
    stream: &IndexGranuleStream,
    ranges: MarkRanges,
    settings: &SelectSettings,
) -> SelectResult<IndexFilterResult> {
    let mut index_marks: Vec<usize> = Vec::new();
    for range in &ranges {
        let index_range = index_range_for(range, index.granularity);
        for index_mark in index_range.begin..index_range.end {
            if index_marks.last() != Some(&index_mark) {
                index_marks.push(index_mark);
            }
        }
    }

    let mut granules: Vec<Arc<dyn IndexGranule>> = Vec::with_capacity(index_marks.len());
    for &index_mark in &index_marks {
        granules.push(stream.read(index_mark)?);
    }

    let possible = condition.possible_granules(&granules)?;
    let kept: HashSet<usize> = possible.iter().map(|&position| index_marks[position]).collect();

    let min_marks_for_seek = settings.min_marks_for_seek(&part.granularity_info);
    let mut res = MarkRanges::new();
    res.search_algorithm = ranges.search_algorithm;
    for range in &ranges {
        let index_range = index_range_for(range, index.granularity);
        for index_mark in index_range.begin..index_range.end {
            if kept.contains(&index_mark) {
                res.append_or_merge(data_range_for(range, index_mark, index.granularity), min_marks_for_seek);
            }
        }
    }

    let checked = index_marks.len() as u64;
    let dropped = checked - kept.len() as u64;
    debug!(
        "index {} dropped {}/{} granules of part {} in bulk mode",
        index.name, dropped, checked, part.name
    );
    Ok(IndexFilterResult { ranges: res, granules_checked: checked, granules_dropped: dropped, vector_hits: None })
}

/// Vector-search variant: ranks rows over the whole part and keeps the
/// single-mark ranges containing the winners. Runs only when the previous
/// stages kept the part in full; a partial candidate set would change the
/// meaning of "nearest over the part".
fn filter_marks_by_vector_index(
    part: &Part,
    index: &SkipIndex,
    condition: &dyn IndexCondition,
    stream: &IndexGranuleStream,
    ranges: MarkRanges,
) -> SelectResult<IndexFilterResult> {
    if part.granularity.rows_in_ranges(&ranges) != part.rows_count() {
        debug!(
            "vector index {} skipped for part {}: earlier stages pruned the part to {} ranges",
            index.name,
            part.name,
            ranges.len()
        );
        return Ok(IndexFilterResult::passthrough(ranges));
    }
    if stream.len() < index.index_granules_count(part) {
        debug!(
            "vector index {} skipped for part {}: artifact holds {} of {} granules",
            index.name,
            part.name,
            stream.len(),
            index.index_granules_count(part)
        );
        return Ok(IndexFilterResult::passthrough(ranges));
    }

    let hits = condition.nearest_rows(stream.all())?;
    let total_rows = part.rows_count();

    let mut res = MarkRanges::new();
    res.search_algorithm = ranges.search_algorithm;
    let mut granules_with_hits = 0u64;
    let mut last_index_mark: Option<usize> = None;
    let mut previous_row: Option<u64> = None;

    for &row in &hits.rows {
        if row >= total_rows {
            return Err(SelectError::Consistency(format!(
                "vector index {} returned row {} but part {} has {} rows",
                index.name, row, part.name, total_rows
            )));
        }
        if previous_row.is_some_and(|prev| row <= prev) {
            return Err(SelectError::Consistency(format!(
                "vector index {} returned rows out of order for part {}",
                index.name, part.name
            )));
        }
        previous_row = Some(row);

        let mark = part.granularity.mark_containing_row(row);
        let data_range = MarkRange::new(mark, mark + 1);
        if res.ranges.last().map(|r| r.end) == Some(data_range.end) {
            continue;
        }
        let index_mark = mark / index.granularity;
        if last_index_mark != Some(index_mark) {
            granules_with_hits += 1;
            last_index_mark = Some(index_mark);
        }
        res.ranges.push(data_range);
    }

    let checked = stream.len() as u64;
    debug!(
        "vector index {} kept {} marks in {} granules of part {}",
        index.name,
        res.len(),
        granules_with_hits,
        part.name
    );
    Ok(IndexFilterResult {
        ranges: res,
        granules_checked: checked,
        granules_dropped: checked.saturating_sub(granules_with_hits),
        vector_hits: Some(hits),
    })
}

/// Filter through several indexes sharing one combined condition. All
/// constituent artifacts must be present; if any is missing the whole
/// filter is skipped.
pub fn filter_marks_by_merged_index(
    part: &Part,
    filter: &MergedIndexFilter,
    store: &dyn IndexStore,
    mutations: &MutationsSnapshot,
    ranges: MarkRanges,
    settings: &SelectSettings,
) -> SelectResult<IndexFilterResult> {
    if ranges.is_empty() || filter.indexes.is_empty() {
        return Ok(IndexFilterResult::passthrough(ranges));
    }
    let granularity = filter.indexes[0].granularity;
    for index in &filter.indexes[1..] {
        if index.granularity != granularity {
            return Err(SelectError::Internal(format!(
                "merged index filter mixes granularities {} and {}",
                granularity, index.granularity
            )));
        }
    }
    for index in &filter.indexes {
        if mutations.has_pending_update(&part.name, &index.columns) {
            debug!(
                "merged index filter skipped for part {}: index {} is stale",
                part.name, index.name
            );
            return Ok(IndexFilterResult::passthrough(ranges));
        }
    }

    let mut streams = Vec::with_capacity(filter.indexes.len());
    for index in &filter.indexes {
        match store.open(part, index) {
            Some(stream) => streams.push(stream),
            None => {
                debug!(
                    "merged index filter skipped: part {} has no artifact for index {}",
                    part.name, index.name
                );
                return Ok(IndexFilterResult::passthrough(ranges));
            }
        }
    }

    let min_marks_for_seek = settings.min_marks_for_seek(&part.granularity_info);
    let mut res = MarkRanges::new();
    res.search_algorithm = ranges.search_algorithm;

    let mut checked = 0u64;
    let mut dropped = 0u64;
    let mut last_index_mark: Option<usize> = None;
    let mut granules: Vec<Arc<dyn IndexGranule>> = Vec::new();

    for range in &ranges {
        let index_range = index_range_for(range, granularity);
        for index_mark in index_range.begin..index_range.end {
            if last_index_mark != Some(index_mark) {
                granules.clear();
                for stream in &streams {
                    granules.push(stream.read(index_mark)?);
                }
            }
            last_index_mark = Some(index_mark);
            checked += 1;

            if !filter.condition.may_be_true_on_granules(&granules)? {
                dropped += 1;
                continue;
            }
            res.append_or_merge(data_range_for(range, index_mark, granularity), min_marks_for_seek);
        }
    }

    debug!(
        "merged filter over {} indexes dropped {}/{} granule groups of part {}",
        filter.indexes.len(),
        dropped,
        checked,
        part.name
    );
    Ok(IndexFilterResult { ranges: res, granules_checked: checked, granules_dropped: dropped, vector_hits: None })
}

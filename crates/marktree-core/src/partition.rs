//! Partition-level part selection: the cheap per-part filters that run once
//! per query before any mark is touched. Parts fall out on the name
//! allow-list, emptiness, block-number ceilings, the minmax hyperrectangle
//! check and the partition-key pruner; a UUID-aware variant additionally
//! deduplicates parts across cooperating replica executions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::condition::KeyCondition;
use crate::error::{SelectError, SelectResult};
use crate::key::ValueRange;
use crate::part::Part;

// ===== Stage counters =====

/// Parts and granules surviving each selection stage. Shared across worker
/// threads, hence atomic; relaxed ordering is enough for counting.
#[derive(Debug, Default)]
pub struct PartFilterCounters {
    pub num_initial_selected_parts: AtomicU64,
    pub num_initial_selected_granules: AtomicU64,
    pub num_parts_after_minmax: AtomicU64,
    pub num_granules_after_minmax: AtomicU64,
    pub num_parts_after_partition_pruner: AtomicU64,
    pub num_granules_after_partition_pruner: AtomicU64,
}

impl PartFilterCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.num_initial_selected_parts.store(0, Ordering::Relaxed);
        self.num_initial_selected_granules.store(0, Ordering::Relaxed);
        self.num_parts_after_minmax.store(0, Ordering::Relaxed);
        self.num_granules_after_minmax.store(0, Ordering::Relaxed);
        self.num_parts_after_partition_pruner.store(0, Ordering::Relaxed);
        self.num_granules_after_partition_pruner.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PartFilterSnapshot {
        PartFilterSnapshot {
            num_initial_selected_parts: self.num_initial_selected_parts.load(Ordering::Relaxed),
            num_initial_selected_granules: self
                .num_initial_selected_granules
                .load(Ordering::Relaxed),
            num_parts_after_minmax: self.num_parts_after_minmax.load(Ordering::Relaxed),
            num_granules_after_minmax: self.num_granules_after_minmax.load(Ordering::Relaxed),
            num_parts_after_partition_pruner: self
                .num_parts_after_partition_pruner
                .load(Ordering::Relaxed),
            num_granules_after_partition_pruner: self
                .num_granules_after_partition_pruner
                .load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`PartFilterCounters`] for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartFilterSnapshot {
    pub num_initial_selected_parts: u64,
    pub num_initial_selected_granules: u64,
    pub num_parts_after_minmax: u64,
    pub num_granules_after_minmax: u64,
    pub num_parts_after_partition_pruner: u64,
    pub num_granules_after_partition_pruner: u64,
}

// ===== Partition pruner =====

/// Evaluates the query predicate against a part's partition key tuple. All
/// rows of a part share one partition value, so the check is a point
/// hyperrectangle.
#[derive(Debug, Clone)]
pub struct PartitionPruner {
    condition: KeyCondition,
    useless: bool,
}

impl PartitionPruner {
    pub fn new(condition: KeyCondition) -> Self {
        let useless = condition.always_unknown_or_true();
        PartitionPruner { condition, useless }
    }

    /// The condition can never exclude any partition value.
    pub fn useless(&self) -> bool {
        self.useless
    }

    pub fn condition(&self) -> &KeyCondition {
        &self.condition
    }

    pub fn can_be_pruned(&self, part: &Part) -> bool {
        if self.useless || part.partition_value.is_empty() {
            return false;
        }
        let point: Vec<ValueRange> =
            part.partition_value.iter().cloned().map(ValueRange::point).collect();
        !self.condition.check_in_hyperrectangle(&point).can_be_true
    }
}

// ===== UUID deduplication state =====

/// Query-scoped set of part UUIDs already claimed by some execution of this
/// query. Shared between cooperating executions; claiming an already-present
/// UUID reports it back as a duplicate.
#[derive(Debug, Default)]
pub struct PinnedPartUuids {
    uuids: Mutex<HashSet<Uuid>>,
}

impl PinnedPartUuids {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every UUID, returning the ones that were already present.
    pub fn claim(&self, uuids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
        let mut guard = self.uuids.lock();
        uuids.into_iter().filter(|uuid| !guard.insert(*uuid)).collect()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.uuids.lock().contains(uuid)
    }
}

/// Part UUIDs this query must skip; populated when a claim collides.
#[derive(Debug, Default)]
pub struct IgnoredPartUuids {
    uuids: Mutex<HashSet<Uuid>>,
}

impl IgnoredPartUuids {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, uuids: impl IntoIterator<Item = Uuid>) {
        self.uuids.lock().extend(uuids);
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.uuids.lock().contains(uuid)
    }
}

// ===== Part selection =====

struct SelectionStages<'a> {
    part_values: Option<&'a HashSet<String>>,
    max_block_numbers_to_read: Option<&'a HashMap<String, i64>>,
    minmax_condition: Option<&'a KeyCondition>,
    partition_pruner: Option<&'a PartitionPruner>,
}

impl SelectionStages<'_> {
    /// Run the counter-free stages: allow-list, emptiness, block ceiling.
    fn passes_cheap_stages(&self, part: &Part) -> bool {
        if let Some(values) = self.part_values {
            if !values.contains(&part.name) {
                return false;
            }
        }
        if part.rows_count() == 0 {
            return false;
        }
        if let Some(limits) = self.max_block_numbers_to_read {
            match limits.get(&part.partition_id) {
                Some(limit) if part.max_block <= *limit => {}
                _ => return false,
            }
        }
        true
    }

    /// Run the counted stages, updating `counters` as the part survives each.
    fn passes_counted_stages(&self, part: &Part, counters: &PartFilterCounters) -> bool {
        let num_granules = part.granularity.marks_count_without_final() as u64;

        counters.num_initial_selected_parts.fetch_add(1, Ordering::Relaxed);
        counters.num_initial_selected_granules.fetch_add(num_granules, Ordering::Relaxed);

        if let (Some(condition), Some(minmax)) = (self.minmax_condition, part.minmax.as_ref()) {
            if !condition.check_in_hyperrectangle(minmax).can_be_true {
                return false;
            }
        }
        counters.num_parts_after_minmax.fetch_add(1, Ordering::Relaxed);
        counters.num_granules_after_minmax.fetch_add(num_granules, Ordering::Relaxed);

        if let Some(pruner) = self.partition_pruner {
            if pruner.can_be_pruned(part) {
                return false;
            }
        }
        counters.num_parts_after_partition_pruner.fetch_add(1, Ordering::Relaxed);
        counters.num_granules_after_partition_pruner.fetch_add(num_granules, Ordering::Relaxed);
        true
    }
}

/// Select the parts a query must consider, cheapest filters first.
pub fn select_parts_to_read(
    parts: &[Arc<Part>],
    part_values: Option<&HashSet<String>>,
    max_block_numbers_to_read: Option<&HashMap<String, i64>>,
    minmax_condition: Option<&KeyCondition>,
    partition_pruner: Option<&PartitionPruner>,
    counters: &PartFilterCounters,
) -> Vec<Arc<Part>> {
    let stages =
        SelectionStages { part_values, max_block_numbers_to_read, minmax_condition, partition_pruner };
    parts
        .iter()
        .filter(|part| {
            stages.passes_cheap_stages(part) && stages.passes_counted_stages(part, counters)
        })
        .cloned()
        .collect()
}

/// Whether one selection pass ended cleanly or collided on claimed UUIDs.
enum SelectionPass {
    Done(Vec<Arc<Part>>),
    NeedsRetry,
}

fn select_parts_pass(
    parts: &[Arc<Part>],
    stages: &SelectionStages<'_>,
    pinned_uuids: &PinnedPartUuids,
    ignored_uuids: &IgnoredPartUuids,
    counters: &PartFilterCounters,
) -> SelectResult<SelectionPass> {
    let mut selected = Vec::new();
    let mut claimed_this_pass = HashSet::new();

    for part in parts {
        if !stages.passes_cheap_stages(part) {
            continue;
        }
        if let Some(uuid) = &part.uuid {
            if ignored_uuids.contains(uuid) {
                debug!(part = %part.name, %uuid, "part skipped: uuid is in the ignored set");
                continue;
            }
        }
        if !stages.passes_counted_stages(part, counters) {
            continue;
        }
        if let Some(uuid) = part.uuid {
            if !claimed_this_pass.insert(uuid) {
                return Err(SelectError::Internal(format!(
                    "two parts share uuid {} on the same replica",
                    uuid
                )));
            }
        }
        selected.push(Arc::clone(part));
    }

    if !claimed_this_pass.is_empty() {
        let duplicates = pinned_uuids.claim(claimed_this_pass);
        if !duplicates.is_empty() {
            ignored_uuids.add(duplicates);
            return Ok(SelectionPass::NeedsRetry);
        }
    }
    Ok(SelectionPass::Done(selected))
}

/// Same stages as [`select_parts_to_read`] plus UUID deduplication against
/// other executions of this query: every selected part's UUID is claimed in
/// the shared pinned set, and a collision moves the colliding UUIDs into the
/// ignored set and retries the selection exactly once.
pub fn select_parts_to_read_with_uuid_filter(
    parts: &[Arc<Part>],
    part_values: Option<&HashSet<String>>,
    max_block_numbers_to_read: Option<&HashMap<String, i64>>,
    minmax_condition: Option<&KeyCondition>,
    partition_pruner: Option<&PartitionPruner>,
    pinned_uuids: &PinnedPartUuids,
    ignored_uuids: &IgnoredPartUuids,
    counters: &PartFilterCounters,
) -> SelectResult<Vec<Arc<Part>>> {
    let stages =
        SelectionStages { part_values, max_block_numbers_to_read, minmax_condition, partition_pruner };

    match select_parts_pass(parts, &stages, pinned_uuids, ignored_uuids, counters)? {
        SelectionPass::Done(selected) => Ok(selected),
        SelectionPass::NeedsRetry => {
            debug!("found duplicate part uuids locally, retrying selection without them");
            counters.reset();
            match select_parts_pass(parts, &stages, pinned_uuids, ignored_uuids, counters)? {
                SelectionPass::Done(selected) => Ok(selected),
                SelectionPass::NeedsRetry => Err(SelectError::Consistency(
                    "found duplicate part uuids while processing the query".into(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionNode;
    use crate::key::KeyValue;
    use crate::part::IndexGranularity;

    fn part(name: &str, partition_id: &str, rows: u64) -> Arc<Part> {
        Arc::new(Part::new(name, partition_id, IndexGranularity::fixed(10, rows, false)))
    }

    fn partition_part(name: &str, partition_id: &str, value: i64) -> Arc<Part> {
        Arc::new(
            Part::new(name, partition_id, IndexGranularity::fixed(10, 100, false))
                .with_partition_value(vec![KeyValue::Int64(value)]),
        )
    }

    #[test]
    fn test_allow_list_and_empty_parts() {
        let parts = vec![part("a_1", "a", 100), part("b_1", "b", 100), part("c_1", "c", 0)];
        let allow: HashSet<String> = ["a_1".to_string(), "c_1".to_string()].into();
        let counters = PartFilterCounters::new();
        let selected = select_parts_to_read(&parts, Some(&allow), None, None, None, &counters);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "a_1");
        let snap = counters.snapshot();
        assert_eq!(snap.num_initial_selected_parts, 1);
        assert_eq!(snap.num_initial_selected_granules, 10);
    }

    #[test]
    fn test_max_block_ceiling() {
        let parts = vec![
            Arc::new(
                Part::new("a_1", "a", IndexGranularity::fixed(10, 100, false)).with_max_block(4),
            ),
            Arc::new(
                Part::new("a_2", "a", IndexGranularity::fixed(10, 100, false)).with_max_block(9),
            ),
            Arc::new(
                Part::new("b_1", "b", IndexGranularity::fixed(10, 100, false)).with_max_block(1),
            ),
        ];
        // Partition "b" is absent from the map, so its parts are dropped.
        let limits: HashMap<String, i64> = [("a".to_string(), 5i64)].into();
        let counters = PartFilterCounters::new();
        let selected = select_parts_to_read(&parts, None, Some(&limits), None, None, &counters);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "a_1");
    }

    #[test]
    fn test_minmax_and_pruner_stages_update_counters() {
        let in_range = Arc::new(
            Part::new("a_1", "a", IndexGranularity::fixed(10, 100, false))
                .with_minmax(vec![ValueRange::new(
                    KeyValue::Int64(0),
                    true,
                    KeyValue::Int64(50),
                    true,
                )])
                .with_partition_value(vec![KeyValue::Int64(1)]),
        );
        let out_of_range = Arc::new(
            Part::new("a_2", "a", IndexGranularity::fixed(10, 100, false))
                .with_minmax(vec![ValueRange::new(
                    KeyValue::Int64(200),
                    true,
                    KeyValue::Int64(300),
                    true,
                )])
                .with_partition_value(vec![KeyValue::Int64(1)]),
        );
        let wrong_partition = Arc::new(
            Part::new("b_1", "b", IndexGranularity::fixed(10, 100, false))
                .with_minmax(vec![ValueRange::new(
                    KeyValue::Int64(0),
                    true,
                    KeyValue::Int64(50),
                    true,
                )])
                .with_partition_value(vec![KeyValue::Int64(2)]),
        );
        let parts = vec![in_range, out_of_range, wrong_partition];

        // Rows with value <= 100 in partition 1.
        let minmax = KeyCondition::new(ConditionNode::le(0, KeyValue::Int64(100)), 1);
        let pruner =
            PartitionPruner::new(KeyCondition::new(ConditionNode::eq(0, KeyValue::Int64(1)), 1));
        assert!(!pruner.useless());

        let counters = PartFilterCounters::new();
        let selected =
            select_parts_to_read(&parts, None, None, Some(&minmax), Some(&pruner), &counters);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "a_1");

        let snap = counters.snapshot();
        assert_eq!(snap.num_initial_selected_parts, 3);
        assert_eq!(snap.num_parts_after_minmax, 2);
        assert_eq!(snap.num_parts_after_partition_pruner, 1);
        assert_eq!(snap.num_granules_after_partition_pruner, 10);
    }

    #[test]
    fn test_useless_pruner_never_prunes() {
        let pruner = PartitionPruner::new(KeyCondition::always_true(1));
        assert!(pruner.useless());
        assert!(!pruner.can_be_pruned(&partition_part("a_1", "a", 7)));
    }

    #[test]
    fn test_uuid_dedup_retry_skips_claimed_parts() {
        let uuid_a = Uuid::new_v4();
        let uuid_b = Uuid::new_v4();
        let parts = vec![
            Arc::new(
                Part::new("a_1", "a", IndexGranularity::fixed(10, 100, false)).with_uuid(uuid_a),
            ),
            Arc::new(
                Part::new("a_2", "a", IndexGranularity::fixed(10, 100, false)).with_uuid(uuid_b),
            ),
        ];

        let pinned = PinnedPartUuids::new();
        // Another execution of the same query already claimed part a_1.
        assert!(pinned.claim([uuid_a]).is_empty());

        let ignored = IgnoredPartUuids::new();
        let counters = PartFilterCounters::new();
        let selected = select_parts_to_read_with_uuid_filter(
            &parts, None, None, None, None, &pinned, &ignored, &counters,
        )
        .unwrap();

        // The collision on a_1 triggered one retry that excluded it.
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "a_2");
        assert!(ignored.contains(&uuid_a));
        assert!(pinned.contains(&uuid_b));
        assert_eq!(counters.snapshot().num_initial_selected_parts, 1);
    }

    #[test]
    fn test_uuid_claim_returns_duplicates() {
        let pinned = PinnedPartUuids::new();
        let uuid = Uuid::new_v4();
        assert!(pinned.claim([uuid]).is_empty());
        assert_eq!(pinned.claim([uuid, Uuid::new_v4()]), vec![uuid]);
    }

    #[test]
    fn test_same_uuid_twice_in_one_pass_is_internal_error() {
        let uuid = Uuid::new_v4();
        let parts = vec![
            Arc::new(
                Part::new("a_1", "a", IndexGranularity::fixed(10, 100, false)).with_uuid(uuid),
            ),
            Arc::new(
                Part::new("a_2", "a", IndexGranularity::fixed(10, 100, false)).with_uuid(uuid),
            ),
        ];
        let pinned = PinnedPartUuids::new();
        let ignored = IgnoredPartUuids::new();
        let counters = PartFilterCounters::new();
        let err = select_parts_to_read_with_uuid_filter(
            &parts, None, None, None, None, &pinned, &ignored, &counters,
        )
        .unwrap_err();
        assert!(matches!(err, SelectError::Internal(_)));
    }
}

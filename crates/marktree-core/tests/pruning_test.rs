use std::sync::Arc;

use marktree_core::{
    BloomGranuleBuilder, BloomIndexCondition, ConditionNode, DistanceMetric, IgnoredPartUuids,
    InMemoryIndexStore, IndexGranularity, IndexGranularityInfo, IndexGranule, IndexStat,
    IndexType, KeyCondition, KeyValue, MarkBitmap, MarkRange, MarkRanges, MinMaxGranule,
    MinMaxIndexCondition, MutationsSnapshot, OffsetConditions, ParallelReplicas, Part,
    PartitionPruner, PinnedPartUuids, PrimaryIndex, QueryConditionCache, QueryStatus, Ratio,
    SampleRequest, SamplingKey, SearchAlgorithm, SelectExecutor, SelectQuery, SelectSettings,
    SkipIndex, SkipIndexWithCondition, UsefulSkipIndexes, VectorGranule, VectorIndexCondition,
};
use uuid::Uuid;

/// A part whose single key column ascends by one per row: mark `m` starts at
/// key `m * rows_per_mark`.
fn ascending_part(name: &str, marks: usize, rows_per_mark: u64) -> Arc<Part> {
    let total_rows = marks as u64 * rows_per_mark;
    let index: Vec<KeyValue> = (0..=marks as u64)
        .map(|m| KeyValue::UInt64((m * rows_per_mark).min(total_rows.saturating_sub(1))))
        .collect();
    Arc::new(
        Part::new(name, "all", IndexGranularity::fixed(rows_per_mark, total_rows, true))
            .with_primary_index(PrimaryIndex::new(vec![index])),
    )
}

/// 16 marks of 8 rows whose key column steps by 2^28, covering the whole
/// unsigned 32-bit space. The natural shape for sampling tests.
fn u32_spanning_part(name: &str) -> Arc<Part> {
    let index: Vec<KeyValue> = (0..16u64).map(|m| KeyValue::UInt64(m << 28)).collect();
    Arc::new(
        Part::new(name, "all", IndexGranularity::fixed(8, 128, false))
            .with_primary_index(PrimaryIndex::new(vec![index])),
    )
}

fn ge(value: u64) -> KeyCondition {
    KeyCondition::new(ConditionNode::ge(0, KeyValue::UInt64(value)), 1)
}

fn analyze(
    executor: &SelectExecutor,
    parts: &[Arc<Part>],
    query: &SelectQuery,
) -> marktree_core::AnalysisResult {
    executor.analyze(parts, query, &QueryStatus::unlimited()).unwrap()
}

fn stat_row(result: &marktree_core::AnalysisResult, index_type: IndexType) -> &IndexStat {
    result
        .index_stats
        .iter()
        .find(|stat| stat.index_type == index_type)
        .unwrap_or_else(|| panic!("no {index_type:?} row in the stats"))
}

fn assert_sorted_disjoint(ranges: &MarkRanges) {
    for range in ranges.iter() {
        assert!(range.begin < range.end, "empty range {range:?} in output");
    }
    for pair in ranges.ranges.windows(2) {
        assert!(pair[0].end <= pair[1].begin, "overlap between {:?} and {:?}", pair[0], pair[1]);
    }
}

#[test]
fn test_pruning_only_narrows_and_stays_sorted() {
    let parts = vec![
        ascending_part("p0", 100, 10),
        ascending_part("p1", 100, 10),
        ascending_part("p2", 100, 10),
    ];
    let executor = SelectExecutor::new(SelectSettings::default());
    let result = analyze(&executor, &parts, &SelectQuery::new(ge(450)));

    let mut total_marks = 0u64;
    for part in &result.parts_with_ranges {
        assert_sorted_disjoint(&part.ranges);
        let last_mark = part.part.granularity.marks_count_without_final();
        for range in part.ranges.iter() {
            assert!(range.end <= last_mark);
        }
        // Key 450 lands on the boundary of mark 45; the preceding mark
        // touches the cut and stays.
        assert_eq!(part.ranges.ranges, vec![MarkRange::new(44, 100)]);
        total_marks += part.ranges.total_marks() as u64;
    }
    assert_eq!(result.selected_marks, total_marks);
    assert_eq!(stat_row(&result, IndexType::PrimaryKey).num_granules_after, total_marks);
}

#[test]
fn test_monotonic_and_wrapped_conditions_select_identical_marks() {
    let parts = vec![ascending_part("p", 1000, 10)];
    let executor = SelectExecutor::new(SelectSettings::default());

    let monotonic = SelectQuery::new(ge(5005));
    // Same predicate wrapped so it no longer reads as one continuous key
    // interval; the search must fall back without changing the result.
    let wrapped = SelectQuery::new(KeyCondition::new(
        ConditionNode::ge(0, KeyValue::UInt64(5005)).or(ConditionNode::AlwaysFalse),
        1,
    ));

    let a = analyze(&executor, &parts, &monotonic);
    let b = analyze(&executor, &parts, &wrapped);

    assert_eq!(
        stat_row(&a, IndexType::PrimaryKey).search_algorithm,
        Some(SearchAlgorithm::BinarySearch)
    );
    assert_eq!(
        stat_row(&b, IndexType::PrimaryKey).search_algorithm,
        Some(SearchAlgorithm::GenericExclusionSearch)
    );
    assert_eq!(a.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(500, 1000)]);
    assert_eq!(
        a.parts_with_ranges[0].ranges.ranges,
        b.parts_with_ranges[0].ranges.ranges
    );
}

#[test]
fn test_exact_ranges_are_subsets_of_selected_ranges() {
    let parts = vec![ascending_part("p", 1000, 10)];
    let executor = SelectExecutor::new(SelectSettings::default());
    let query = SelectQuery::new(ge(5000)).with_find_exact_ranges(true);
    let result = analyze(&executor, &parts, &query);

    let part = &result.parts_with_ranges[0];
    // Mark 499 straddles the cut: selected but not exact.
    assert_eq!(part.ranges.ranges, vec![MarkRange::new(499, 1000)]);
    assert_eq!(part.exact_ranges.ranges, vec![MarkRange::new(500, 1000)]);
    assert!(part.exact_ranges.is_subset_of(&part.ranges));
    assert_eq!(result.selected_rows, 501 * 10);
}

#[test]
fn test_skip_index_narrows_only_parts_with_artifacts() {
    let with_artifact = ascending_part("with_idx", 64, 8);
    let without_artifact = ascending_part("without_idx", 64, 8);

    // 16 min/max granules of 4 data marks each; granule i summarizes the
    // value interval [i*100, i*100+99].
    let store = Arc::new(InMemoryIndexStore::new());
    let granules: Vec<Arc<dyn IndexGranule>> = (0..16u64)
        .map(|i| {
            let granule = MinMaxGranule::from_columns(&[vec![
                KeyValue::UInt64(i * 100),
                KeyValue::UInt64(i * 100 + 99),
            ]])
            .unwrap();
            Arc::new(granule) as Arc<dyn IndexGranule>
        })
        .collect();
    store.insert("with_idx", "value_minmax", granules);

    let skip_indexes = UsefulSkipIndexes {
        useful: vec![SkipIndexWithCondition {
            index: SkipIndex::new("value_minmax", vec!["value".into()], 4),
            condition: Arc::new(MinMaxIndexCondition::new(KeyCondition::new(
                ConditionNode::eq(0, KeyValue::UInt64(512)),
                1,
            ))),
        }],
        merged: Vec::new(),
    };

    let executor = SelectExecutor::new(SelectSettings::default()).with_index_store(store);
    let query = SelectQuery::new(KeyCondition::always_true(1)).with_skip_indexes(skip_indexes);
    let result = analyze(&executor, &[with_artifact, without_artifact], &query);

    assert_eq!(result.parts_with_ranges.len(), 2);
    let narrowed = &result.parts_with_ranges[0];
    let untouched = &result.parts_with_ranges[1];
    // Value 512 falls into granule 5, which covers data marks [20, 24).
    assert_eq!(narrowed.ranges.ranges, vec![MarkRange::new(20, 24)]);
    // No artifact: the index cannot filter and the part passes unchanged.
    assert_eq!(untouched.ranges.ranges, vec![MarkRange::new(0, 64)]);

    let skip = stat_row(&result, IndexType::Skip);
    assert_eq!(skip.name, "value_minmax");
    assert_eq!(skip.description, "GRANULARITY 4");
    assert_eq!(skip.num_parts_before, 2);
    assert_eq!(skip.num_granules_before, 128);
    assert_eq!(skip.num_granules_after, 128 - 60);
}

#[test]
fn test_stale_index_passes_through_for_mutated_parts() {
    let part = ascending_part("mutated", 64, 8);
    let store = Arc::new(InMemoryIndexStore::new());
    let granule = MinMaxGranule::from_columns(&[vec![KeyValue::UInt64(0), KeyValue::UInt64(9)]])
        .unwrap();
    store.insert(
        "mutated",
        "value_minmax",
        vec![Arc::new(granule) as Arc<dyn IndexGranule>; 16],
    );

    let mut mutations = MutationsSnapshot::new();
    mutations.record_update("mutated", &["value"]);

    let skip_indexes = UsefulSkipIndexes {
        useful: vec![SkipIndexWithCondition {
            index: SkipIndex::new("value_minmax", vec!["value".into()], 4),
            condition: Arc::new(MinMaxIndexCondition::new(KeyCondition::new(
                ConditionNode::eq(0, KeyValue::UInt64(512)),
                1,
            ))),
        }],
        merged: Vec::new(),
    };

    let executor = SelectExecutor::new(SelectSettings::default())
        .with_index_store(store)
        .with_mutations(mutations);
    let query = SelectQuery::new(KeyCondition::always_true(1)).with_skip_indexes(skip_indexes);
    let result = analyze(&executor, &[part], &query);

    // An unfinished mutation over the indexed column disables the index;
    // nothing may be dropped on its account.
    assert_eq!(result.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(0, 64)]);
}

#[test]
fn test_sample_halves_tile_the_key_space() {
    let parts = vec![u32_spanning_part("s")];
    let executor = SelectExecutor::new(SelectSettings::default());
    let half = Ratio::new(1, 2).unwrap();

    let first_half = SelectQuery::new(KeyCondition::always_true(1))
        .with_sampling(SampleRequest::relative(half), SamplingKey::new(0, 32));
    let second_half = SelectQuery::new(KeyCondition::always_true(1))
        .with_sampling(SampleRequest::new(half, half), SamplingKey::new(0, 32));

    let a = analyze(&executor, &parts, &first_half);
    let b = analyze(&executor, &parts, &second_half);

    assert!(a.sampling.use_sampling && b.sampling.use_sampling);
    assert_eq!(a.sampling.upper, Some(1 << 31));
    assert!(a.sampling.has_upper_limit && !a.sampling.has_lower_limit);
    assert_eq!(b.sampling.lower, Some(1 << 31));
    assert!(b.sampling.has_lower_limit && !b.sampling.has_upper_limit);
    assert_eq!(a.sampling.used_sample_factor, 2.0);
    assert_eq!(b.sampling.used_sample_factor, 2.0);

    // The halves cover the whole part and share only the straddling mark:
    // mark 7 ends exactly on the 2^31 boundary value, which belongs to the
    // second half but touches the first.
    assert_eq!(a.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(0, 8)]);
    assert_eq!(b.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(7, 16)]);
}

#[test]
fn test_replica_split_without_sample_clause_tiles_the_table() {
    let parts = vec![u32_spanning_part("s")];
    let executor = SelectExecutor::new(SelectSettings::default());

    let replica = |index: u64| {
        SelectQuery::new(KeyCondition::always_true(1))
            .with_sampling_key(SamplingKey::new(0, 32))
            .with_parallel_replicas(ParallelReplicas { count: 2, index })
    };
    let r0 = analyze(&executor, &parts, &replica(0));
    let r1 = analyze(&executor, &parts, &replica(1));

    assert_eq!(r0.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(0, 8)]);
    assert_eq!(r1.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(7, 16)]);
    // An implicit full sample split over replicas is not user-visible
    // sampling; aggregates need no scaling.
    assert_eq!(r0.sampling.used_sample_factor, 1.0);
    assert_eq!(r1.sampling.used_sample_factor, 1.0);
}

#[test]
fn test_replica_split_without_sampling_key_reads_once() {
    let parts = vec![ascending_part("p", 10, 10)];
    let executor = SelectExecutor::new(SelectSettings::default());

    let replica = |index: u64| {
        SelectQuery::new(KeyCondition::always_true(1))
            .with_parallel_replicas(ParallelReplicas { count: 3, index })
    };

    // No sampling key to tile over: the first replica reads everything and
    // the others read nothing, so no row is read twice.
    let first = analyze(&executor, &parts, &replica(0));
    assert!(!first.read_nothing);
    assert_eq!(first.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(0, 10)]);

    for index in 1..3 {
        let other = analyze(&executor, &parts, &replica(index));
        assert!(other.read_nothing);
        assert!(other.parts_with_ranges.is_empty());
    }
}

#[test]
fn test_cached_bitmap_intersection_preserves_true_marks() {
    let part = Arc::new(
        Part::new("c", "all", IndexGranularity::fixed(10, 320, false))
            .with_granularity_info(IndexGranularityInfo { fixed_rows_per_mark: 10, bytes_per_mark: 0 })
            .with_primary_index(PrimaryIndex::new(vec![(0..32u64)
                .map(|m| KeyValue::UInt64(m * 10))
                .collect()])),
    );
    let mut marks = vec![false; 32];
    for slot in [0usize, 1, 3, 4] {
        marks[slot] = true;
    }
    let cache = Arc::new(QueryConditionCache::default());
    cache.write("c", 77, Arc::new(MarkBitmap::new(marks.clone())));

    let query = || {
        SelectQuery::new(KeyCondition::always_true(1)).with_where_condition_hash(77)
    };

    // Without seek coalescing the one-mark hole at 2 splits the range.
    let strict = SelectExecutor::new(SelectSettings::default())
        .with_condition_cache(Arc::clone(&cache));
    let result = analyze(&strict, &[Arc::clone(&part)], &query());
    assert_eq!(
        result.parts_with_ranges[0].ranges.ranges,
        vec![MarkRange::new(0, 2), MarkRange::new(3, 5)]
    );

    // A 20-row seek threshold makes the hole cheaper to read through.
    let coalescing = SelectExecutor::new(SelectSettings::default().with_min_rows_for_seek(20))
        .with_condition_cache(cache);
    let result = analyze(&coalescing, &[part], &query());
    assert_eq!(result.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(0, 5)]);

    // Either way every mark the bitmap lets through is still read.
    for (mark, may_match) in marks.iter().enumerate() {
        if *may_match {
            let covered = result.parts_with_ranges[0]
                .ranges
                .iter()
                .any(|r| r.begin <= mark && mark < r.end);
            assert!(covered, "mark {mark} lost");
        }
    }
}

#[test]
fn test_uuid_claims_make_each_part_read_once_across_replicas() {
    let shared_a = Uuid::new_v4();
    let shared_b = Uuid::new_v4();
    let parts = vec![
        Arc::new(
            Part::new("a", "all", IndexGranularity::fixed(10, 100, false))
                .with_uuid(shared_a)
                .with_primary_index(PrimaryIndex::new(vec![(0..10u64)
                    .map(|m| KeyValue::UInt64(m * 10))
                    .collect()])),
        ),
        Arc::new(
            Part::new("b", "all", IndexGranularity::fixed(10, 100, false))
                .with_uuid(shared_b)
                .with_primary_index(PrimaryIndex::new(vec![(0..10u64)
                    .map(|m| KeyValue::UInt64(m * 10))
                    .collect()])),
        ),
        ascending_part("local", 10, 10),
    ];

    let pinned = Arc::new(PinnedPartUuids::new());
    let replica_one = SelectExecutor::new(SelectSettings::default())
        .with_uuid_deduplication(Arc::clone(&pinned), Arc::new(IgnoredPartUuids::new()));
    let replica_two = SelectExecutor::new(SelectSettings::default())
        .with_uuid_deduplication(pinned, Arc::new(IgnoredPartUuids::new()));

    let query = SelectQuery::new(KeyCondition::always_true(1));

    // The first replica claims both UUIDs and reads all three parts.
    let first = analyze(&replica_one, &parts, &query);
    assert_eq!(first.selected_parts, 3);

    // The second replica loses both claims, retries, and reads only the
    // part without a UUID.
    let second = analyze(&replica_two, &parts, &query);
    assert_eq!(second.selected_parts, 1);
    assert_eq!(second.parts_with_ranges[0].part.name, "local");
}

#[test]
fn test_partition_pruner_drops_whole_partitions() {
    let partitioned = |name: &str, partition: &str| {
        Arc::new(
            Part::new(name, partition, IndexGranularity::fixed(10, 100, false))
                .with_partition_value(vec![KeyValue::String(partition.to_string())])
                .with_primary_index(PrimaryIndex::new(vec![(0..10u64)
                    .map(|m| KeyValue::UInt64(m * 10))
                    .collect()])),
        )
    };
    let parts = vec![
        partitioned("a", "2024-03"),
        partitioned("b", "2024-04"),
        partitioned("c", "2024-03"),
    ];

    let pruner = PartitionPruner::new(KeyCondition::new(
        ConditionNode::eq(0, KeyValue::String("2024-03".into())),
        1,
    ));
    let executor = SelectExecutor::new(SelectSettings::default());
    let query = SelectQuery::new(KeyCondition::always_true(1)).with_partition_pruner(pruner);
    let result = analyze(&executor, &parts, &query);

    let names: Vec<&str> =
        result.parts_with_ranges.iter().map(|p| p.part.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);

    let row = stat_row(&result, IndexType::Partition);
    assert_eq!(row.num_parts_before, 3);
    assert_eq!(row.num_parts_after, 2);
    assert!(!row.condition.is_empty());
    assert_eq!(result.part_filter_counters.num_parts_after_partition_pruner, 2);
}

#[test]
fn test_offset_condition_limits_query_row_numbers() {
    let parts = vec![ascending_part("p0", 10, 10), ascending_part("p1", 10, 10)];
    let executor = SelectExecutor::new(SelectSettings::default());

    // Rows 0..150 of the query-wide concatenation: all of the first part,
    // the first five marks of the second.
    let offsets = OffsetConditions {
        part_offset: None,
        total_offset: Some(KeyCondition::new(
            ConditionNode::lt(0, KeyValue::UInt64(150)),
            1,
        )),
    };
    let query =
        SelectQuery::new(KeyCondition::always_true(1)).with_offset_conditions(offsets);
    let result = analyze(&executor, &parts, &query);

    assert_eq!(result.parts_with_ranges[0].ranges.ranges, vec![MarkRange::new(0, 10)]);
    assert_eq!(result.parts_with_ranges[1].ranges.ranges, vec![MarkRange::new(0, 5)]);
    assert_eq!(result.selected_rows, 150);
}

#[test]
fn test_bulk_and_per_granule_bloom_filtering_agree() {
    let part = ascending_part("blooms", 64, 8);

    // 16 bloom granules of 4 data marks each; granule i holds the single
    // value 1000 + i.
    let store = Arc::new(InMemoryIndexStore::new());
    let granules: Vec<Arc<dyn IndexGranule>> = (0..16u64)
        .map(|i| {
            let mut builder = BloomGranuleBuilder::new(16);
            builder.add(&KeyValue::UInt64(1000 + i));
            Arc::new(builder.finish()) as Arc<dyn IndexGranule>
        })
        .collect();
    store.insert("blooms", "value_bloom", granules);

    let skip_indexes = || UsefulSkipIndexes {
        useful: vec![SkipIndexWithCondition {
            index: SkipIndex::new("value_bloom", vec!["value".into()], 4),
            condition: Arc::new(BloomIndexCondition::new(&[KeyValue::UInt64(1005)])),
        }],
        merged: Vec::new(),
    };

    let bulk = SelectExecutor::new(SelectSettings::default())
        .with_index_store(store.clone());
    let per_granule = SelectExecutor::new(SelectSettings::default().with_bulk_filtering(false))
        .with_index_store(store);

    let query = SelectQuery::new(KeyCondition::always_true(1)).with_skip_indexes(skip_indexes());
    let a = analyze(&bulk, &[Arc::clone(&part)], &query);
    let query = SelectQuery::new(KeyCondition::always_true(1)).with_skip_indexes(skip_indexes());
    let b = analyze(&per_granule, &[part], &query);

    // Both modes probe the same filters and must keep the same granules.
    let a_ranges = &a.parts_with_ranges[0].ranges;
    let b_ranges = &b.parts_with_ranges[0].ranges;
    assert_eq!(a_ranges.ranges, b_ranges.ranges);
    // The granule holding 1005 covers data marks [20, 24) and must survive;
    // a bloom filter may only over-select, never under-select.
    assert!(MarkRanges::from_ranges(vec![MarkRange::new(20, 24)]).is_subset_of(a_ranges));
    assert_sorted_disjoint(a_ranges);
}

#[test]
fn test_vector_index_ranks_rows_and_bypasses_the_condition_cache() {
    // 16 marks of 8 rows; 4 vector granules of 32 rows each. Every vector
    // points one way except rows 10 and 100.
    let part = ascending_part("vec", 16, 8);
    let store = Arc::new(InMemoryIndexStore::new());
    let granules: Vec<Arc<dyn IndexGranule>> = (0..4u64)
        .map(|g| {
            let first_row = g * 32;
            let vectors: Vec<Vec<f32>> = (0..32u64)
                .map(|i| match first_row + i {
                    10 => vec![1.0, 0.0],
                    100 => vec![0.9, 0.1],
                    _ => vec![0.0, 1.0],
                })
                .collect();
            Arc::new(VectorGranule { first_row, vectors }) as Arc<dyn IndexGranule>
        })
        .collect();
    store.insert("vec", "embedding", granules);

    // A cached bitmap that would drop everything; the vector search must
    // run over the full part, so the cache stage has to stand down.
    let cache = Arc::new(QueryConditionCache::default());
    cache.write("vec", 5, Arc::new(MarkBitmap::new(vec![false; 16])));

    let skip_indexes = UsefulSkipIndexes {
        useful: vec![SkipIndexWithCondition {
            index: SkipIndex::new("embedding", vec!["embedding".into()], 4),
            condition: Arc::new(VectorIndexCondition::new(
                vec![1.0, 0.0],
                2,
                DistanceMetric::Euclidean,
            )),
        }],
        merged: Vec::new(),
    };

    let executor = SelectExecutor::new(SelectSettings::default())
        .with_index_store(store)
        .with_condition_cache(cache);
    let query = SelectQuery::new(KeyCondition::always_true(1))
        .with_where_condition_hash(5)
        .with_skip_indexes(skip_indexes);
    let result = analyze(&executor, &[part], &query);

    let part = &result.parts_with_ranges[0];
    // Rows 10 and 100 are the two nearest; they live in marks 1 and 12.
    assert_eq!(part.ranges.ranges, vec![MarkRange::new(1, 2), MarkRange::new(12, 13)]);
    let hits = part.read_hints.as_ref().unwrap();
    assert_eq!(hits.rows, vec![10, 100]);
}

pub mod condition;
pub mod condition_cache;
pub mod error;
pub mod executor;
pub mod indexes;
pub mod key;
pub mod mark_range;
pub mod mark_search;
pub mod part;
pub mod partition;
pub mod sampling;
pub mod settings;
pub mod skip_index;

pub use condition::{BoolMask, ConditionNode, KeyCondition, OffsetConditions};
pub use condition_cache::{
    filter_ranges_with_cached_marks, CacheFilterResult, MarkBitmap, QueryConditionCache,
    DEFAULT_CONDITION_CACHE_ENTRIES,
};
pub use error::{SelectError, SelectResult};
pub use executor::{
    approximate_total_rows, AnalysisResult, ConcurrentQueryRegistry, IndexStat, IndexType,
    QueryIdHolder, QueryStatus, SelectExecutor, SelectQuery,
};
pub use indexes::{
    BloomGranule, BloomGranuleBuilder, BloomIndexCondition, DistanceMetric, InMemoryIndexStore,
    MinMaxGranule, MinMaxIndexCondition, VectorGranule, VectorIndexCondition,
};
pub use key::{KeyValue, ValueRange};
pub use mark_range::{MarkRange, MarkRanges, SearchAlgorithm};
pub use mark_search::mark_ranges_from_key_range;
pub use part::{
    IndexGranularity, IndexGranularityInfo, Part, PrimaryIndex, RangesInPart,
    DEFAULT_ROWS_PER_MARK,
};
pub use partition::{
    select_parts_to_read, select_parts_to_read_with_uuid_filter, IgnoredPartUuids,
    PartFilterCounters, PartFilterSnapshot, PartitionPruner, PinnedPartUuids,
};
pub use sampling::{
    build_sampling, ParallelReplicas, Ratio, SampleRequest, SamplingKey, SamplingPlan,
};
pub use settings::{
    min_marks_for_concurrent_read, round_rows_or_bytes_to_marks, SelectSettings,
};
pub use skip_index::{
    filter_marks_by_index, filter_marks_by_merged_index, IndexCondition, IndexFilterResult,
    IndexGranule, IndexGranuleStream, IndexStore, MergedIndexCondition, MergedIndexFilter,
    MutationsSnapshot, SkipIndex, SkipIndexWithCondition, UsefulSkipIndexes, VectorSearchHits,
};

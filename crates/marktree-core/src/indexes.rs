//! Built-in skipping index implementations: min/max summaries, bloom
//! filters over column values and a flat vector-similarity index.

use crate::condition::KeyCondition;
use crate::error::{SelectError, SelectResult};
use crate::key::{KeyValue, ValueRange};
use crate::skip_index::{
    IndexCondition, IndexGranule, IndexGranuleStream, IndexStore, SkipIndex, VectorSearchHits,
};
use bloomfilter::Bloom;
use parking_lot::RwLock;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ============================================================================
// Min/max index
// ============================================================================

/// Per-column value bounds of one block of data granules.
#[derive(Debug, Clone)]
pub struct MinMaxGranule {
    pub ranges: Vec<ValueRange>,
}

impl MinMaxGranule {
    /// Summarize column slices into closed per-column bounds. Columns must
    /// be equal-length and non-empty.
    pub fn from_columns(columns: &[Vec<KeyValue>]) -> SelectResult<Self> {
        let mut ranges = Vec::with_capacity(columns.len());
        for column in columns {
            let Some(first) = column.first() else {
                return Err(SelectError::Internal(
                    "minmax granule built from an empty column slice".to_string(),
                ));
            };
            let mut min = first.clone();
            let mut max = first.clone();
            for value in &column[1..] {
                if value.cmp(&min) == Ordering::Less {
                    min = value.clone();
                }
                if value.cmp(&max) == Ordering::Greater {
                    max = value.clone();
                }
            }
            ranges.push(ValueRange::new(min, true, max, true));
        }
        Ok(MinMaxGranule { ranges })
    }
}

impl IndexGranule for MinMaxGranule {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Evaluates a key condition over the stored bounds; column positions in
/// the condition address the index's column list.
pub struct MinMaxIndexCondition {
    condition: KeyCondition,
}

impl MinMaxIndexCondition {
    pub fn new(condition: KeyCondition) -> Self {
        MinMaxIndexCondition { condition }
    }
}

impl IndexCondition for MinMaxIndexCondition {
    fn always_unknown(&self) -> bool {
        self.condition.always_unknown_or_true()
    }

    fn may_be_true_on_granule(&self, granule: &dyn IndexGranule) -> SelectResult<bool> {
        let granule = granule
            .as_any()
            .downcast_ref::<MinMaxGranule>()
            .ok_or_else(|| SelectError::Internal("minmax condition got a foreign granule".to_string()))?;
        Ok(self.condition.check_in_hyperrectangle(&granule.ranges).can_be_true)
    }
}

// ============================================================================
// Bloom filter index
// ============================================================================

const BLOOM_MIN_ITEMS: usize = 1024;
const BLOOM_MAX_ITEMS: usize = 10_000_000;
const BLOOM_FP_RATE: f64 = 0.01;

/// Map a value onto the u64 probe space of the filter. Unbounded markers
/// have no materialized form and cannot be probed.
fn bloom_probe(value: &KeyValue) -> Option<u64> {
    match value {
        KeyValue::NegInfinity | KeyValue::PosInfinity => None,
        KeyValue::Int64(v) => Some(*v as u64),
        KeyValue::UInt64(v) => Some(*v),
        KeyValue::Float64(v) => Some(v.to_bits()),
        KeyValue::Timestamp(v) => Some(*v as u64),
        KeyValue::String(s) => {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            s.hash(&mut hasher);
            Some(hasher.finish())
        }
    }
}

/// Bloom filter over the values one block of data granules holds in the
/// indexed column.
pub struct BloomGranule {
    bloom: Bloom<u64>,
    items: usize,
}

impl BloomGranule {
    pub fn items(&self) -> usize {
        self.items
    }

    fn might_contain(&self, probe: u64) -> bool {
        self.bloom.check(&probe)
    }

    /// Artifact form; the filter travels between parts as serialized bytes.
    pub fn to_bytes(&self) -> SelectResult<Vec<u8>> {
        bincode::serialize(&self.bloom)
            .map_err(|e| SelectError::Internal(format!("bloom serialize failed: {e}")))
    }

    pub fn from_bytes(data: &[u8], items: usize) -> SelectResult<Self> {
        let bloom = bincode::deserialize(data)
            .map_err(|e| SelectError::Internal(format!("bloom deserialize failed: {e}")))?;
        Ok(BloomGranule { bloom, items })
    }
}

impl IndexGranule for BloomGranule {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct BloomGranuleBuilder {
    bloom: Bloom<u64>,
    items: usize,
}

impl BloomGranuleBuilder {
    pub fn new(estimated_items: usize) -> Self {
        let capacity = estimated_items.clamp(BLOOM_MIN_ITEMS, BLOOM_MAX_ITEMS);
        BloomGranuleBuilder { bloom: Bloom::new_for_fp_rate(capacity, BLOOM_FP_RATE), items: 0 }
    }

    pub fn add(&mut self, value: &KeyValue) {
        if let Some(probe) = bloom_probe(value) {
            self.bloom.set(&probe);
            self.items += 1;
        }
    }

    pub fn finish(self) -> BloomGranule {
        BloomGranule { bloom: self.bloom, items: self.items }
    }
}

/// Keeps blocks whose filter reports any of the sought values as possibly
/// present. Derived from the equality atoms of the query predicate.
pub struct BloomIndexCondition {
    probes: Vec<u64>,
}

impl BloomIndexCondition {
    pub fn new(values: &[KeyValue]) -> Self {
        BloomIndexCondition { probes: values.iter().filter_map(bloom_probe).collect() }
    }

    fn matches(&self, granule: &BloomGranule) -> bool {
        self.probes.iter().any(|probe| granule.might_contain(*probe))
    }
}

impl IndexCondition for BloomIndexCondition {
    /// With nothing to probe for, the filter can never exclude a block.
    fn always_unknown(&self) -> bool {
        self.probes.is_empty()
    }

    fn may_be_true_on_granule(&self, granule: &dyn IndexGranule) -> SelectResult<bool> {
        let granule = granule
            .as_any()
            .downcast_ref::<BloomGranule>()
            .ok_or_else(|| SelectError::Internal("bloom condition got a foreign granule".to_string()))?;
        Ok(self.matches(granule))
    }

    fn supports_bulk_filtering(&self) -> bool {
        true
    }

    fn possible_granules(&self, granules: &[Arc<dyn IndexGranule>]) -> SelectResult<Vec<usize>> {
        let mut possible = Vec::with_capacity(granules.len());
        for (position, granule) in granules.iter().enumerate() {
            let granule = granule
                .as_any()
                .downcast_ref::<BloomGranule>()
                .ok_or_else(|| SelectError::Internal("bloom condition got a foreign granule".to_string()))?;
            if self.matches(granule) {
                possible.push(position);
            }
        }
        Ok(possible)
    }
}

// ============================================================================
// Vector similarity index
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (av, bv) in a.iter().zip(b.iter()) {
        dot += av * bv;
        norm_a += av * av;
        norm_b += bv * bv;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (av, bv) in a.iter().zip(b.iter()) {
        let diff = av - bv;
        sum += diff * diff;
    }
    sum.sqrt()
}

fn compute_distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
        DistanceMetric::Euclidean => euclidean_distance(a, b),
    }
}

/// Row vectors of one block of data granules; `first_row` is the part-local
/// row number of the first stored vector.
pub struct VectorGranule {
    pub first_row: u64,
    pub vectors: Vec<Vec<f32>>,
}

impl IndexGranule for VectorGranule {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ScoredRow {
    row: u64,
    score: f32,
}

impl PartialEq for ScoredRow {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for ScoredRow {}

impl PartialOrd for ScoredRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredRow {
    // Max-heap keyed on distance: popping evicts the current worst, so the
    // heap keeps the k smallest scores.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.partial_cmp(&other.score).unwrap_or(Ordering::Equal)
    }
}

/// Ranks all stored vectors against the query vector and keeps the k
/// nearest rows.
pub struct VectorIndexCondition {
    target: Vec<f32>,
    k: usize,
    metric: DistanceMetric,
}

impl VectorIndexCondition {
    pub fn new(target: Vec<f32>, k: usize, metric: DistanceMetric) -> Self {
        VectorIndexCondition { target, k, metric }
    }
}

impl IndexCondition for VectorIndexCondition {
    fn always_unknown(&self) -> bool {
        false
    }

    fn may_be_true_on_granule(&self, _granule: &dyn IndexGranule) -> SelectResult<bool> {
        Err(SelectError::Internal(
            "vector index condition answers through nearest_rows".to_string(),
        ))
    }

    fn is_vector_search(&self) -> bool {
        true
    }

    fn nearest_rows(&self, granules: &[Arc<dyn IndexGranule>]) -> SelectResult<VectorSearchHits> {
        if self.k == 0 {
            return Ok(VectorSearchHits { rows: Vec::new() });
        }
        let mut heap: BinaryHeap<ScoredRow> = BinaryHeap::with_capacity(self.k + 1);
        for granule in granules {
            let granule = granule
                .as_any()
                .downcast_ref::<VectorGranule>()
                .ok_or_else(|| SelectError::Internal("vector condition got a foreign granule".to_string()))?;
            for (position, vector) in granule.vectors.iter().enumerate() {
                if vector.len() != self.target.len() {
                    return Err(SelectError::Consistency(format!(
                        "stored vector has {} dimensions, query has {}",
                        vector.len(),
                        self.target.len()
                    )));
                }
                let score = compute_distance(&self.target, vector, self.metric);
                heap.push(ScoredRow { row: granule.first_row + position as u64, score });
                if heap.len() > self.k {
                    heap.pop();
                }
            }
        }
        let mut rows: Vec<u64> = heap.into_iter().map(|scored| scored.row).collect();
        rows.sort_unstable();
        Ok(VectorSearchHits { rows })
    }
}

// ============================================================================
// In-memory artifact store
// ============================================================================

/// Granule storage keyed by part and index name. Parts without an entry
/// read as "artifact missing" and pass through the filter unfiltered.
#[derive(Default)]
pub struct InMemoryIndexStore {
    granules: RwLock<HashMap<(String, String), Arc<Vec<Arc<dyn IndexGranule>>>>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        part_name: impl Into<String>,
        index_name: impl Into<String>,
        granules: Vec<Arc<dyn IndexGranule>>,
    ) {
        self.granules
            .write()
            .insert((part_name.into(), index_name.into()), Arc::new(granules));
    }
}

impl IndexStore for InMemoryIndexStore {
    fn open(&self, part: &crate::part::Part, index: &SkipIndex) -> Option<IndexGranuleStream> {
        self.granules
            .read()
            .get(&(part.name.clone(), index.name.clone()))
            .map(|granules| {
                IndexGranuleStream::new(part.name.clone(), index.name.clone(), granules.clone())
            })
    }
}

//! Query condition cache: remembers, per part and per WHERE-condition hash,
//! which marks still contained matching rows when the condition was last
//! evaluated. Later queries with the same condition intersect their candidate
//! ranges with the cached bitmap before any index work.
//!
//! A `false` slot is a proof that the mark holds no matching rows; a `true`
//! slot promises nothing. The intersection therefore only ever removes marks
//! whose slot is `false` and must never lose a `true` mark.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;

use crate::mark_range::{MarkRange, MarkRanges};

pub const DEFAULT_CONDITION_CACHE_ENTRIES: usize = 1024;

/// One slot per mark of a part, final stub included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkBitmap {
    pub marks: Vec<bool>,
}

impl MarkBitmap {
    pub fn new(marks: Vec<bool>) -> Self {
        MarkBitmap { marks }
    }

    /// All-true bitmap: nothing is known to be prunable.
    pub fn all_matching(marks: usize) -> Self {
        MarkBitmap { marks: vec![true; marks] }
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Slots beyond the stored length promise nothing, like a `true` slot.
    fn may_match(&self, mark: usize) -> bool {
        self.marks.get(mark).copied().unwrap_or(true)
    }
}

// ===== Cache =====

type CacheKey = (String, u64);

/// Capacity-bounded `(part name, condition hash) -> mark bitmap` store shared
/// by all queries against a table.
#[derive(Debug)]
pub struct QueryConditionCache {
    entries: RwLock<LruCache<CacheKey, Arc<MarkBitmap>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryConditionCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        QueryConditionCache {
            entries: RwLock::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn read(&self, part_name: &str, condition_hash: u64) -> Option<Arc<MarkBitmap>> {
        let key = (part_name.to_string(), condition_hash);
        let found = self.entries.write().get(&key).cloned();
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Written by the scan that actually evaluated the condition; the pruning
    /// path itself only reads.
    pub fn write(&self, part_name: &str, condition_hash: u64, bitmap: Arc<MarkBitmap>) {
        let key = (part_name.to_string(), condition_hash);
        self.entries.write().put(key, bitmap);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryConditionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CONDITION_CACHE_ENTRIES)
    }
}

// ===== Range intersection =====

#[derive(Debug, Clone)]
pub struct CacheFilterResult {
    pub ranges: MarkRanges,
    pub granules_dropped: u64,
}

/// Intersect candidate ranges with a cached bitmap. Leading and trailing
/// non-matching marks shrink a range; an interior non-matching run longer
/// than `min_marks_for_seek` splits it, shorter runs are kept to spare a
/// seek. A range with no matching marks disappears.
pub fn filter_ranges_with_cached_marks(
    ranges: &MarkRanges,
    bitmap: &MarkBitmap,
    min_marks_for_seek: usize,
) -> CacheFilterResult {
    let mut result = MarkRanges::new();
    let mut granules_dropped = 0u64;

    for range in ranges.iter() {
        let mut begin = range.begin;
        let mut mark_it = range.begin;
        while mark_it < range.end {
            if bitmap.may_match(mark_it) {
                mark_it += 1;
                continue;
            }
            if mark_it == begin {
                granules_dropped += 1;
                begin += 1;
                mark_it += 1;
                continue;
            }
            let mut end = mark_it;
            while end < range.end && !bitmap.may_match(end) {
                end += 1;
            }
            if min_marks_for_seek != 0 && end != range.end && end - mark_it <= min_marks_for_seek
            {
                // Reading through the short run is cheaper than a seek.
                mark_it = end + 1;
            } else {
                granules_dropped += (end - mark_it) as u64;
                result.ranges.push(MarkRange::new(begin, mark_it));
                begin = end;
                if end == range.end {
                    break;
                }
                mark_it = end + 1;
            }
        }
        if begin != range.end {
            result.ranges.push(MarkRange::new(begin, range.end));
        }
    }

    CacheFilterResult { ranges: result, granules_dropped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(slots: &[u8]) -> MarkBitmap {
        MarkBitmap::new(slots.iter().map(|&s| s != 0).collect())
    }

    fn ranges_of(pairs: &[(usize, usize)]) -> MarkRanges {
        MarkRanges::from_ranges(pairs.iter().map(|&(b, e)| MarkRange::new(b, e)).collect())
    }

    fn covered(ranges: &MarkRanges, mark: usize) -> bool {
        ranges.iter().any(|r| r.begin <= mark && mark < r.end)
    }

    #[test]
    fn test_leading_and_trailing_zeros_shrink() {
        let input = ranges_of(&[(0, 10)]);
        let bits = bitmap(&[0, 0, 0, 1, 1, 1, 1, 1, 0, 0]);
        let out = filter_ranges_with_cached_marks(&input, &bits, 0);
        assert_eq!(out.ranges.ranges, vec![MarkRange::new(3, 8)]);
        assert_eq!(out.granules_dropped, 5);
    }

    #[test]
    fn test_short_interior_run_is_absorbed() {
        let input = ranges_of(&[(0, 5)]);
        let bits = bitmap(&[1, 1, 0, 1, 1]);
        let out = filter_ranges_with_cached_marks(&input, &bits, 1);
        assert_eq!(out.ranges.ranges, vec![MarkRange::new(0, 5)]);
        assert_eq!(out.granules_dropped, 0);
    }

    #[test]
    fn test_long_interior_run_splits() {
        let input = ranges_of(&[(0, 5)]);
        let bits = bitmap(&[1, 0, 0, 0, 1]);
        let out = filter_ranges_with_cached_marks(&input, &bits, 1);
        assert_eq!(out.ranges.ranges, vec![MarkRange::new(0, 1), MarkRange::new(4, 5)]);
        assert_eq!(out.granules_dropped, 3);
    }

    #[test]
    fn test_zero_seek_threshold_never_absorbs() {
        let input = ranges_of(&[(0, 5)]);
        let bits = bitmap(&[1, 1, 0, 1, 1]);
        let out = filter_ranges_with_cached_marks(&input, &bits, 0);
        assert_eq!(out.ranges.ranges, vec![MarkRange::new(0, 2), MarkRange::new(3, 5)]);
        assert_eq!(out.granules_dropped, 1);
    }

    #[test]
    fn test_fully_non_matching_range_disappears() {
        let input = ranges_of(&[(2, 6)]);
        let bits = bitmap(&[1, 1, 0, 0, 0, 0, 1]);
        let out = filter_ranges_with_cached_marks(&input, &bits, 8);
        assert!(out.ranges.is_empty());
        assert_eq!(out.granules_dropped, 4);
    }

    #[test]
    fn test_never_loses_a_matching_mark() {
        // Alternating and clustered patterns over several disjoint ranges,
        // with every absorption threshold that changes behavior.
        let slots =
            [1u8, 0, 1, 0, 0, 1, 1, 0, 0, 0, 1, 0, 1, 1, 0, 1, 0, 0, 1, 1, 1, 0, 0, 1, 0, 0, 0, 1];
        let bits = bitmap(&slots);
        let input = ranges_of(&[(0, 9), (11, 20), (22, 28)]);
        for min_marks_for_seek in 0..6 {
            let out = filter_ranges_with_cached_marks(&input, &bits, min_marks_for_seek);
            assert!(out.ranges.is_ascending());
            for range in input.iter() {
                for mark in range.begin..range.end {
                    if slots[mark] != 0 {
                        assert!(
                            covered(&out.ranges, mark),
                            "matching mark {} lost at threshold {}",
                            mark,
                            min_marks_for_seek
                        );
                    }
                }
            }
            // Nothing outside the input may appear either.
            assert!(out.ranges.is_subset_of(&input));
        }
    }

    #[test]
    fn test_bitmap_shorter_than_part_keeps_uncovered_marks() {
        let input = ranges_of(&[(0, 6)]);
        let bits = bitmap(&[0, 1, 0]);
        let out = filter_ranges_with_cached_marks(&input, &bits, 0);
        // Slots beyond the bitmap are treated as matching.
        assert_eq!(out.ranges.ranges, vec![MarkRange::new(1, 2), MarkRange::new(3, 6)]);
    }

    #[test]
    fn test_cache_read_write_and_eviction() {
        let cache = QueryConditionCache::new(2);
        let bitmap_a = Arc::new(MarkBitmap::all_matching(4));
        cache.write("part_a", 1, Arc::clone(&bitmap_a));
        cache.write("part_b", 1, Arc::new(MarkBitmap::all_matching(8)));

        assert_eq!(cache.read("part_a", 1).unwrap().len(), 4);
        assert!(cache.read("part_a", 2).is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);

        // Touch part_a, then insert a third entry: part_b is the oldest.
        cache.read("part_a", 1);
        cache.write("part_c", 1, Arc::new(MarkBitmap::all_matching(2)));
        assert_eq!(cache.len(), 2);
        assert!(cache.read("part_b", 1).is_none());
        assert!(cache.read("part_c", 1).is_some());
    }
}

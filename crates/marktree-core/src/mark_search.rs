//! Primary-key mark-range search.
//!
//! Produces the initial candidate mark ranges for one part from the loaded
//! primary-key index. Binary search runs when every useful condition (key
//! and offset alike) describes a single continuous interval; everything else
//! goes through the generic exclusion search, which degrades gracefully to a
//! per-mark scan in the worst case.

use crate::condition::{BoolMask, KeyCondition, OffsetConditions};
use crate::error::{SelectError, SelectResult};
use crate::key::KeyValue;
use crate::mark_range::{MarkRange, MarkRanges, SearchAlgorithm};
use crate::part::Part;
use crate::settings::SelectSettings;
use tracing::debug;

/// Bound-vector evaluator for one part. Reuses its buffers across probes so
/// a search does not allocate per step.
struct RangeChecker<'a> {
    part: &'a Part,
    key_condition: &'a KeyCondition,
    offset_conditions: &'a OffsetConditions,
    part_starting_offset: u64,
    used_key_size: usize,
    left: Vec<KeyValue>,
    right: Vec<KeyValue>,
}

impl<'a> RangeChecker<'a> {
    fn new(
        part: &'a Part,
        key_condition: &'a KeyCondition,
        offset_conditions: &'a OffsetConditions,
        part_starting_offset: u64,
    ) -> Self {
        let used_key_size = key_condition.key_size();
        RangeChecker {
            part,
            key_condition,
            offset_conditions,
            part_starting_offset,
            used_key_size,
            left: Vec::with_capacity(used_key_size),
            right: Vec::with_capacity(used_key_size),
        }
    }

    /// Key bounds covered by `range`: the value at `range.begin` on the left
    /// and the first value of the mark after the range on the right, taken
    /// as a closed tuple interval. Columns without loaded index values are
    /// unconstrained; a right bound past the stored entries extends to
    /// `+inf`.
    fn fill_bounds(&mut self, range: &MarkRange) {
        self.left.clear();
        self.right.clear();
        let index = self.part.primary_index.as_ref();
        for column in 0..self.used_key_size {
            let left = index
                .and_then(|idx| idx.value_at(column, range.begin))
                .cloned()
                .unwrap_or(KeyValue::NegInfinity);
            let right = index
                .and_then(|idx| idx.value_at(column, range.end))
                .cloned()
                .unwrap_or(KeyValue::PosInfinity);
            self.left.push(left);
            self.right.push(right);
        }
    }

    fn check(&mut self, range: &MarkRange, initial_mask: BoolMask) -> BoolMask {
        self.fill_bounds(range);
        let mut mask =
            self.key_condition
                .check_in_range(self.used_key_size, &self.left, &self.right, initial_mask);
        if initial_mask == BoolMask::CONSIDER_ONLY_CAN_BE_TRUE && !mask.can_be_true {
            return mask;
        }
        if !self.offset_conditions.is_empty() {
            mask = mask.and(self.offset_conditions.check_mark_range(
                &self.part.granularity,
                range,
                self.part_starting_offset,
                initial_mask,
            ));
        }
        mask
    }

    fn may_be_true(&mut self, range: &MarkRange) -> bool {
        self.check(range, BoolMask::CONSIDER_ONLY_CAN_BE_TRUE).can_be_true
    }

    /// A range is exactly matched when the predicate cannot be false on it.
    fn is_exact(&mut self, range: &MarkRange) -> bool {
        !self.check(range, BoolMask::CONSIDER_ONLY_CAN_BE_FALSE).can_be_false
    }
}

fn condition_useful(condition: Option<&KeyCondition>) -> bool {
    condition.map(|c| !c.always_unknown_or_true()).unwrap_or(false)
}

/// Compute the candidate mark ranges of `part` for the given conditions.
/// When `exact_ranges` is supplied, the subset of ranges proven free of
/// false positives is collected into it; for ranges wider than one mark only
/// the two edge marks are probed for a shrink, never the interior.
pub fn mark_ranges_from_key_range(
    part: &Part,
    key_condition: &KeyCondition,
    offset_conditions: &OffsetConditions,
    part_starting_offset: u64,
    settings: &SelectSettings,
    mut exact_ranges: Option<&mut MarkRanges>,
) -> SelectResult<MarkRanges> {
    let marks_count = part.granularity.marks_count();
    if marks_count == 0 {
        return Ok(MarkRanges::new());
    }
    // The final stub mark holds no rows and is excluded from the search
    // space.
    let last_mark = part.granularity.marks_count_without_final();
    if last_mark == 0 {
        return Ok(MarkRanges::new());
    }

    let key_useful = !key_condition.always_unknown_or_true();
    let part_offset_useful = condition_useful(offset_conditions.part_offset.as_ref());
    let total_offset_useful = condition_useful(offset_conditions.total_offset.as_ref());

    if !key_useful && !part_offset_useful && !total_offset_useful {
        return Ok(MarkRanges {
            ranges: vec![MarkRange::new(0, last_mark)],
            search_algorithm: None,
        });
    }

    if let Some(index) = &part.primary_index {
        for column in 0..index.loaded_columns() {
            if index.column_len(column) < last_mark {
                return Err(SelectError::Consistency(format!(
                    "primary index of part {} has {} entries in column {} but {} marks are searchable",
                    part.name,
                    index.column_len(column),
                    column,
                    last_mark
                )));
            }
        }
    }

    let min_marks_for_seek = settings.min_marks_for_seek(&part.granularity_info);
    let mut checker =
        RangeChecker::new(part, key_condition, offset_conditions, part_starting_offset);
    let mut res = MarkRanges::new();

    // Binary search needs every useful condition to describe one continuous
    // interval; a single non-continuous condition sends the whole search down
    // the exclusion path.
    let key_exact_range = !key_useful || key_condition.matches_exact_continuous_range();
    let part_offset_exact_range = !part_offset_useful
        || offset_conditions
            .part_offset
            .as_ref()
            .is_some_and(|c| c.matches_exact_continuous_range());
    let total_offset_exact_range = !total_offset_useful
        || offset_conditions
            .total_offset
            .as_ref()
            .is_some_and(|c| c.matches_exact_continuous_range());
    let use_binary_search = key_exact_range && part_offset_exact_range && total_offset_exact_range;

    if use_binary_search {
        res.search_algorithm = Some(SearchAlgorithm::BinarySearch);
        let mut steps = 0usize;

        // Left boundary: keep "[0, searched_left) cannot match" while
        // halving towards the first plausible mark.
        let mut searched_left = 0usize;
        let mut searched_right = last_mark;
        while searched_left + 1 < searched_right {
            let middle = (searched_left + searched_right) / 2;
            if checker.may_be_true(&MarkRange::new(0, middle)) {
                searched_right = middle;
            } else {
                searched_left = middle;
            }
            steps += 1;
        }
        let begin = searched_left;

        // Right boundary, symmetrically over "[middle, last_mark)".
        let mut searched_right = last_mark;
        while searched_left + 1 < searched_right {
            let middle = (searched_left + searched_right) / 2;
            if checker.may_be_true(&MarkRange::new(middle, last_mark)) {
                searched_left = middle;
            } else {
                searched_right = middle;
            }
            steps += 1;
        }
        let end = searched_right;

        let result_range = MarkRange::new(begin, end);
        if !result_range.is_empty() && checker.may_be_true(&result_range) {
            res.ranges.push(result_range);
        }

        if let Some(exact) = exact_ranges.as_deref_mut() {
            collect_exact_ranges(&mut checker, &res, exact);
        }

        debug!(
            "binary search over part {} found {} range in {} steps",
            part.name,
            if res.is_empty() { "no" } else { "a continuous" },
            steps
        );
    } else {
        res.search_algorithm = Some(SearchAlgorithm::GenericExclusionSearch);
        let steps_to_split = settings.merge_tree_coarse_index_granularity;
        if steps_to_split <= 1 {
            return Err(SelectError::Configuration(format!(
                "merge_tree_coarse_index_granularity must be greater than 1, got {steps_to_split}"
            )));
        }

        let mut steps = 0usize;
        let mut ranges_stack = vec![MarkRange::new(0, last_mark)];
        while let Some(range) = ranges_stack.pop() {
            steps += 1;

            if !checker.may_be_true(&range) {
                continue;
            }

            if range.len() == 1 {
                res.append_or_merge(range, min_marks_for_seek);
                if let Some(exact) = exact_ranges.as_deref_mut() {
                    if checker.is_exact(&range) {
                        // Exact ranges merge only when contiguous; bridging
                        // a gap would claim unprobed marks exact.
                        exact.append_or_merge(range, 0);
                    }
                }
            } else {
                // Split into up to `steps_to_split` pieces, pushed right to
                // left so the leftmost is processed first.
                let step = (range.len() - 1) / steps_to_split + 1;
                let mut end = range.end;
                while end > range.begin + step {
                    ranges_stack.push(MarkRange::new(end - step, end));
                    end -= step;
                }
                ranges_stack.push(MarkRange::new(range.begin, end));
            }
        }

        debug!(
            "generic exclusion search over part {} selected {} ranges in {} steps",
            part.name,
            res.len(),
            steps
        );
    }

    Ok(res)
}

/// Exact-range extraction for binary-search results: one-mark ranges are
/// tested directly; wider ranges shrink by probing only their two edge
/// marks. A continuous predicate cannot be false on interior marks once both
/// edges hold, so the interior is never probed.
fn collect_exact_ranges(checker: &mut RangeChecker<'_>, res: &MarkRanges, exact: &mut MarkRanges) {
    for range in &res.ranges {
        if range.len() == 1 {
            if checker.is_exact(range) {
                exact.append_or_merge(*range, 0);
            }
            continue;
        }
        let first = MarkRange::new(range.begin, range.begin + 1);
        let last = MarkRange::new(range.end - 1, range.end);
        let begin = if checker.is_exact(&first) { range.begin } else { range.begin + 1 };
        let end = if checker.is_exact(&last) { range.end } else { range.end - 1 };
        if begin < end {
            exact.append_or_merge(MarkRange::new(begin, end), 0);
        }
    }
}

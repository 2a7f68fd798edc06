//! Three-valued range logic over a multi-column sort key.
//!
//! A `KeyCondition` holds a structured predicate over key column indices and
//! answers "can this predicate be true / be false somewhere within a given
//! region of key space". Regions arrive either as a hyperrectangle (one
//! `ValueRange` per column) or as a lexicographic tuple interval taken from
//! two index marks; tuple intervals are decomposed into hyperrectangles
//! internally. Evaluation is pure: no side effects, no I/O.

use crate::key::{KeyValue, ValueRange};
use crate::mark_range::MarkRange;
use crate::part::IndexGranularity;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

// ============================================================================
// BoolMask
// ============================================================================

/// Three-valued answer: whether a predicate can evaluate to true and whether
/// it can evaluate to false somewhere in the tested region. Both flags may be
/// overestimated; underestimating either is a correctness bug (a lost match
/// or a false exactness claim).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolMask {
    pub can_be_true: bool,
    pub can_be_false: bool,
}

impl BoolMask {
    /// Accumulation seed: nothing observed yet.
    pub const NONE: BoolMask = BoolMask { can_be_true: false, can_be_false: false };

    /// Interest mask: caller needs both sides decided.
    pub const FULL: BoolMask = BoolMask { can_be_true: true, can_be_false: true };

    /// Interest mask: caller only needs `can_be_true`. Evaluation may stop
    /// as soon as some sub-region can match.
    pub const CONSIDER_ONLY_CAN_BE_TRUE: BoolMask =
        BoolMask { can_be_true: true, can_be_false: false };

    /// Interest mask: caller only needs `can_be_false` (exact-range probes).
    pub const CONSIDER_ONLY_CAN_BE_FALSE: BoolMask =
        BoolMask { can_be_true: false, can_be_false: true };

    /// Predicate conjunction over the same region.
    pub fn and(self, other: BoolMask) -> BoolMask {
        BoolMask {
            can_be_true: self.can_be_true && other.can_be_true,
            can_be_false: self.can_be_false || other.can_be_false,
        }
    }

    /// Predicate disjunction over the same region.
    pub fn or(self, other: BoolMask) -> BoolMask {
        BoolMask {
            can_be_true: self.can_be_true || other.can_be_true,
            can_be_false: self.can_be_false && other.can_be_false,
        }
    }

    pub fn negate(self) -> BoolMask {
        BoolMask { can_be_true: self.can_be_false, can_be_false: self.can_be_true }
    }

    /// Union of disjoint sub-regions of the tested region: either flag holds
    /// for the union when it holds for any piece.
    pub fn combine(self, other: BoolMask) -> BoolMask {
        BoolMask {
            can_be_true: self.can_be_true || other.can_be_true,
            can_be_false: self.can_be_false || other.can_be_false,
        }
    }

    /// True once every side named by the interest mask has been observed;
    /// further disjoint sub-regions cannot change the caller's answer.
    pub fn is_complete_for(self, interest: BoolMask) -> bool {
        (!interest.can_be_true || self.can_be_true)
            && (!interest.can_be_false || self.can_be_false)
    }
}

// ============================================================================
// Condition tree
// ============================================================================

/// Structured predicate over key column indices.
///
/// `Unknown` stands for any sub-predicate range analysis cannot decide (for
/// example `key % 2 = 0`): it can be true and can be false in every region,
/// which drives the search strategies toward their degrade-to-scan paths.
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum ConditionNode {
    Atom { key_column: usize, range: ValueRange },
    Unknown,
    AlwaysTrue,
    AlwaysFalse,
    And(Box<ConditionNode>, Box<ConditionNode>),
    Or(Box<ConditionNode>, Box<ConditionNode>),
    Not(Box<ConditionNode>),
}

impl ConditionNode {
    pub fn atom(key_column: usize, range: ValueRange) -> ConditionNode {
        ConditionNode::Atom { key_column, range }
    }

    pub fn eq(key_column: usize, value: KeyValue) -> ConditionNode {
        ConditionNode::atom(key_column, ValueRange::point(value))
    }

    pub fn ge(key_column: usize, value: KeyValue) -> ConditionNode {
        ConditionNode::atom(key_column, ValueRange::left_bounded(value, true))
    }

    pub fn gt(key_column: usize, value: KeyValue) -> ConditionNode {
        ConditionNode::atom(key_column, ValueRange::left_bounded(value, false))
    }

    pub fn le(key_column: usize, value: KeyValue) -> ConditionNode {
        ConditionNode::atom(key_column, ValueRange::right_bounded(value, true))
    }

    pub fn lt(key_column: usize, value: KeyValue) -> ConditionNode {
        ConditionNode::atom(key_column, ValueRange::right_bounded(value, false))
    }

    pub fn and(self, other: ConditionNode) -> ConditionNode {
        ConditionNode::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: ConditionNode) -> ConditionNode {
        ConditionNode::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> ConditionNode {
        ConditionNode::Not(Box::new(self))
    }

    fn eval(&self, hyperrectangle: &[ValueRange]) -> BoolMask {
        match self {
            ConditionNode::Atom { key_column, range } => match hyperrectangle.get(*key_column) {
                Some(col) => BoolMask {
                    can_be_true: col.intersects(range),
                    can_be_false: !range.contains_range(col),
                },
                // Column outside the evaluated prefix: unconstrained.
                None => BoolMask::FULL,
            },
            ConditionNode::Unknown => BoolMask::FULL,
            ConditionNode::AlwaysTrue => BoolMask { can_be_true: true, can_be_false: false },
            ConditionNode::AlwaysFalse => BoolMask { can_be_true: false, can_be_false: true },
            ConditionNode::And(a, b) => a.eval(hyperrectangle).and(b.eval(hyperrectangle)),
            ConditionNode::Or(a, b) => a.eval(hyperrectangle).or(b.eval(hyperrectangle)),
            ConditionNode::Not(a) => a.eval(hyperrectangle).negate(),
        }
    }

    /// Whether this node can ever report `can_be_true == false` for some
    /// region. A condition with no such capability gains nothing from any
    /// search.
    fn can_constrain(&self) -> bool {
        match self {
            ConditionNode::Atom { .. } | ConditionNode::AlwaysFalse => true,
            ConditionNode::Unknown | ConditionNode::AlwaysTrue => false,
            ConditionNode::And(a, b) => a.can_constrain() || b.can_constrain(),
            ConditionNode::Or(a, b) => a.can_constrain() && b.can_constrain(),
            ConditionNode::Not(a) => a.can_constrain(),
        }
    }

    /// Collect `(column, range)` atoms under AND-only composition. Any other
    /// combinator makes the shape non-continuous.
    fn collect_and_atoms<'a>(&'a self, out: &mut Vec<(usize, &'a ValueRange)>) -> bool {
        match self {
            ConditionNode::And(a, b) => a.collect_and_atoms(out) && b.collect_and_atoms(out),
            ConditionNode::Atom { key_column, range } => {
                out.push((*key_column, range));
                true
            }
            ConditionNode::AlwaysTrue => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionNode::Atom { key_column, range } => write!(f, "k{key_column} in {range}"),
            ConditionNode::Unknown => write!(f, "unknown"),
            ConditionNode::AlwaysTrue => write!(f, "true"),
            ConditionNode::AlwaysFalse => write!(f, "false"),
            ConditionNode::And(a, b) => write!(f, "({a} and {b})"),
            ConditionNode::Or(a, b) => write!(f, "({a} or {b})"),
            ConditionNode::Not(a) => write!(f, "(not {a})"),
        }
    }
}

// ============================================================================
// KeyCondition
// ============================================================================

/// Per-column constraint strength used by the continuous-range shape test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Constraint {
    Point,
    Range,
    Unconstrained,
}

/// A predicate over a fixed-width sort key, built once per query and shared
/// read-only across parts. Also used for partition keys, minmax columns and
/// single-column virtual offset keys.
#[derive(Debug, Clone)]
pub struct KeyCondition {
    root: ConditionNode,
    key_size: usize,
}

impl KeyCondition {
    pub fn new(root: ConditionNode, key_size: usize) -> Self {
        KeyCondition { root, key_size }
    }

    /// A condition that constrains nothing.
    pub fn always_true(key_size: usize) -> Self {
        KeyCondition { root: ConditionNode::AlwaysTrue, key_size }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn root(&self) -> &ConditionNode {
        &self.root
    }

    /// True when no region can ever be excluded; searching is pointless.
    pub fn always_unknown_or_true(&self) -> bool {
        !self.root.can_constrain()
    }

    /// True when the predicate describes a single continuous interval of the
    /// key space: AND-only composition whose per-column constraints form a
    /// `Point* [Range] Unconstrained*` prefix shape. Enables binary search.
    pub fn matches_exact_continuous_range(&self) -> bool {
        let mut atoms = Vec::new();
        if !self.root.collect_and_atoms(&mut atoms) {
            return false;
        }
        let mut constraints = vec![Constraint::Unconstrained; self.key_size];
        for (column, range) in atoms {
            if column >= self.key_size {
                return false;
            }
            let strength = if range.is_point() { Constraint::Point } else { Constraint::Range };
            // Several atoms on one column: the strongest shape wins.
            if strength < constraints[column] {
                constraints[column] = strength;
            }
        }
        let mut seen_range = false;
        let mut seen_unconstrained = false;
        for c in &constraints {
            match c {
                Constraint::Point => {
                    if seen_range || seen_unconstrained {
                        return false;
                    }
                }
                Constraint::Range => {
                    if seen_range || seen_unconstrained {
                        return false;
                    }
                    seen_range = true;
                }
                Constraint::Unconstrained => seen_unconstrained = true,
            }
        }
        true
    }

    /// Evaluate against one hyperrectangle (a `ValueRange` per key column;
    /// shorter slices leave the tail columns unconstrained).
    pub fn check_in_hyperrectangle(&self, hyperrectangle: &[ValueRange]) -> BoolMask {
        self.root.eval(hyperrectangle)
    }

    /// Evaluate against the lexicographic tuple interval `[left, right]`
    /// over the first `used_key_size` columns. `initial_mask` declares which
    /// sides the caller needs; decomposition stops early once they are
    /// decided.
    pub fn check_in_range(
        &self,
        used_key_size: usize,
        left: &[KeyValue],
        right: &[KeyValue],
        initial_mask: BoolMask,
    ) -> BoolMask {
        let mut hyperrectangle = vec![ValueRange::whole_universe(); used_key_size];
        for_any_hyperrectangle(
            used_key_size,
            left,
            right,
            true,
            true,
            &mut hyperrectangle,
            0,
            initial_mask,
            &mut |h| self.root.eval(h),
        )
    }

    /// AND an extra single-column interval into the condition (sampling-key
    /// restriction). Returns false when the column is not addressable.
    pub fn add_condition(&mut self, key_column: usize, range: ValueRange) -> bool {
        if key_column >= self.key_size {
            return false;
        }
        let current = std::mem::replace(&mut self.root, ConditionNode::AlwaysTrue);
        self.root = current.and(ConditionNode::atom(key_column, range));
        true
    }

    /// Stable hash of the predicate structure; the condition-cache key.
    pub fn condition_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.key_size.hash(&mut hasher);
        self.root.hash(&mut hasher);
        hasher.finish()
    }

    /// Distinct key columns referenced by the condition's atoms, ascending.
    pub fn used_key_columns(&self) -> Vec<usize> {
        fn walk(node: &ConditionNode, out: &mut BTreeSet<usize>) {
            match node {
                ConditionNode::Atom { key_column, .. } => {
                    out.insert(*key_column);
                }
                ConditionNode::And(a, b) | ConditionNode::Or(a, b) => {
                    walk(a, out);
                    walk(b, out);
                }
                ConditionNode::Not(a) => walk(a, out),
                _ => {}
            }
        }
        let mut columns = BTreeSet::new();
        walk(&self.root, &mut columns);
        columns.into_iter().collect()
    }
}

impl fmt::Display for KeyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)
    }
}

/// Decompose the lexicographic tuple interval between `left` and `right`
/// into disjoint hyperrectangles and fold `callback` over them.
///
/// Shape per level: shared point prefix, then an exclusive middle slab with
/// unconstrained tail columns, then the two boundary slices recursed one
/// column deeper. At most `2 * key_size + 1` callback invocations.
#[allow(clippy::too_many_arguments)]
fn for_any_hyperrectangle(
    key_size: usize,
    left: &[KeyValue],
    right: &[KeyValue],
    left_bounded: bool,
    right_bounded: bool,
    hyperrectangle: &mut [ValueRange],
    prefix_size: usize,
    initial_mask: BoolMask,
    callback: &mut dyn FnMut(&[ValueRange]) -> BoolMask,
) -> BoolMask {
    if !left_bounded && !right_bounded {
        return callback(hyperrectangle);
    }

    let mut prefix_size = prefix_size;
    if left_bounded && right_bounded {
        while prefix_size < key_size
            && left[prefix_size].cmp(&right[prefix_size]) == Ordering::Equal
        {
            hyperrectangle[prefix_size] = ValueRange::point(left[prefix_size].clone());
            prefix_size += 1;
        }
    }

    if prefix_size == key_size {
        return callback(hyperrectangle);
    }

    if prefix_size + 1 == key_size {
        hyperrectangle[prefix_size] = match (left_bounded, right_bounded) {
            (true, true) => ValueRange::new(
                left[prefix_size].clone(),
                true,
                right[prefix_size].clone(),
                true,
            ),
            (true, false) => ValueRange::left_bounded(left[prefix_size].clone(), true),
            (false, true) => ValueRange::right_bounded(right[prefix_size].clone(), true),
            (false, false) => unreachable!(),
        };
        return callback(hyperrectangle);
    }

    // Middle slab: the open interval at this column crossed with the whole
    // universe for every deeper column.
    hyperrectangle[prefix_size] = match (left_bounded, right_bounded) {
        (true, true) => ValueRange::new(
            left[prefix_size].clone(),
            false,
            right[prefix_size].clone(),
            false,
        ),
        (true, false) => ValueRange::left_bounded(left[prefix_size].clone(), false),
        (false, true) => ValueRange::right_bounded(right[prefix_size].clone(), false),
        (false, false) => unreachable!(),
    };
    for slot in hyperrectangle.iter_mut().take(key_size).skip(prefix_size + 1) {
        *slot = ValueRange::whole_universe();
    }

    let mut result = BoolMask::NONE;
    if !hyperrectangle[prefix_size].is_empty() {
        result = result.combine(callback(hyperrectangle));
        if result.is_complete_for(initial_mask) {
            return result;
        }
    }

    if left_bounded {
        hyperrectangle[prefix_size] = ValueRange::point(left[prefix_size].clone());
        result = result.combine(for_any_hyperrectangle(
            key_size,
            left,
            right,
            true,
            false,
            hyperrectangle,
            prefix_size + 1,
            initial_mask,
            callback,
        ));
        if result.is_complete_for(initial_mask) {
            return result;
        }
    }

    if right_bounded {
        hyperrectangle[prefix_size] = ValueRange::point(right[prefix_size].clone());
        result = result.combine(for_any_hyperrectangle(
            key_size,
            left,
            right,
            false,
            true,
            hyperrectangle,
            prefix_size + 1,
            initial_mask,
            callback,
        ));
    }

    result
}

// ============================================================================
// Offset conditions
// ============================================================================

/// Predicates over the virtual row-offset columns, evaluated against the
/// first and last row numbers covered by a mark range. `part_offset` uses
/// part-local row numbers; `total_offset` uses the row number within the
/// query-wide concatenation of selected parts.
#[derive(Debug, Clone, Default)]
pub struct OffsetConditions {
    pub part_offset: Option<KeyCondition>,
    pub total_offset: Option<KeyCondition>,
}

impl OffsetConditions {
    pub fn is_empty(&self) -> bool {
        self.part_offset.is_none() && self.total_offset.is_none()
    }

    /// Evaluate the offset predicates over the rows covered by `range`.
    /// An empty row interval (a final stub mark) is definitively false.
    pub fn check_mark_range(
        &self,
        granularity: &IndexGranularity,
        range: &MarkRange,
        part_starting_offset: u64,
        initial_mask: BoolMask,
    ) -> BoolMask {
        let first_row = granularity.mark_starting_row(range.begin);
        let end_row = granularity.mark_starting_row(range.end);
        if end_row <= first_row {
            return BoolMask { can_be_true: false, can_be_false: true };
        }
        let last_row = end_row - 1;

        let mut mask = BoolMask { can_be_true: true, can_be_false: false };
        if let Some(cond) = &self.part_offset {
            let left = [KeyValue::UInt64(first_row)];
            let right = [KeyValue::UInt64(last_row)];
            mask = mask.and(cond.check_in_range(1, &left, &right, initial_mask));
        }
        if let Some(cond) = &self.total_offset {
            let left = [KeyValue::UInt64(part_starting_offset + first_row)];
            let right = [KeyValue::UInt64(part_starting_offset + last_row)];
            mask = mask.and(cond.check_in_range(1, &left, &right, initial_mask));
        }
        mask
    }
}

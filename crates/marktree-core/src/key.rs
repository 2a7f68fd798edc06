//! Key-space scalars and intervals.
//!
//! `KeyValue` is a value of one primary/partition/sampling key column with
//! explicit `-inf`/`+inf` sentinels. The sentinels stand in for key columns
//! that are not materialized in memory and for open-ended search bounds, so
//! range evaluation never needs a separate "unbounded" flag on the value
//! itself. Nulls sort last: they are mapped to `PosInfinity` at construction.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A value in one key column (supports common column types).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KeyValue {
    NegInfinity,
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    String(String),
    Timestamp(i64), // Microseconds since epoch
    PosInfinity,
}

impl KeyValue {
    /// Null key values take the `+inf` slot so they collate after every
    /// concrete value.
    pub fn null() -> KeyValue {
        KeyValue::PosInfinity
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, KeyValue::NegInfinity | KeyValue::PosInfinity)
    }

    fn variant_rank(&self) -> u8 {
        match self {
            KeyValue::NegInfinity => 0,
            KeyValue::Int64(_) => 1,
            KeyValue::UInt64(_) => 2,
            KeyValue::Float64(_) => 3,
            KeyValue::String(_) => 4,
            KeyValue::Timestamp(_) => 5,
            KeyValue::PosInfinity => 6,
        }
    }

    /// Compare two key values. The infinities sort before/after everything;
    /// concrete cross-type comparisons fall back to variant rank (a
    /// well-formed key never mixes types within one column).
    pub fn cmp(&self, other: &KeyValue) -> Ordering {
        match (self, other) {
            (KeyValue::NegInfinity, KeyValue::NegInfinity) => Ordering::Equal,
            (KeyValue::NegInfinity, _) => Ordering::Less,
            (_, KeyValue::NegInfinity) => Ordering::Greater,
            (KeyValue::PosInfinity, KeyValue::PosInfinity) => Ordering::Equal,
            (KeyValue::PosInfinity, _) => Ordering::Greater,
            (_, KeyValue::PosInfinity) => Ordering::Less,
            (KeyValue::Int64(a), KeyValue::Int64(b)) => a.cmp(b),
            (KeyValue::UInt64(a), KeyValue::UInt64(b)) => a.cmp(b),
            (KeyValue::Float64(a), KeyValue::Float64(b)) => a.total_cmp(b),
            (KeyValue::String(a), KeyValue::String(b)) => a.cmp(b),
            (KeyValue::Timestamp(a), KeyValue::Timestamp(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant_rank().hash(state);
        match self {
            KeyValue::NegInfinity | KeyValue::PosInfinity => {}
            KeyValue::Int64(v) => v.hash(state),
            KeyValue::UInt64(v) => v.hash(state),
            KeyValue::Float64(v) => v.to_bits().hash(state),
            KeyValue::String(v) => v.hash(state),
            KeyValue::Timestamp(v) => v.hash(state),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::NegInfinity => write!(f, "-inf"),
            KeyValue::Int64(v) => write!(f, "{v}"),
            KeyValue::UInt64(v) => write!(f, "{v}"),
            KeyValue::Float64(v) => write!(f, "{v}"),
            KeyValue::String(v) => write!(f, "'{v}'"),
            KeyValue::Timestamp(v) => write!(f, "ts({v})"),
            KeyValue::PosInfinity => write!(f, "+inf"),
        }
    }
}

/// An interval over one key column. Unbounded ends carry the matching
/// infinity sentinel as their value; inclusion flags are meaningful only for
/// finite bounds, except that a `[+inf, +inf]` point is a legitimate
/// all-nulls granule summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Hash)]
pub struct ValueRange {
    pub left: KeyValue,
    pub left_included: bool,
    pub right: KeyValue,
    pub right_included: bool,
}

impl ValueRange {
    pub fn new(left: KeyValue, left_included: bool, right: KeyValue, right_included: bool) -> Self {
        ValueRange { left, left_included, right, right_included }
    }

    /// `(-inf, +inf)`: matches any value including nulls.
    pub fn whole_universe() -> Self {
        ValueRange {
            left: KeyValue::NegInfinity,
            left_included: false,
            right: KeyValue::PosInfinity,
            right_included: true,
        }
    }

    /// `[value, value]`.
    pub fn point(value: KeyValue) -> Self {
        ValueRange {
            left: value.clone(),
            left_included: true,
            right: value,
            right_included: true,
        }
    }

    /// `[value, +inf)` or `(value, +inf)`. Excludes nulls.
    pub fn left_bounded(value: KeyValue, included: bool) -> Self {
        ValueRange {
            left: value,
            left_included: included,
            right: KeyValue::PosInfinity,
            right_included: false,
        }
    }

    /// `(-inf, value]` or `(-inf, value)`.
    pub fn right_bounded(value: KeyValue, included: bool) -> Self {
        ValueRange {
            left: KeyValue::NegInfinity,
            left_included: false,
            right: value,
            right_included: included,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.left.cmp(&self.right) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.left_included && self.right_included),
            Ordering::Less => false,
        }
    }

    /// True when the two intervals share at least one value.
    pub fn intersects(&self, other: &ValueRange) -> bool {
        // self entirely to the left of other
        match self.right.cmp(&other.left) {
            Ordering::Less => return false,
            Ordering::Equal if !(self.right_included && other.left_included) => return false,
            _ => {}
        }
        // self entirely to the right of other
        match other.right.cmp(&self.left) {
            Ordering::Less => return false,
            Ordering::Equal if !(other.right_included && self.left_included) => return false,
            _ => {}
        }
        true
    }

    /// True when both ends are the same included value.
    pub fn is_point(&self) -> bool {
        self.left_included
            && self.right_included
            && self.left.cmp(&self.right) == Ordering::Equal
    }

    /// True when `other` lies entirely within `self`.
    pub fn contains_range(&self, other: &ValueRange) -> bool {
        match self.left.cmp(&other.left) {
            Ordering::Greater => return false,
            Ordering::Equal if !self.left_included && other.left_included => return false,
            _ => {}
        }
        match other.right.cmp(&self.right) {
            Ordering::Greater => return false,
            Ordering::Equal if !self.right_included && other.right_included => return false,
            _ => {}
        }
        true
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.left_included { '[' } else { '(' };
        let close = if self.right_included { ']' } else { ')' };
        write!(f, "{open}{}, {}{close}", self.left, self.right)
    }
}

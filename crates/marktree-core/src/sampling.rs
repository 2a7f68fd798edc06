//! Sampling range planner. Turns a `SAMPLE size OFFSET offset` request (and
//! an optional parallel-replica split) into a half-open interval of sampling
//! key values, pushed into the key condition so the primary-key search prunes
//! marks outside the sample.
//!
//! All boundary arithmetic is exact rational arithmetic over `u128`. Floating
//! point would round interval edges and break the replica tiling guarantee:
//! for a fixed request split across N replicas, the N per-replica intervals
//! must cover the single-replica interval with no gap and no overlap.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::condition::KeyCondition;
use crate::error::{SelectError, SelectResult};
use crate::key::{KeyValue, ValueRange};

// ===== Exact rational arithmetic =====

/// Non-negative rational number with eager reduction. The denominator is
/// never zero; the value is always in lowest terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ratio {
    num: u128,
    den: u128,
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Ratio {
    pub const ZERO: Ratio = Ratio { num: 0, den: 1 };
    pub const ONE: Ratio = Ratio { num: 1, den: 1 };

    /// `num / den` in lowest terms. A zero denominator is rejected.
    pub fn new(num: u128, den: u128) -> SelectResult<Ratio> {
        if den == 0 {
            return Err(SelectError::Configuration(
                "sampling ratio has a zero denominator".into(),
            ));
        }
        Ok(Ratio::reduced(num, den))
    }

    fn reduced(num: u128, den: u128) -> Ratio {
        if num == 0 {
            return Ratio::ZERO;
        }
        let g = gcd(num, den);
        Ratio { num: num / g, den: den / g }
    }

    pub fn from_int(value: u64) -> Ratio {
        Ratio { num: value as u128, den: 1 }
    }

    /// `mantissa * 10^-scale`, e.g. `SAMPLE 0.25` is `from_decimal(25, 2)`.
    pub fn from_decimal(mantissa: u64, scale: u32) -> Ratio {
        Ratio::reduced(mantissa as u128, 10u128.pow(scale))
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn numer(&self) -> u128 {
        self.num
    }

    pub fn denom(&self) -> u128 {
        self.den
    }

    pub fn checked_add(self, other: Ratio) -> Option<Ratio> {
        let g = gcd(self.den, other.den);
        let lhs = self.num.checked_mul(other.den / g)?;
        let rhs = other.num.checked_mul(self.den / g)?;
        let den = (self.den / g).checked_mul(other.den)?;
        Some(Ratio::reduced(lhs.checked_add(rhs)?, den))
    }

    /// `None` when the result would be negative or overflow.
    pub fn checked_sub(self, other: Ratio) -> Option<Ratio> {
        let g = gcd(self.den, other.den);
        let lhs = self.num.checked_mul(other.den / g)?;
        let rhs = other.num.checked_mul(self.den / g)?;
        let den = (self.den / g).checked_mul(other.den)?;
        Some(Ratio::reduced(lhs.checked_sub(rhs)?, den))
    }

    /// Cross-reduced product: numerators are reduced against the opposite
    /// denominators before multiplying, so intermediate values stay small.
    pub fn checked_mul(self, other: Ratio) -> Option<Ratio> {
        let g1 = gcd(self.num, other.den);
        let g2 = gcd(other.num, self.den);
        let num = (self.num / g1).checked_mul(other.num / g2)?;
        let den = (self.den / g2).checked_mul(other.den / g1)?;
        Some(Ratio { num, den })
    }

    pub fn checked_div(self, other: Ratio) -> Option<Ratio> {
        if other.num == 0 {
            return None;
        }
        self.checked_mul(Ratio { num: other.den, den: other.num })
    }

    /// Integer part, rounding toward zero.
    pub fn floor(&self) -> u128 {
        self.num / self.den
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl PartialOrd for Ratio {
    fn partial_cmp(&self, other: &Ratio) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ratio {
    fn cmp(&self, other: &Ratio) -> std::cmp::Ordering {
        // Values are reduced eagerly, so the cross products stay well under
        // u128 for the magnitudes sampling produces (universe <= 2^64,
        // decimal denominators <= 10^38 never combined with large numerators).
        let g1 = gcd(self.num, other.num);
        let g2 = gcd(self.den, other.den);
        let lhs = (self.num / g1) * (other.den / g2);
        let rhs = (other.num / g1) * (self.den / g2);
        lhs.cmp(&rhs)
    }
}

impl std::fmt::Display for Ratio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

// ===== Request types =====

/// Parsed `SAMPLE size [OFFSET offset]` clause. A size greater than one is an
/// absolute row count; sizes and offsets in `[0, 1]` are fractions of the
/// table.
#[derive(Debug, Clone, Copy)]
pub struct SampleRequest {
    pub size: Ratio,
    pub offset: Ratio,
}

impl SampleRequest {
    pub fn new(size: Ratio, offset: Ratio) -> Self {
        SampleRequest { size, offset }
    }

    pub fn relative(size: Ratio) -> Self {
        SampleRequest { size, offset: Ratio::ZERO }
    }
}

/// Where the sampling column sits in the primary key and how wide its
/// unsigned integer type is.
#[derive(Debug, Clone, Copy)]
pub struct SamplingKey {
    pub column_index: usize,
    pub bits: u32,
}

impl SamplingKey {
    pub fn new(column_index: usize, bits: u32) -> Self {
        SamplingKey { column_index, bits }
    }

    fn universe(&self) -> SelectResult<Ratio> {
        match self.bits {
            8 | 16 | 32 | 64 => Ok(Ratio { num: 1u128 << self.bits, den: 1 }),
            other => Err(SelectError::Configuration(format!(
                "invalid sampling column width: {} bits, must be 8, 16, 32 or 64",
                other
            ))),
        }
    }
}

/// Replica split of the sample interval: this node reads tile `index` out of
/// `count` equal tiles.
#[derive(Debug, Clone, Copy)]
pub struct ParallelReplicas {
    pub count: u64,
    pub index: u64,
}

// ===== Plan =====

/// Outcome of sampling analysis. When `use_sampling` is set the bounds have
/// already been pushed into the key condition; `lower` is inclusive, `upper`
/// exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingPlan {
    pub use_sampling: bool,
    /// The sample interval is empty; the query reads no rows at all.
    pub read_nothing: bool,
    /// Multiplier for turning sampled aggregates back into estimates over
    /// the whole table. 1.0 when sampling is off.
    pub used_sample_factor: f64,
    pub lower: Option<u64>,
    pub upper: Option<u64>,
    pub has_lower_limit: bool,
    pub has_upper_limit: bool,
}

impl Default for SamplingPlan {
    fn default() -> Self {
        SamplingPlan {
            use_sampling: false,
            read_nothing: false,
            used_sample_factor: 1.0,
            lower: None,
            upper: None,
            has_lower_limit: false,
            has_upper_limit: false,
        }
    }
}

fn overflow() -> SelectError {
    SelectError::Configuration("sampling ratio arithmetic overflow".into())
}

/// An absolute row count becomes the fraction of the (approximate) total rows
/// the query would otherwise read. An empty table samples everything.
fn absolute_to_relative(value: Ratio, approx_total_rows: u64) -> SelectResult<Ratio> {
    if approx_total_rows == 0 {
        return Ok(Ratio::ONE);
    }
    let absolute = Ratio::from_int(value.floor() as u64);
    let relative =
        absolute.checked_div(Ratio::from_int(approx_total_rows)).ok_or_else(overflow)?;
    Ok(relative.min(Ratio::ONE))
}

// ===== Planner =====

/// Resolve a sampling request into an interval of sampling key values and
/// push its bounds into `key_condition`.
///
/// `approx_total_rows` only matters when the request carries absolute row
/// counts; callers compute it with an unrestricted mark-range pass.
pub fn build_sampling(
    request: Option<&SampleRequest>,
    key: Option<&SamplingKey>,
    replicas: Option<ParallelReplicas>,
    key_condition: &mut KeyCondition,
    approx_total_rows: u64,
) -> SelectResult<SamplingPlan> {
    let mut plan = SamplingPlan::default();

    let mut size = Ratio::ZERO;
    let mut offset = Ratio::ZERO;
    if let Some(request) = request {
        size = request.size;
        offset = request.offset;

        if size > Ratio::ONE {
            size = absolute_to_relative(size, approx_total_rows)?;
            debug!(relative_sample_size = %size, "converted absolute sample size");
        }
        // SAMPLE 1 reads everything, same as no SAMPLE clause.
        if size == Ratio::ONE {
            size = Ratio::ZERO;
        }
        if offset > Ratio::ZERO && size.is_zero() {
            return Err(SelectError::Configuration(
                "sampling offset given without a sampling size".into(),
            ));
        }
        if offset > Ratio::ONE {
            offset = absolute_to_relative(offset, approx_total_rows)?;
            debug!(relative_sample_offset = %offset, "converted absolute sample offset");
        }
    }

    let replica_split = replicas.filter(|r| r.count > 1);

    // Replicas were requested but there is no key to tile over: the first
    // replica reads everything, the others read nothing.
    if let Some(split) = replica_split {
        if key.is_none() {
            if split.index > 0 {
                debug!(
                    replica = split.index,
                    "replica reads no data: replica split requested but no sampling key"
                );
                plan.read_nothing = true;
            }
            return Ok(plan);
        }
    }

    plan.use_sampling = !size.is_zero() || replica_split.is_some();
    if !plan.use_sampling {
        return Ok(plan);
    }
    let key = key.ok_or_else(|| {
        SelectError::Configuration("sampling requested but the table has no sampling key".into())
    })?;

    if !size.is_zero() {
        plan.used_sample_factor = 1.0 / size.to_f64();
    }

    let universe = key.universe()?;

    if let Some(split) = replica_split {
        if size.is_zero() {
            size = Ratio::ONE;
        }
        size = size.checked_div(Ratio::from_int(split.count)).ok_or_else(overflow)?;
        let shift = size.checked_mul(Ratio::from_int(split.index)).ok_or_else(overflow)?;
        offset = offset.checked_add(shift).ok_or_else(overflow)?;
    }

    let mut no_data = offset >= Ratio::ONE;

    let lower_rational = offset.checked_mul(universe).ok_or_else(overflow)?;
    let upper_rational = offset
        .checked_add(size)
        .and_then(|end| end.checked_mul(universe))
        .ok_or_else(overflow)?;

    let lower = lower_rational.floor();
    let upper = upper_rational.floor();
    let has_lower_limit = lower > 0;
    let has_upper_limit = upper_rational < universe;

    if (has_upper_limit && upper == 0) || (has_lower_limit && has_upper_limit && lower == upper) {
        no_data = true;
    }

    if no_data || (!has_lower_limit && !has_upper_limit) {
        plan.use_sampling = false;
        if no_data {
            debug!("sampling yields no data");
            plan.read_nothing = true;
        }
        return Ok(plan);
    }

    if has_lower_limit {
        let lower = lower as u64;
        let range = ValueRange::left_bounded(KeyValue::UInt64(lower), true);
        if !key_condition.add_condition(key.column_index, range) {
            return Err(SelectError::Configuration(
                "sampling column is not part of the primary key".into(),
            ));
        }
        plan.lower = Some(lower);
        plan.has_lower_limit = true;
    }
    if has_upper_limit {
        let upper = upper as u64;
        let range = ValueRange::right_bounded(KeyValue::UInt64(upper), false);
        if !key_condition.add_condition(key.column_index, range) {
            return Err(SelectError::Configuration(
                "sampling column is not part of the primary key".into(),
            ));
        }
        plan.upper = Some(upper);
        plan.has_upper_limit = true;
    }

    debug!(
        lower = ?plan.lower,
        upper = ?plan.upper,
        factor = plan.used_sample_factor,
        "sampling interval resolved"
    );
    Ok(plan)
}

//! Immutable plan parameters shared by every iterator in a query
//!
//! [`IteratorOptions`] is derived from the statement once and cloned down the
//! iterator tree. It carries the time bounds, grouping dimensions, bucketing
//! interval, fill policy, and stream-shaping parameters every layer consults.

use crate::ast::{self, Expr, Literal, Measurement, SelectStatement};
use crate::error::Result;
use crate::point::{MAX_TIME, MIN_TIME};
use serde::{Deserialize, Serialize};

/// Nanoseconds in one second, the default derivative unit.
const NANOS_PER_SECOND: i64 = 1_000_000_000;

// ============================================================================
// Interval
// ============================================================================

/// A time bucketing interval: duration plus offset, both in nanoseconds.
///
/// The bucket of time `t` is `floor((t - offset) / duration) * duration +
/// offset`. A zero duration means no bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Interval {
    /// Bucket width in nanoseconds. Zero disables bucketing.
    pub duration: i64,
    /// Bucket phase offset in nanoseconds.
    pub offset: i64,
}

impl Interval {
    /// Create an interval.
    pub fn new(duration: i64, offset: i64) -> Self {
        Interval { duration, offset }
    }

    /// Whether bucketing is disabled.
    pub fn is_zero(&self) -> bool {
        self.duration == 0
    }

    /// The start of the bucket containing `t`.
    ///
    /// Callers must not invoke this on a zero interval.
    pub fn bucket(&self, t: i64) -> i64 {
        debug_assert!(self.duration > 0);
        (t - self.offset).div_euclid(self.duration) * self.duration + self.offset
    }
}

// ============================================================================
// Fill policy
// ============================================================================

/// Policy for populating time buckets that received no input points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FillPolicy {
    /// Emit only non-empty buckets.
    None,
    /// Emit every bucket; empty buckets carry a null value.
    Null,
    /// Empty buckets carry the given number.
    Number(f64),
    /// Empty buckets repeat the previous non-null value.
    Previous,
    /// Empty buckets are linearly interpolated between neighbours.
    Linear,
}

// ============================================================================
// Iterator options
// ============================================================================

/// Immutable per-plan parameters handed to every iterator constructor.
#[derive(Debug, Clone)]
pub struct IteratorOptions {
    /// The expression this iterator evaluates, if any.
    pub expr: Option<Expr>,
    /// Sorted unique auxiliary field names to carry alongside values.
    pub aux: Vec<String>,
    /// Measurement sources the iterator reads from.
    pub sources: Vec<Measurement>,
    /// Inclusive lower time bound in nanoseconds.
    pub start_time: i64,
    /// Inclusive upper time bound in nanoseconds.
    pub end_time: i64,
    /// Time ordering of the stream.
    pub ascending: bool,
    /// Time bucketing interval. Zero means no bucketing.
    pub interval: Interval,
    /// Tag keys points are grouped by, sorted.
    pub dimensions: Vec<String>,
    /// Fill policy for empty buckets.
    pub fill: FillPolicy,
    /// Filter condition pushed down to storage.
    pub condition: Option<Expr>,
    /// Maximum points per series, zero for unlimited.
    pub limit: usize,
    /// Points skipped per series.
    pub offset: usize,
    /// Maximum number of series, zero for unlimited.
    pub slimit: usize,
    /// Series skipped.
    pub soffset: usize,
    /// Whether duplicate points are dropped.
    pub dedupe: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        IteratorOptions {
            expr: None,
            aux: Vec::new(),
            sources: Vec::new(),
            start_time: MIN_TIME,
            end_time: MAX_TIME,
            ascending: true,
            interval: Interval::default(),
            dimensions: Vec::new(),
            fill: FillPolicy::None,
            condition: None,
            limit: 0,
            offset: 0,
            slimit: 0,
            soffset: 0,
            dedupe: false,
        }
    }
}

impl IteratorOptions {
    /// Derive options from a rewritten statement and the outer select bounds.
    ///
    /// The statement's `WHERE` time constraints are intersected with the
    /// caller's bounds.
    pub fn from_statement(stmt: &SelectStatement, sopt: &SelectOptions) -> Result<Self> {
        let (cond_min, cond_max) = match &stmt.condition {
            Some(cond) => ast::time_range(cond),
            None => (None, None),
        };
        let start_time = cond_min.map_or(sopt.min_time, |v| v.max(sopt.min_time));
        let end_time = cond_max.map_or(sopt.max_time, |v| v.min(sopt.max_time));

        Ok(IteratorOptions {
            expr: None,
            aux: Vec::new(),
            sources: stmt.sources.clone(),
            start_time,
            end_time,
            ascending: stmt.ascending,
            interval: stmt.interval(),
            dimensions: stmt.tag_dimensions(),
            fill: stmt.fill,
            condition: stmt.condition.clone(),
            limit: stmt.limit,
            offset: stmt.offset,
            slimit: stmt.slimit,
            soffset: stmt.soffset,
            dedupe: stmt.dedupe,
        })
    }

    /// Whether the start bound is the unbounded sentinel.
    pub fn start_unbounded(&self) -> bool {
        self.start_time == MIN_TIME
    }

    /// Whether the end bound is the unbounded sentinel.
    pub fn end_unbounded(&self) -> bool {
        self.end_time == MAX_TIME
    }

    /// The derivative unit for the call held in `expr`.
    ///
    /// An explicit duration argument wins, then the group-by interval, then
    /// one second.
    pub fn derivative_interval(&self) -> i64 {
        if let Some(Expr::Call { args, .. }) = &self.expr {
            if args.len() == 2 {
                if let Expr::Literal(Literal::Duration(ns)) = &args[1] {
                    return *ns;
                }
            }
        }
        if !self.interval.is_zero() {
            return self.interval.duration;
        }
        NANOS_PER_SECOND
    }
}

// ============================================================================
// Select options
// ============================================================================

/// Outer bounds applied to a whole select call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOptions {
    /// Lower bound for the select call, in nanoseconds.
    pub min_time: i64,
    /// Upper bound for the select call, in nanoseconds.
    pub max_time: i64,
}

impl Default for SelectOptions {
    fn default() -> Self {
        SelectOptions {
            min_time: MIN_TIME,
            max_time: MAX_TIME,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Dimension, Expr, Literal};
    use crate::point::DataType;

    #[test]
    fn test_interval_bucket() {
        let interval = Interval::new(10, 0);
        assert_eq!(interval.bucket(0), 0);
        assert_eq!(interval.bucket(9), 0);
        assert_eq!(interval.bucket(10), 10);
        assert_eq!(interval.bucket(15), 10);
    }

    #[test]
    fn test_interval_bucket_with_offset() {
        let interval = Interval::new(10, 3);
        assert_eq!(interval.bucket(3), 3);
        assert_eq!(interval.bucket(12), 3);
        assert_eq!(interval.bucket(13), 13);
    }

    #[test]
    fn test_interval_bucket_negative_time() {
        let interval = Interval::new(10, 0);
        assert_eq!(interval.bucket(-1), -10);
        assert_eq!(interval.bucket(-10), -10);
        assert_eq!(interval.bucket(-11), -20);
    }

    #[test]
    fn test_options_intersect_bounds() {
        let stmt = SelectStatement {
            condition: Some(Expr::binary(
                Expr::var_ref("time", DataType::Integer),
                BinaryOp::Gte,
                Expr::Literal(Literal::Integer(50)),
            )),
            ..Default::default()
        };
        let sopt = SelectOptions {
            min_time: 100,
            max_time: 1000,
        };
        let opt = IteratorOptions::from_statement(&stmt, &sopt).unwrap();
        // Condition lower bound is below the caller's: caller wins.
        assert_eq!(opt.start_time, 100);
        assert_eq!(opt.end_time, 1000);
    }

    #[test]
    fn test_options_from_statement_defaults() {
        let stmt = SelectStatement::default();
        let opt = IteratorOptions::from_statement(&stmt, &SelectOptions::default()).unwrap();
        assert!(opt.start_unbounded());
        assert!(opt.end_unbounded());
        assert!(opt.interval.is_zero());
        assert!(opt.ascending);
    }

    #[test]
    fn test_derivative_interval_precedence() {
        let mut opt = IteratorOptions {
            expr: Some(Expr::call(
                "derivative",
                vec![
                    Expr::var_ref("v", DataType::Float),
                    Expr::Literal(Literal::Duration(5)),
                ],
            )),
            interval: Interval::new(60, 0),
            ..Default::default()
        };
        assert_eq!(opt.derivative_interval(), 5);

        opt.expr = Some(Expr::call("derivative", vec![Expr::var_ref("v", DataType::Float)]));
        assert_eq!(opt.derivative_interval(), 60);

        opt.interval = Interval::default();
        assert_eq!(opt.derivative_interval(), 1_000_000_000);
    }

    #[test]
    fn test_plan_types_serialize() {
        let interval = Interval::new(10_000_000_000, 5);
        let json = serde_json::to_string(&interval).unwrap();
        let back: Interval = serde_json::from_str(&json).unwrap();
        assert_eq!(back, interval);

        let fill = FillPolicy::Number(4.5);
        let json = serde_json::to_string(&fill).unwrap();
        let back: FillPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fill);
    }

    #[test]
    fn test_options_group_by_projection() {
        let stmt = SelectStatement {
            dimensions: vec![
                Dimension::Time(Interval::new(10, 0)),
                Dimension::Tag("host".to_string()),
            ],
            fill: FillPolicy::Number(7.5),
            ..Default::default()
        };
        let opt = IteratorOptions::from_statement(&stmt, &SelectOptions::default()).unwrap();
        assert_eq!(opt.interval, Interval::new(10, 0));
        assert_eq!(opt.dimensions, vec!["host".to_string()]);
        assert_eq!(opt.fill, FillPolicy::Number(7.5));
    }
}

//! Windowed aggregate and selector iterators
//!
//! Aggregates run on a shared reduce framework: points are collected one time
//! bucket at a time, grouped inside the bucket by the plan's dimension tags,
//! and handed to a per-call reduce function that emits the bucket's output
//! points. Memory is bounded by a single bucket's contents; top/bottom hold at
//! most their selection size per group after reduction.
//!
//! Scalar aggregates (count, sum, mean, median, stddev, spread, distinct)
//! stamp their output with the bucket start time and the group's projected
//! tags. Selector aggregates (min, max, first, last, percentile, top, bottom)
//! re-emit actual input points, preserving their times; top and bottom also
//! preserve the original tag sets.

use crate::error::{QueryError, Result};
use crate::iterator::{BoxedIterator, BufIterator, IteratorStats, PointIterator, TypedIterator};
use crate::options::{Interval, IteratorOptions};
use crate::point::{DataType, FloatPoint, IntegerPoint, Point, PointValue, Tags, Value, MIN_TIME};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

// ============================================================================
// Reduce framework
// ============================================================================

/// Identity of one group within one time bucket.
pub struct GroupContext {
    /// Measurement name of the group.
    pub name: String,
    /// Tags projected onto the plan's dimensions.
    pub tags: Tags,
    /// Start of the time bucket.
    pub window_start: i64,
}

impl GroupContext {
    /// A scalar aggregate output point for this group and bucket.
    fn scalar<U: PointValue>(&self, value: U) -> Point<U> {
        Point {
            name: self.name.clone(),
            tags: self.tags.clone(),
            time: self.window_start,
            value,
            nil: false,
            aux: Vec::new(),
        }
    }

    /// A null output point for this group and bucket.
    fn null<U: PointValue>(&self) -> Point<U> {
        Point::null(self.name.clone(), self.tags.clone(), self.window_start)
    }
}

/// Groups an input stream by time bucket and dimension tags, reducing each
/// group with a caller-supplied function.
///
/// The input must deliver each (series, bucket) pair contiguously, which any
/// time-ordered or series-ordered upstream satisfies. A point falling outside
/// the current bucket is pushed back and starts the next bucket.
pub struct ReduceSliceIterator<T: PointValue, U: PointValue> {
    input: BufIterator<T>,
    interval: Interval,
    start_time: i64,
    dimensions: Vec<String>,
    f: Box<dyn FnMut(&GroupContext, Vec<Point<T>>) -> Vec<Point<U>> + Send>,
    pending: VecDeque<Point<U>>,
    done: bool,
}

impl<T: PointValue, U: PointValue> ReduceSliceIterator<T, U> {
    /// Create a reduce iterator over `input` with the plan's windowing.
    pub fn new(
        input: BoxedIterator<T>,
        opt: &IteratorOptions,
        f: impl FnMut(&GroupContext, Vec<Point<T>>) -> Vec<Point<U>> + Send + 'static,
    ) -> Self {
        ReduceSliceIterator {
            input: BufIterator::new(input),
            interval: opt.interval,
            start_time: opt.start_time,
            dimensions: opt.dimensions.clone(),
            f: Box::new(f),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Inclusive-exclusive bounds of the bucket containing `t`, plus the
    /// emission timestamp for the bucket.
    fn window_of(&self, t: i64) -> (i64, i64, i64) {
        if self.interval.is_zero() {
            let emit = if self.start_time == MIN_TIME {
                0
            } else {
                self.start_time
            };
            (i64::MIN, i64::MAX, emit)
        } else {
            let start = self.interval.bucket(t);
            (start, start.saturating_add(self.interval.duration), start)
        }
    }
}

impl<T: PointValue, U: PointValue> PointIterator for ReduceSliceIterator<T, U> {
    type Value = U;

    fn next_point(&mut self) -> Result<Option<Point<U>>> {
        loop {
            if let Some(p) = self.pending.pop_front() {
                return Ok(Some(p));
            }
            if self.done {
                return Ok(None);
            }

            let first = match self.input.next_point()? {
                Some(p) => p,
                None => {
                    self.done = true;
                    continue;
                }
            };
            let (window_start, window_end, emit_time) = self.window_of(first.time);

            let mut groups: BTreeMap<String, (GroupContext, Vec<Point<T>>)> = BTreeMap::new();
            insert_grouped(&mut groups, first, &self.dimensions, emit_time);
            while let Some(p) = self.input.next_point()? {
                if p.time >= window_start && p.time < window_end {
                    insert_grouped(&mut groups, p, &self.dimensions, emit_time);
                } else {
                    self.input.unread(p);
                    break;
                }
            }

            for (_, (ctx, points)) in groups {
                self.pending.extend((self.f)(&ctx, points));
            }
        }
    }

    fn stats(&self) -> IteratorStats {
        self.input.stats()
    }

    fn close(&mut self) {
        self.pending.clear();
        self.done = true;
        self.input.close();
    }
}

/// File a point under its group's bucket entry, creating the group on first
/// sight.
fn insert_grouped<T: PointValue>(
    groups: &mut BTreeMap<String, (GroupContext, Vec<Point<T>>)>,
    p: Point<T>,
    dimensions: &[String],
    emit_time: i64,
) {
    let tags = p.tags.project(dimensions);
    let name = p.name.clone();
    let mut key = p.name.clone();
    key.push('\u{0}');
    key.push_str(&tags.key());
    groups
        .entry(key)
        .or_insert_with(move || {
            (
                GroupContext {
                    name,
                    tags,
                    window_start: emit_time,
                },
                Vec::new(),
            )
        })
        .1
        .push(p);
}

fn reduce_iterator<T: PointValue, U: PointValue>(
    input: BoxedIterator<T>,
    opt: &IteratorOptions,
    f: impl FnMut(&GroupContext, Vec<Point<T>>) -> Vec<Point<U>> + Send + 'static,
) -> BoxedIterator<U> {
    Box::new(ReduceSliceIterator::new(input, opt, f))
}

fn unsupported_input(call: &str, found: DataType) -> QueryError {
    QueryError::InvalidArgument {
        call: call.to_string(),
        reason: format!("unsupported input type {}", found),
    }
}

// ============================================================================
// Push-down call catalogue
// ============================================================================

/// Build the aggregate iterator for the call held in `opt.expr`.
///
/// This is the reference implementation of the push-down contract: a storage
/// engine that receives a `count`/`min`/`max`/`sum`/`first`/`last`/`mean`
/// call in its options builds the raw field leaf and wraps it here.
pub fn new_call_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    let name = match &opt.expr {
        Some(crate::ast::Expr::Call { name, .. }) => name.as_str(),
        _ => {
            return Err(QueryError::InvalidExpression(
                "call iterator requires a call expression".to_string(),
            ))
        }
    };
    match name {
        "count" => new_count_iterator(input, opt),
        "min" => new_min_iterator(input, opt),
        "max" => new_max_iterator(input, opt),
        "sum" => new_sum_iterator(input, opt),
        "first" => new_first_iterator(input, opt),
        "last" => new_last_iterator(input, opt),
        "mean" => new_mean_iterator(input, opt),
        other => Err(QueryError::UnsupportedCall(other.to_string())),
    }
}

/// Count of non-null points per group bucket. Always integer output.
pub fn new_count_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn count<T: PointValue>(ctx: &GroupContext, points: Vec<Point<T>>) -> Vec<IntegerPoint> {
        let n = points.iter().filter(|p| !p.nil).count() as i64;
        vec![ctx.scalar(n)]
    }
    Ok(TypedIterator::Integer(match input {
        TypedIterator::Float(itr) => reduce_iterator(itr, opt, count),
        TypedIterator::Integer(itr) => reduce_iterator(itr, opt, count),
        TypedIterator::Str(itr) => reduce_iterator(itr, opt, count),
        TypedIterator::Boolean(itr) => reduce_iterator(itr, opt, count),
    }))
}

fn select_by<T: PointValue>(
    points: Vec<Point<T>>,
    better: impl Fn(&Point<T>, &Point<T>) -> bool,
) -> Option<Point<T>> {
    let mut best: Option<Point<T>> = None;
    for p in points {
        if p.nil {
            continue;
        }
        match &best {
            Some(b) if !better(&p, b) => {}
            _ => best = Some(p),
        }
    }
    best
}

/// Emit the selected point with the group's identity but its own time.
fn selector_output<T: PointValue>(ctx: &GroupContext, selected: Option<Point<T>>) -> Vec<Point<T>> {
    match selected {
        Some(p) => vec![Point {
            name: ctx.name.clone(),
            tags: ctx.tags.clone(),
            time: p.time,
            value: p.value,
            nil: false,
            aux: p.aux,
        }],
        None => Vec::new(),
    }
}

/// Minimum value per group bucket.
pub fn new_min_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    match input {
        TypedIterator::Float(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            |ctx, points| selector_output(ctx, select_by(points, |p, b| p.value < b.value)),
        ))),
        TypedIterator::Integer(itr) => Ok(TypedIterator::Integer(reduce_iterator(
            itr,
            opt,
            |ctx, points| selector_output(ctx, select_by(points, |p, b| p.value < b.value)),
        ))),
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("min", found))
        }
    }
}

/// Maximum value per group bucket.
pub fn new_max_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    match input {
        TypedIterator::Float(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            |ctx, points| selector_output(ctx, select_by(points, |p, b| p.value > b.value)),
        ))),
        TypedIterator::Integer(itr) => Ok(TypedIterator::Integer(reduce_iterator(
            itr,
            opt,
            |ctx, points| selector_output(ctx, select_by(points, |p, b| p.value > b.value)),
        ))),
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("max", found))
        }
    }
}

/// Sum of non-null values per group bucket. Integer sums wrap.
pub fn new_sum_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn float_sum(ctx: &GroupContext, points: Vec<FloatPoint>) -> Vec<FloatPoint> {
        let mut sum = 0.0;
        let mut any = false;
        for p in &points {
            if !p.nil {
                sum += p.value;
                any = true;
            }
        }
        vec![if any { ctx.scalar(sum) } else { ctx.null() }]
    }
    fn integer_sum(ctx: &GroupContext, points: Vec<IntegerPoint>) -> Vec<IntegerPoint> {
        let mut sum = 0i64;
        let mut any = false;
        for p in &points {
            if !p.nil {
                sum = sum.wrapping_add(p.value);
                any = true;
            }
        }
        vec![if any { ctx.scalar(sum) } else { ctx.null() }]
    }
    match input {
        TypedIterator::Float(itr) => Ok(TypedIterator::Float(reduce_iterator(itr, opt, float_sum))),
        TypedIterator::Integer(itr) => {
            Ok(TypedIterator::Integer(reduce_iterator(itr, opt, integer_sum)))
        }
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("sum", found))
        }
    }
}

/// Earliest point per group bucket.
pub fn new_first_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn first<T: PointValue>(ctx: &GroupContext, points: Vec<Point<T>>) -> Vec<Point<T>> {
        selector_output(ctx, select_by(points, |p, b| p.time < b.time))
    }
    Ok(match input {
        TypedIterator::Float(itr) => TypedIterator::Float(reduce_iterator(itr, opt, first)),
        TypedIterator::Integer(itr) => TypedIterator::Integer(reduce_iterator(itr, opt, first)),
        TypedIterator::Str(itr) => TypedIterator::Str(reduce_iterator(itr, opt, first)),
        TypedIterator::Boolean(itr) => TypedIterator::Boolean(reduce_iterator(itr, opt, first)),
    })
}

/// Latest point per group bucket.
pub fn new_last_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn last<T: PointValue>(ctx: &GroupContext, points: Vec<Point<T>>) -> Vec<Point<T>> {
        selector_output(ctx, select_by(points, |p, b| p.time > b.time))
    }
    Ok(match input {
        TypedIterator::Float(itr) => TypedIterator::Float(reduce_iterator(itr, opt, last)),
        TypedIterator::Integer(itr) => TypedIterator::Integer(reduce_iterator(itr, opt, last)),
        TypedIterator::Str(itr) => TypedIterator::Str(reduce_iterator(itr, opt, last)),
        TypedIterator::Boolean(itr) => TypedIterator::Boolean(reduce_iterator(itr, opt, last)),
    })
}

/// Arithmetic mean per group bucket. Always float output.
pub fn new_mean_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn mean<T: PointValue>(
        to_f64: impl Fn(&T) -> f64 + Copy + Send + 'static,
    ) -> impl FnMut(&GroupContext, Vec<Point<T>>) -> Vec<FloatPoint> + Send + 'static {
        move |ctx, points| {
            let mut sum = 0.0;
            let mut n = 0u64;
            for p in &points {
                if !p.nil {
                    sum += to_f64(&p.value);
                    n += 1;
                }
            }
            vec![if n > 0 {
                ctx.scalar(sum / n as f64)
            } else {
                ctx.null()
            }]
        }
    }
    match input {
        TypedIterator::Float(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            mean(|v: &f64| *v),
        ))),
        TypedIterator::Integer(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            mean(|v: &i64| *v as f64),
        ))),
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("mean", found))
        }
    }
}

// ============================================================================
// Exact aggregates
// ============================================================================

/// Exact median per group bucket. Always float output; even cardinality
/// averages the two middle values.
pub fn new_median_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn median<T: PointValue>(
        to_f64: impl Fn(&T) -> f64 + Copy + Send + 'static,
    ) -> impl FnMut(&GroupContext, Vec<Point<T>>) -> Vec<FloatPoint> + Send + 'static {
        move |ctx, points| {
            let mut values: Vec<f64> = points
                .iter()
                .filter(|p| !p.nil)
                .map(|p| to_f64(&p.value))
                .collect();
            if values.is_empty() {
                return vec![ctx.null()];
            }
            values.sort_by(f64::total_cmp);
            let mid = values.len() / 2;
            let median = if values.len() % 2 == 1 {
                values[mid]
            } else {
                (values[mid - 1] + values[mid]) / 2.0
            };
            vec![ctx.scalar(median)]
        }
    }
    match input {
        TypedIterator::Float(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            median(|v: &f64| *v),
        ))),
        TypedIterator::Integer(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            median(|v: &i64| *v as f64),
        ))),
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("median", found))
        }
    }
}

/// Sample standard deviation per group bucket. Always float output; groups
/// with fewer than two values emit null.
pub fn new_stddev_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn stddev<T: PointValue>(
        to_f64: impl Fn(&T) -> f64 + Copy + Send + 'static,
    ) -> impl FnMut(&GroupContext, Vec<Point<T>>) -> Vec<FloatPoint> + Send + 'static {
        move |ctx, points| {
            // Welford's online update keeps the variance numerically stable.
            let mut count = 0u64;
            let mut mean = 0.0;
            let mut m2 = 0.0;
            for p in &points {
                if p.nil {
                    continue;
                }
                let value = to_f64(&p.value);
                count += 1;
                let delta = value - mean;
                mean += delta / count as f64;
                m2 += delta * (value - mean);
            }
            vec![if count < 2 {
                ctx.null()
            } else {
                ctx.scalar((m2 / (count - 1) as f64).sqrt())
            }]
        }
    }
    match input {
        TypedIterator::Float(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            stddev(|v: &f64| *v),
        ))),
        TypedIterator::Integer(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            stddev(|v: &i64| *v as f64),
        ))),
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("stddev", found))
        }
    }
}

/// Difference between the maximum and minimum value per group bucket.
pub fn new_spread_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn float_spread(ctx: &GroupContext, points: Vec<FloatPoint>) -> Vec<FloatPoint> {
        let mut bounds: Option<(f64, f64)> = None;
        for p in &points {
            if p.nil {
                continue;
            }
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(p.value), hi.max(p.value)),
                None => (p.value, p.value),
            });
        }
        vec![match bounds {
            Some((lo, hi)) => ctx.scalar(hi - lo),
            None => ctx.null(),
        }]
    }
    fn integer_spread(ctx: &GroupContext, points: Vec<IntegerPoint>) -> Vec<IntegerPoint> {
        let mut bounds: Option<(i64, i64)> = None;
        for p in &points {
            if p.nil {
                continue;
            }
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(p.value), hi.max(p.value)),
                None => (p.value, p.value),
            });
        }
        vec![match bounds {
            Some((lo, hi)) => ctx.scalar(hi.wrapping_sub(lo)),
            None => ctx.null(),
        }]
    }
    match input {
        TypedIterator::Float(itr) => {
            Ok(TypedIterator::Float(reduce_iterator(itr, opt, float_spread)))
        }
        TypedIterator::Integer(itr) => Ok(TypedIterator::Integer(reduce_iterator(
            itr,
            opt,
            integer_spread,
        ))),
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("spread", found))
        }
    }
}

/// Order-preserving distinct values per group bucket, stamped at the bucket
/// start.
pub fn new_distinct_iterator(input: TypedIterator, opt: &IteratorOptions) -> Result<TypedIterator> {
    fn distinct<T: PointValue>(ctx: &GroupContext, points: Vec<Point<T>>) -> Vec<Point<T>> {
        let mut seen: Vec<T> = Vec::new();
        for p in points {
            if p.nil || seen.contains(&p.value) {
                continue;
            }
            seen.push(p.value);
        }
        seen.into_iter().map(|v| ctx.scalar(v)).collect()
    }
    Ok(match input {
        TypedIterator::Float(itr) => TypedIterator::Float(reduce_iterator(itr, opt, distinct)),
        TypedIterator::Integer(itr) => TypedIterator::Integer(reduce_iterator(itr, opt, distinct)),
        TypedIterator::Str(itr) => TypedIterator::Str(reduce_iterator(itr, opt, distinct)),
        TypedIterator::Boolean(itr) => TypedIterator::Boolean(reduce_iterator(itr, opt, distinct)),
    })
}

/// Nearest-rank percentile per group bucket.
///
/// The percentile must already be validated to lie in `(0, 100]`.
pub fn new_percentile_iterator(
    input: TypedIterator,
    opt: &IteratorOptions,
    percentile: f64,
) -> Result<TypedIterator> {
    fn rank(percentile: f64, n: usize) -> usize {
        let r = (percentile / 100.0 * n as f64).ceil() as usize;
        r.clamp(1, n) - 1
    }
    fn select<T: PointValue>(
        percentile: f64,
        cmp: impl Fn(&T, &T) -> Ordering + Copy + Send + 'static,
    ) -> impl FnMut(&GroupContext, Vec<Point<T>>) -> Vec<Point<T>> + Send + 'static {
        move |ctx, points| {
            let mut candidates: Vec<Point<T>> = points.into_iter().filter(|p| !p.nil).collect();
            if candidates.is_empty() {
                return Vec::new();
            }
            candidates.sort_by(|a, b| cmp(&a.value, &b.value));
            let selected = candidates.swap_remove(rank(percentile, candidates.len()));
            selector_output(ctx, Some(selected))
        }
    }
    match input {
        TypedIterator::Float(itr) => Ok(TypedIterator::Float(reduce_iterator(
            itr,
            opt,
            select(percentile, |a: &f64, b: &f64| a.total_cmp(b)),
        ))),
        TypedIterator::Integer(itr) => Ok(TypedIterator::Integer(reduce_iterator(
            itr,
            opt,
            select(percentile, |a: &i64, b: &i64| a.cmp(b)),
        ))),
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input("percentile", found))
        }
    }
}

// ============================================================================
// Top / bottom selectors
// ============================================================================

/// Ordering over auxiliary tag values, used as the final tie-breaker.
fn aux_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn selector_tie_break<T: PointValue>(a: &Point<T>, b: &Point<T>, tag_idx: &[usize]) -> Ordering {
    a.time.cmp(&b.time).then_with(|| {
        for &i in tag_idx {
            let av = a.aux.get(i).unwrap_or(&Value::Null);
            let bv = b.aux.get(i).unwrap_or(&Value::Null);
            let ord = aux_cmp(av, bv);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    })
}

fn select_extremes<T: PointValue>(
    points: Vec<Point<T>>,
    n: usize,
    tag_idx: &[usize],
    cmp: impl Fn(&T, &T) -> Ordering,
    largest: bool,
) -> Vec<Point<T>> {
    let mut candidates: Vec<Point<T>> = points.into_iter().filter(|p| !p.nil).collect();
    candidates.sort_by(|a, b| {
        let value_ord = if largest {
            cmp(&b.value, &a.value)
        } else {
            cmp(&a.value, &b.value)
        };
        value_ord.then_with(|| selector_tie_break(a, b, tag_idx))
    });
    candidates.truncate(n);
    // Selected points are re-emitted in time order with their original
    // identity intact.
    candidates.sort_by_key(|p| p.time);
    candidates
}

fn new_extremes_iterator(
    input: TypedIterator,
    opt: &IteratorOptions,
    n: usize,
    tag_idx: Vec<usize>,
    largest: bool,
    call: &'static str,
) -> Result<TypedIterator> {
    match input {
        TypedIterator::Float(itr) => {
            let f = move |_: &GroupContext, points: Vec<FloatPoint>| {
                select_extremes(points, n, &tag_idx, |a: &f64, b: &f64| a.total_cmp(b), largest)
            };
            Ok(TypedIterator::Float(reduce_iterator(itr, opt, f)))
        }
        TypedIterator::Integer(itr) => {
            let f = move |_: &GroupContext, points: Vec<IntegerPoint>| {
                select_extremes(points, n, &tag_idx, |a: &i64, b: &i64| a.cmp(b), largest)
            };
            Ok(TypedIterator::Integer(reduce_iterator(itr, opt, f)))
        }
        mut other => {
            let found = other.data_type();
            other.close();
            Err(unsupported_input(call, found))
        }
    }
}

/// The `n` greatest values per group bucket, ties broken by time then by the
/// interior tag values at `tag_idx`.
///
/// Buckets are applied inside the selector itself; the planner must not add
/// an interval wrapper on top.
pub fn new_top_iterator(
    input: TypedIterator,
    opt: &IteratorOptions,
    n: usize,
    tag_idx: Vec<usize>,
) -> Result<TypedIterator> {
    new_extremes_iterator(input, opt, n, tag_idx, true, "top")
}

/// The `n` least values per group bucket; see [`new_top_iterator`].
pub fn new_bottom_iterator(
    input: TypedIterator,
    opt: &IteratorOptions,
    n: usize,
    tag_idx: Vec<usize>,
) -> Result<TypedIterator> {
    new_extremes_iterator(input, opt, n, tag_idx, false, "bottom")
}

// ============================================================================
// Derivative
// ============================================================================

/// Streaming rate of change between successive points of a series.
///
/// Emits `(v - v_prev) * unit / (t - t_prev)` at each point after the first of
/// its series. Null inputs are skipped. Output is always float.
pub struct DerivativeIterator {
    input: BoxedIterator<f64>,
    unit: i64,
    non_negative: bool,
    prev: Option<(String, i64, f64)>,
}

impl PointIterator for DerivativeIterator {
    type Value = f64;

    fn next_point(&mut self) -> Result<Option<FloatPoint>> {
        while let Some(p) = self.input.next_point()? {
            if p.nil {
                continue;
            }
            let key = p.series_key();
            let previous = match &self.prev {
                Some((prev_key, time, value)) if *prev_key == key => Some((*time, *value)),
                _ => None,
            };
            self.prev = Some((key, p.time, p.value));

            let (prev_time, prev_value) = match previous {
                Some(prev) => prev,
                // The leading point of each series is consumed, not emitted.
                None => continue,
            };
            let dt = p.time - prev_time;
            let value = if dt == 0 {
                0.0
            } else {
                (p.value - prev_value) * self.unit as f64 / dt as f64
            };
            if self.non_negative && value < 0.0 {
                continue;
            }
            return Ok(Some(Point {
                name: p.name,
                tags: p.tags,
                time: p.time,
                value,
                nil: false,
                aux: p.aux,
            }));
        }
        Ok(None)
    }

    fn stats(&self) -> IteratorStats {
        self.input.stats()
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Build a derivative iterator over any numeric input.
pub fn new_derivative_iterator(
    input: TypedIterator,
    unit: i64,
    non_negative: bool,
) -> Result<TypedIterator> {
    let input = input.into_float("LHS")?;
    Ok(TypedIterator::Float(Box::new(DerivativeIterator {
        input,
        unit,
        non_negative,
        prev: None,
    })))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use crate::iterator::VecIterator;

    fn float_input(points: Vec<FloatPoint>) -> TypedIterator {
        TypedIterator::Float(Box::new(VecIterator::new(points)))
    }

    fn int_input(points: Vec<IntegerPoint>) -> TypedIterator {
        TypedIterator::Integer(Box::new(VecIterator::new(points)))
    }

    fn drain<T: PointValue>(mut itr: BoxedIterator<T>) -> Vec<Point<T>> {
        let mut out = Vec::new();
        while let Some(p) = itr.next_point().unwrap() {
            out.push(p);
        }
        out
    }

    fn drain_float(itr: TypedIterator) -> Vec<FloatPoint> {
        match itr {
            TypedIterator::Float(itr) => drain(itr),
            other => panic!("expected float iterator, got {}", other.data_type()),
        }
    }

    fn drain_int(itr: TypedIterator) -> Vec<IntegerPoint> {
        match itr {
            TypedIterator::Integer(itr) => drain(itr),
            other => panic!("expected integer iterator, got {}", other.data_type()),
        }
    }

    fn windowed(duration: i64) -> IteratorOptions {
        IteratorOptions {
            interval: Interval::new(duration, 0),
            start_time: 0,
            end_time: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_sum_per_bucket() {
        let opt = windowed(10);
        let input = float_input(vec![
            FloatPoint::new("s1", 0, 1.0),
            FloatPoint::new("s1", 5, 2.0),
            FloatPoint::new("s1", 10, 3.0),
            FloatPoint::new("s1", 15, 4.0),
        ]);
        let out = drain_float(new_sum_iterator(input, &opt).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].time, out[0].value), (0, 3.0));
        assert_eq!((out[1].time, out[1].value), (10, 7.0));
    }

    #[test]
    fn test_count_is_integer_and_skips_nulls() {
        let opt = windowed(10);
        let input = float_input(vec![
            FloatPoint::new("s1", 0, 1.0),
            FloatPoint::null("s1", Tags::new(), 1),
            FloatPoint::new("s1", 2, 2.0),
        ]);
        let out = drain_int(new_count_iterator(input, &opt).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 2);
    }

    #[test]
    fn test_mean_integer_input_promotes() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let input = int_input(vec![
            IntegerPoint::new("m", 1, 10),
            IntegerPoint::new("m", 2, 20),
        ]);
        let out = drain_float(new_mean_iterator(input, &opt).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 15.0);
        assert_eq!(out[0].time, 0);
    }

    #[test]
    fn test_grouping_by_dimension() {
        let opt = IteratorOptions {
            dimensions: vec!["host".to_string()],
            start_time: 0,
            ..Default::default()
        };
        let input = float_input(vec![
            FloatPoint::new("m", 1, 1.0).with_tags(Tags::from_pairs([("host", "a")])),
            FloatPoint::new("m", 2, 2.0).with_tags(Tags::from_pairs([("host", "b")])),
            FloatPoint::new("m", 3, 3.0).with_tags(Tags::from_pairs([("host", "a")])),
        ]);
        let out = drain_float(new_sum_iterator(input, &opt).unwrap());
        assert_eq!(out.len(), 2);
        let mut by_host: Vec<(String, f64)> = out
            .iter()
            .map(|p| (p.tags.get("host").unwrap().to_string(), p.value))
            .collect();
        by_host.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(by_host, vec![("a".to_string(), 4.0), ("b".to_string(), 2.0)]);
    }

    #[test]
    fn test_min_max_preserve_time() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let points = vec![
            FloatPoint::new("m", 1, 5.0),
            FloatPoint::new("m", 2, 1.0),
            FloatPoint::new("m", 3, 9.0),
        ];
        let out = drain_float(new_min_iterator(float_input(points.clone()), &opt).unwrap());
        assert_eq!((out[0].time, out[0].value), (2, 1.0));
        let out = drain_float(new_max_iterator(float_input(points), &opt).unwrap());
        assert_eq!((out[0].time, out[0].value), (3, 9.0));
    }

    #[test]
    fn test_first_last() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let points = vec![
            FloatPoint::new("m", 3, 30.0),
            FloatPoint::new("m", 1, 10.0),
            FloatPoint::new("m", 2, 20.0),
        ];
        let out = drain_float(new_first_iterator(float_input(points.clone()), &opt).unwrap());
        assert_eq!((out[0].time, out[0].value), (1, 10.0));
        let out = drain_float(new_last_iterator(float_input(points), &opt).unwrap());
        assert_eq!((out[0].time, out[0].value), (3, 30.0));
    }

    #[test]
    fn test_median_even_and_odd() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let odd = vec![
            FloatPoint::new("m", 1, 1.0),
            FloatPoint::new("m", 2, 9.0),
            FloatPoint::new("m", 3, 3.0),
        ];
        let out = drain_float(new_median_iterator(float_input(odd), &opt).unwrap());
        assert_eq!(out[0].value, 3.0);

        let even = vec![
            FloatPoint::new("m", 1, 1.0),
            FloatPoint::new("m", 2, 3.0),
            FloatPoint::new("m", 3, 5.0),
            FloatPoint::new("m", 4, 9.0),
        ];
        let out = drain_float(new_median_iterator(float_input(even), &opt).unwrap());
        assert_eq!(out[0].value, 4.0);
    }

    #[test]
    fn test_stddev_sample() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let points: Vec<FloatPoint> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .iter()
            .enumerate()
            .map(|(i, &v)| FloatPoint::new("m", i as i64, v))
            .collect();
        let out = drain_float(new_stddev_iterator(float_input(points), &opt).unwrap());
        // Sample stddev of the classic Welford data set.
        assert!((out[0].value - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_stddev_single_point_is_null() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let out = drain_float(
            new_stddev_iterator(float_input(vec![FloatPoint::new("m", 1, 2.0)]), &opt).unwrap(),
        );
        assert!(out[0].nil);
    }

    #[test]
    fn test_spread() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let input = int_input(vec![
            IntegerPoint::new("m", 1, 3),
            IntegerPoint::new("m", 2, 11),
            IntegerPoint::new("m", 3, 7),
        ]);
        let out = drain_int(new_spread_iterator(input, &opt).unwrap());
        assert_eq!(out[0].value, 8);
    }

    #[test]
    fn test_distinct_preserves_order_within_bucket() {
        let opt = windowed(100);
        let input = float_input(vec![
            FloatPoint::new("m", 1, 2.0),
            FloatPoint::new("m", 2, 1.0),
            FloatPoint::new("m", 3, 2.0),
            FloatPoint::new("m", 4, 3.0),
        ]);
        let out = drain_float(new_distinct_iterator(input, &opt).unwrap());
        let values: Vec<f64> = out.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 1.0, 3.0]);
        assert!(out.iter().all(|p| p.time == 0));
    }

    #[test]
    fn test_count_distinct_composition() {
        let opt = windowed(10);
        let input = int_input(vec![
            IntegerPoint::new("m", 0, 1),
            IntegerPoint::new("m", 1, 1),
            IntegerPoint::new("m", 2, 2),
            IntegerPoint::new("m", 10, 5),
            IntegerPoint::new("m", 11, 5),
        ]);
        let distinct = new_distinct_iterator(input, &opt).unwrap();
        let out = drain_int(new_count_iterator(distinct, &opt).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].time, out[0].value), (0, 2));
        assert_eq!((out[1].time, out[1].value), (10, 1));
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let points: Vec<IntegerPoint> = (1..=10)
            .map(|i| IntegerPoint::new("m", i, i * 10))
            .collect();
        let out =
            drain_int(new_percentile_iterator(int_input(points), &opt, 90.0).unwrap());
        assert_eq!(out[0].value, 90);
    }

    #[test]
    fn test_top_selects_and_reorders_by_time() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let input = float_input(vec![
            FloatPoint::new("m", 1, 5.0),
            FloatPoint::new("m", 2, 9.0),
            FloatPoint::new("m", 3, 7.0),
        ]);
        let out = drain_float(new_top_iterator(input, &opt, 2, Vec::new()).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].time, out[0].value), (2, 9.0));
        assert_eq!((out[1].time, out[1].value), (3, 7.0));
    }

    #[test]
    fn test_bottom_with_value_ties_prefers_earlier_time() {
        let opt = IteratorOptions {
            start_time: 0,
            ..Default::default()
        };
        let input = float_input(vec![
            FloatPoint::new("m", 3, 1.0),
            FloatPoint::new("m", 1, 1.0),
            FloatPoint::new("m", 2, 4.0),
        ]);
        let out = drain_float(new_bottom_iterator(input, &opt, 1, Vec::new()).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, 1);
    }

    #[test]
    fn test_top_internal_bucketing() {
        let opt = windowed(10);
        let input = float_input(vec![
            FloatPoint::new("m", 1, 5.0),
            FloatPoint::new("m", 2, 9.0),
            FloatPoint::new("m", 11, 3.0),
            FloatPoint::new("m", 12, 8.0),
        ]);
        let out = drain_float(new_top_iterator(input, &opt, 1, Vec::new()).unwrap());
        // One winner per bucket, original times preserved.
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].time, out[0].value), (2, 9.0));
        assert_eq!((out[1].time, out[1].value), (12, 8.0));
    }

    #[test]
    fn test_derivative() {
        let input = float_input(vec![
            FloatPoint::new("m", 0, 10.0),
            FloatPoint::new("m", 4, 18.0),
            FloatPoint::new("m", 8, 14.0),
        ]);
        let out = drain_float(new_derivative_iterator(input, 4, false).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].time, out[0].value), (4, 8.0));
        assert_eq!((out[1].time, out[1].value), (8, -4.0));
    }

    #[test]
    fn test_non_negative_derivative_drops_negatives() {
        let input = float_input(vec![
            FloatPoint::new("m", 0, 10.0),
            FloatPoint::new("m", 1, 5.0),
            FloatPoint::new("m", 2, 11.0),
        ]);
        let out = drain_float(new_derivative_iterator(input, 1, true).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].time, out[0].value), (2, 6.0));
    }

    #[test]
    fn test_derivative_resets_per_series() {
        let mut points = vec![
            FloatPoint::new("a", 0, 1.0),
            FloatPoint::new("a", 1, 2.0),
        ];
        points.push(FloatPoint::new("b", 0, 100.0));
        points.push(FloatPoint::new("b", 1, 90.0));
        let out = drain_float(new_derivative_iterator(float_input(points), 1, false).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].name.as_str(), out[0].value), ("a", 1.0));
        assert_eq!((out[1].name.as_str(), out[1].value), ("b", -10.0));
    }

    #[test]
    fn test_call_iterator_dispatch() {
        let opt = IteratorOptions {
            expr: Some(Expr::call(
                "sum",
                vec![Expr::var_ref("v", DataType::Float)],
            )),
            start_time: 0,
            ..Default::default()
        };
        let input = float_input(vec![
            FloatPoint::new("m", 1, 1.5),
            FloatPoint::new("m", 2, 2.5),
        ]);
        let out = drain_float(new_call_iterator(input, &opt).unwrap());
        assert_eq!(out[0].value, 4.0);
    }

    #[test]
    fn test_call_iterator_rejects_unknown() {
        let opt = IteratorOptions {
            expr: Some(Expr::call("exp", vec![])),
            ..Default::default()
        };
        let err = new_call_iterator(float_input(vec![]), &opt).unwrap_err();
        assert_eq!(err.to_string(), "unsupported call: exp");
    }
}

//! The streaming iterator capability and common stream-shaping iterators
//!
//! Every node of a query plan is a [`PointIterator`]: a pull-based,
//! cancellable stream of typed points. Iterators are composed bottom-up from
//! storage leaves and drained top-down by consumers; each node owns its
//! upstreams and closes them transitively.
//!
//! The four concrete point types form a closed set, so trees of mixed type are
//! passed around as the [`TypedIterator`] sum. This module also provides the
//! outer stream-shaping layers (limit/offset, dedupe), the integer-to-float
//! cast, the single-point pushback buffer used by windowed consumers, and the
//! storage-facing [`IteratorCreator`] capability.

use crate::error::{QueryError, Result};
use crate::options::IteratorOptions;
use crate::point::{DataType, Point, PointValue, Tags};
use std::collections::{HashMap, HashSet};
use std::mem;

// ============================================================================
// Iterator capability
// ============================================================================

/// Cumulative counters describing how much data an iterator has scanned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IteratorStats {
    /// Number of values scanned.
    pub point_n: u64,
    /// Approximate number of bytes scanned.
    pub byte_n: u64,
}

impl IteratorStats {
    /// Accumulate another stats record into this one.
    pub fn add(&mut self, other: IteratorStats) {
        self.point_n += other.point_n;
        self.byte_n += other.byte_n;
    }
}

/// A pull-based stream of typed points.
///
/// `next_point` may block on upstream reads. `close` is idempotent, releases
/// upstream resources, and must be safe to call before end-of-stream;
/// `stats` stays readable after close. Callers own returned points outright.
pub trait PointIterator: Send {
    /// The value type of points produced by this iterator.
    type Value: PointValue;

    /// Pull the next point, or `None` at end-of-stream.
    fn next_point(&mut self) -> Result<Option<Point<Self::Value>>>;

    /// Cumulative scan counters for this subtree.
    fn stats(&self) -> IteratorStats {
        IteratorStats::default()
    }

    /// Release this iterator and its upstreams. Idempotent.
    fn close(&mut self) {}
}

/// A boxed iterator of a statically known point type.
pub type BoxedIterator<T> = Box<dyn PointIterator<Value = T>>;

// ============================================================================
// Typed iterator sum
// ============================================================================

/// An iterator of one of the four point types.
pub enum TypedIterator {
    /// Stream of float points.
    Float(BoxedIterator<f64>),
    /// Stream of integer points.
    Integer(BoxedIterator<i64>),
    /// Stream of string points.
    Str(BoxedIterator<String>),
    /// Stream of boolean points.
    Boolean(BoxedIterator<bool>),
}

impl std::fmt::Debug for TypedIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedIterator::Float(_) => write!(f, "TypedIterator::Float(..)"),
            TypedIterator::Integer(_) => write!(f, "TypedIterator::Integer(..)"),
            TypedIterator::Str(_) => write!(f, "TypedIterator::Str(..)"),
            TypedIterator::Boolean(_) => write!(f, "TypedIterator::Boolean(..)"),
        }
    }
}

impl TypedIterator {
    /// The point type of this iterator.
    pub fn data_type(&self) -> DataType {
        match self {
            TypedIterator::Float(_) => DataType::Float,
            TypedIterator::Integer(_) => DataType::Integer,
            TypedIterator::Str(_) => DataType::String,
            TypedIterator::Boolean(_) => DataType::Boolean,
        }
    }

    /// Cumulative scan counters for the subtree.
    pub fn stats(&self) -> IteratorStats {
        match self {
            TypedIterator::Float(itr) => itr.stats(),
            TypedIterator::Integer(itr) => itr.stats(),
            TypedIterator::Str(itr) => itr.stats(),
            TypedIterator::Boolean(itr) => itr.stats(),
        }
    }

    /// Close the subtree. Idempotent.
    pub fn close(&mut self) {
        match self {
            TypedIterator::Float(itr) => itr.close(),
            TypedIterator::Integer(itr) => itr.close(),
            TypedIterator::Str(itr) => itr.close(),
            TypedIterator::Boolean(itr) => itr.close(),
        }
    }

    /// View this iterator as a float stream.
    ///
    /// Integer streams are transparently wrapped in a cast; other types close
    /// themselves and report a type mismatch for the given operand side.
    pub fn into_float(self, side: &'static str) -> Result<BoxedIterator<f64>> {
        match self {
            TypedIterator::Float(itr) => Ok(itr),
            TypedIterator::Integer(itr) => Ok(Box::new(CastIterator::new(itr))),
            mut other => {
                let found = other.data_type();
                other.close();
                Err(QueryError::TypeMismatch {
                    side,
                    found,
                    want: DataType::Float,
                })
            }
        }
    }

    /// Extract the integer stream, closing and reporting a mismatch otherwise.
    pub fn into_integer(self, side: &'static str) -> Result<BoxedIterator<i64>> {
        match self {
            TypedIterator::Integer(itr) => Ok(itr),
            mut other => {
                let found = other.data_type();
                other.close();
                Err(QueryError::TypeMismatch {
                    side,
                    found,
                    want: DataType::Integer,
                })
            }
        }
    }
}

/// Close every already-built iterator in a partially constructed result set.
pub fn close_all(itrs: &mut [Option<TypedIterator>]) {
    for itr in itrs.iter_mut().flatten() {
        itr.close();
    }
}

// ============================================================================
// Storage capability
// ============================================================================

/// The series identity: measurement name plus tag set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Measurement name.
    pub name: String,
    /// Tag set.
    pub tags: Tags,
}

impl SeriesKey {
    /// Create a series key.
    pub fn new(name: impl Into<String>, tags: Tags) -> Self {
        SeriesKey {
            name: name.into(),
            tags,
        }
    }

    /// Canonical string encoding of the key.
    pub fn key(&self) -> String {
        let mut s = String::with_capacity(self.name.len() + 1);
        s.push_str(&self.name);
        s.push('\u{0}');
        s.push_str(&self.tags.key());
        s
    }
}

/// Capability to materialize base iterators from storage.
///
/// `create_iterator` receives options whose `expr` is either a raw field
/// reference or an aggregate call pushed down to storage. Implementations
/// honour the time bounds, dimensions, and auxiliary field list in the
/// options. The aggregation half of a pushed-down call is available to
/// implementors as [`crate::aggregate::new_call_iterator`].
pub trait IteratorCreator {
    /// Materialize a leaf iterator for `opt.expr`.
    fn create_iterator(&self, opt: &IteratorOptions) -> Result<TypedIterator>;

    /// Enumerate the series matched by the options, sorted by key.
    fn series_keys(&self, opt: &IteratorOptions) -> Result<Vec<SeriesKey>>;

    /// The field types and tag dimensions present across the given sources.
    fn field_dimensions(
        &self,
        sources: &[crate::ast::Measurement],
    ) -> Result<(HashMap<String, DataType>, HashSet<String>)>;
}

// ============================================================================
// In-memory iterator
// ============================================================================

/// An iterator over a pre-built list of points.
///
/// The standard leaf for in-memory storage backends and tests.
pub struct VecIterator<T: PointValue> {
    points: std::vec::IntoIter<Point<T>>,
    stats: IteratorStats,
}

impl<T: PointValue> VecIterator<T> {
    /// Create an iterator that yields `points` in order.
    pub fn new(points: Vec<Point<T>>) -> Self {
        let stats = IteratorStats {
            point_n: points.len() as u64,
            byte_n: points
                .iter()
                .map(|p| (p.name.len() + mem::size_of::<T>()) as u64)
                .sum(),
        };
        VecIterator {
            points: points.into_iter(),
            stats,
        }
    }
}

impl<T: PointValue> PointIterator for VecIterator<T> {
    type Value = T;

    fn next_point(&mut self) -> Result<Option<Point<T>>> {
        Ok(self.points.next())
    }

    fn stats(&self) -> IteratorStats {
        self.stats
    }

    fn close(&mut self) {
        self.points = Vec::new().into_iter();
    }
}

// ============================================================================
// Pushback buffer
// ============================================================================

/// Wraps an iterator with a single-point pushback buffer.
///
/// Windowed consumers read one point past their window boundary and push it
/// back for the next window.
pub struct BufIterator<T: PointValue> {
    input: BoxedIterator<T>,
    buf: Option<Point<T>>,
}

impl<T: PointValue> BufIterator<T> {
    /// Wrap an iterator.
    pub fn new(input: BoxedIterator<T>) -> Self {
        BufIterator { input, buf: None }
    }

    /// Pull the next point, consuming any pushed-back point first.
    pub fn next_point(&mut self) -> Result<Option<Point<T>>> {
        if let Some(p) = self.buf.take() {
            return Ok(Some(p));
        }
        self.input.next_point()
    }

    /// Push a point back; it is returned by the next `next_point` call.
    pub fn unread(&mut self, p: Point<T>) {
        debug_assert!(self.buf.is_none());
        self.buf = Some(p);
    }

    /// Cumulative scan counters of the wrapped iterator.
    pub fn stats(&self) -> IteratorStats {
        self.input.stats()
    }

    /// Close the wrapped iterator.
    pub fn close(&mut self) {
        self.buf = None;
        self.input.close();
    }
}

// ============================================================================
// Integer-to-float cast
// ============================================================================

/// Transparently casts an integer stream to floats.
pub struct CastIterator {
    input: BoxedIterator<i64>,
}

impl CastIterator {
    /// Wrap an integer iterator.
    pub fn new(input: BoxedIterator<i64>) -> Self {
        CastIterator { input }
    }
}

impl PointIterator for CastIterator {
    type Value = f64;

    fn next_point(&mut self) -> Result<Option<Point<f64>>> {
        Ok(self.input.next_point()?.map(|p| Point {
            name: p.name,
            tags: p.tags,
            time: p.time,
            value: p.value as f64,
            nil: p.nil,
            aux: p.aux,
        }))
    }

    fn stats(&self) -> IteratorStats {
        self.input.stats()
    }

    fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Limit / offset
// ============================================================================

/// Applies a per-series limit and offset to a stream.
///
/// The offset/limit window restarts whenever the series changes, so each
/// series independently contributes at most `limit` points.
pub struct LimitIterator<T: PointValue> {
    input: BoxedIterator<T>,
    limit: usize,
    offset: usize,
    series_key: Option<String>,
    n: usize,
}

impl<T: PointValue> LimitIterator<T> {
    /// Wrap an iterator with the limit/offset from the options.
    pub fn new(input: BoxedIterator<T>, opt: &IteratorOptions) -> Self {
        LimitIterator {
            input,
            limit: opt.limit,
            offset: opt.offset,
            series_key: None,
            n: 0,
        }
    }
}

impl<T: PointValue> PointIterator for LimitIterator<T> {
    type Value = T;

    fn next_point(&mut self) -> Result<Option<Point<T>>> {
        while let Some(p) = self.input.next_point()? {
            let key = p.series_key();
            if self.series_key.as_deref() != Some(key.as_str()) {
                self.series_key = Some(key);
                self.n = 0;
            }
            self.n += 1;

            if self.n <= self.offset {
                continue;
            }
            if self.limit > 0 && self.n > self.offset + self.limit {
                // Keep draining: a later series restarts the window.
                continue;
            }
            return Ok(Some(p));
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

// ============================================================================
// Dedupe
// ============================================================================

/// Drops points identical to one already emitted.
///
/// Intended for small cardinality streams; the set of seen encodings is held
/// in memory.
pub struct DedupeIterator<T: PointValue> {
    input: BoxedIterator<T>,
    seen: HashSet<String>,
}

impl<T: PointValue> DedupeIterator<T> {
    /// Wrap an iterator.
    pub fn new(input: BoxedIterator<T>) -> Self {
        DedupeIterator {
            input,
            seen: HashSet::new(),
        }
    }
}

impl<T: PointValue> PointIterator for DedupeIterator<T> {
    type Value = T;

    fn next_point(&mut self) -> Result<Option<Point<T>>> {
        while let Some(p) = self.input.next_point()? {
            if self.seen.insert(p.dedupe_key()) {
                return Ok(Some(p));
            }
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

// ============================================================================
// Typed constructors
// ============================================================================

/// Wrap a typed iterator with per-series limit/offset.
pub fn new_limit_iterator(input: TypedIterator, opt: &IteratorOptions) -> TypedIterator {
    match input {
        TypedIterator::Float(itr) => TypedIterator::Float(Box::new(LimitIterator::new(itr, opt))),
        TypedIterator::Integer(itr) => {
            TypedIterator::Integer(Box::new(LimitIterator::new(itr, opt)))
        }
        TypedIterator::Str(itr) => TypedIterator::Str(Box::new(LimitIterator::new(itr, opt))),
        TypedIterator::Boolean(itr) => {
            TypedIterator::Boolean(Box::new(LimitIterator::new(itr, opt)))
        }
    }
}

/// Wrap a typed iterator with duplicate-point removal.
pub fn new_dedupe_iterator(input: TypedIterator) -> TypedIterator {
    match input {
        TypedIterator::Float(itr) => TypedIterator::Float(Box::new(DedupeIterator::new(itr))),
        TypedIterator::Integer(itr) => TypedIterator::Integer(Box::new(DedupeIterator::new(itr))),
        TypedIterator::Str(itr) => TypedIterator::Str(Box::new(DedupeIterator::new(itr))),
        TypedIterator::Boolean(itr) => TypedIterator::Boolean(Box::new(DedupeIterator::new(itr))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::FloatPoint;

    fn points(times: &[i64]) -> Vec<FloatPoint> {
        times
            .iter()
            .map(|&t| FloatPoint::new("cpu", t, t as f64))
            .collect()
    }

    #[test]
    fn test_vec_iterator_drains() {
        let mut itr = VecIterator::new(points(&[1, 2, 3]));
        assert_eq!(itr.next_point().unwrap().unwrap().time, 1);
        assert_eq!(itr.next_point().unwrap().unwrap().time, 2);
        assert_eq!(itr.next_point().unwrap().unwrap().time, 3);
        assert!(itr.next_point().unwrap().is_none());
        assert_eq!(itr.stats().point_n, 3);
    }

    #[test]
    fn test_close_is_idempotent_and_stats_survive() {
        let mut itr = VecIterator::new(points(&[1, 2]));
        itr.close();
        itr.close();
        assert_eq!(itr.stats().point_n, 2);
        assert!(itr.next_point().unwrap().is_none());
    }

    #[test]
    fn test_buf_iterator_unread() {
        let mut itr = BufIterator::new(Box::new(VecIterator::new(points(&[1, 2]))));
        let p = itr.next_point().unwrap().unwrap();
        assert_eq!(p.time, 1);
        itr.unread(p);
        assert_eq!(itr.next_point().unwrap().unwrap().time, 1);
        assert_eq!(itr.next_point().unwrap().unwrap().time, 2);
        assert!(itr.next_point().unwrap().is_none());
    }

    #[test]
    fn test_cast_iterator() {
        let input: BoxedIterator<i64> = Box::new(VecIterator::new(vec![
            Point::new("m", 1, 10i64),
            Point::null("m", Tags::new(), 2),
        ]));
        let mut cast = CastIterator::new(input);
        let p = cast.next_point().unwrap().unwrap();
        assert_eq!(p.value, 10.0);
        assert!(!p.nil);
        let p = cast.next_point().unwrap().unwrap();
        assert!(p.nil);
    }

    #[test]
    fn test_limit_iterator_per_series() {
        let mut pts = Vec::new();
        for t in 0..4 {
            pts.push(FloatPoint::new("a", t, t as f64));
        }
        for t in 0..4 {
            pts.push(FloatPoint::new("b", t, t as f64));
        }
        let opt = IteratorOptions {
            limit: 2,
            offset: 1,
            ..Default::default()
        };
        let mut itr = LimitIterator::new(Box::new(VecIterator::new(pts)), &opt);

        let mut got = Vec::new();
        while let Some(p) = itr.next_point().unwrap() {
            got.push((p.name.clone(), p.time));
        }
        assert_eq!(
            got,
            vec![
                ("a".to_string(), 1),
                ("a".to_string(), 2),
                ("b".to_string(), 1),
                ("b".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_limit_zero_passes_through() {
        let opt = IteratorOptions::default();
        let mut itr = LimitIterator::new(Box::new(VecIterator::new(points(&[1, 2, 3]))), &opt);
        let mut n = 0;
        while itr.next_point().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[test]
    fn test_dedupe_iterator() {
        let pts = vec![
            FloatPoint::new("m", 1, 5.0),
            FloatPoint::new("m", 1, 5.0),
            FloatPoint::new("m", 2, 5.0),
        ];
        let mut itr = DedupeIterator::new(Box::new(VecIterator::new(pts)));
        let mut times = Vec::new();
        while let Some(p) = itr.next_point().unwrap() {
            times.push(p.time);
        }
        assert_eq!(times, vec![1, 2]);
    }

    #[test]
    fn test_into_float_casts_integers() {
        let input: BoxedIterator<i64> = Box::new(VecIterator::new(vec![Point::new("m", 1, 4i64)]));
        let mut itr = TypedIterator::Integer(input).into_float("LHS").unwrap();
        assert_eq!(itr.next_point().unwrap().unwrap().value, 4.0);
    }

    #[test]
    fn test_into_float_rejects_strings() {
        let input: BoxedIterator<String> = Box::new(VecIterator::new(Vec::new()));
        let err = match TypedIterator::Str(input).into_float("RHS") {
            Err(e) => e,
            Ok(_) => panic!("expected into_float to reject a string iterator"),
        };
        assert!(err.to_string().contains("type mismatch on RHS"));
    }
}

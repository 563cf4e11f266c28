//! Interval alignment and fill iterators
//!
//! Aggregates bucket their input internally; the interval iterator normalizes
//! the emitted timestamps onto bucket starts, and the fill iterator
//! synthesizes points for buckets that produced no output, per the plan's
//! fill policy. Fill runs per group: each distinct (measurement, tag set) in
//! the stream tracks its own bucket cursor and previous value.

use crate::error::Result;
use crate::iterator::{BoxedIterator, IteratorStats, PointIterator, TypedIterator};
use crate::options::{FillPolicy, Interval, IteratorOptions};
use crate::point::{Point, PointValue, Tags, MAX_TIME, MIN_TIME};
use std::collections::{HashMap, VecDeque};

// ============================================================================
// Interval alignment
// ============================================================================

/// Truncates every point's timestamp to the start of its bucket.
pub struct IntervalIterator<T: PointValue> {
    input: BoxedIterator<T>,
    interval: Interval,
}

impl<T: PointValue> PointIterator for IntervalIterator<T> {
    type Value = T;

    fn next_point(&mut self) -> Result<Option<Point<T>>> {
        Ok(self.input.next_point()?.map(|mut p| {
            p.time = self.interval.bucket(p.time);
            p
        }))
    }

    fn stats(&self) -> IteratorStats {
        self.input.stats()
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Wrap a typed iterator with bucket-start time alignment.
///
/// A zero interval returns the input unchanged.
pub fn new_interval_iterator(input: TypedIterator, opt: &IteratorOptions) -> TypedIterator {
    if opt.interval.is_zero() {
        return input;
    }
    let interval = opt.interval;
    match input {
        TypedIterator::Float(input) => {
            TypedIterator::Float(Box::new(IntervalIterator { input, interval }))
        }
        TypedIterator::Integer(input) => {
            TypedIterator::Integer(Box::new(IntervalIterator { input, interval }))
        }
        TypedIterator::Str(input) => {
            TypedIterator::Str(Box::new(IntervalIterator { input, interval }))
        }
        TypedIterator::Boolean(input) => {
            TypedIterator::Boolean(Box::new(IntervalIterator { input, interval }))
        }
    }
}

// ============================================================================
// Fill
// ============================================================================

struct GroupFillState<T> {
    name: String,
    tags: Tags,
    /// The next bucket this group is expected to produce.
    next_bucket: i64,
    /// Last non-null value and its bucket, for previous/linear fill.
    prev: Option<(i64, T)>,
}

/// Synthesizes points for empty buckets according to the fill policy.
///
/// Missing interior buckets are emitted when the next real point arrives,
/// which gives linear interpolation both of its neighbours. Leading buckets
/// start from the plan's lower bound and trailing buckets run to its upper
/// bound, when those bounds are finite.
pub struct FillIterator<T: PointValue> {
    input: BoxedIterator<T>,
    interval: Interval,
    start_time: i64,
    end_time: i64,
    ascending: bool,
    policy: FillPolicy,
    /// Fill value converted to the stream's type, for number fill.
    number_value: Option<T>,
    /// Numeric casts for linear interpolation; absent for non-numeric types.
    to_f64: Option<fn(&T) -> f64>,
    from_f64: Option<fn(f64) -> T>,
    groups: HashMap<String, GroupFillState<T>>,
    /// First-seen order of groups, for deterministic end-of-stream padding.
    order: Vec<String>,
    pending: VecDeque<Point<T>>,
    done: bool,
}

impl<T: PointValue> FillIterator<T> {
    fn step(&self) -> i64 {
        if self.ascending {
            self.interval.duration
        } else {
            -self.interval.duration
        }
    }

    /// Whether bucket `a` comes before bucket `b` in stream order.
    fn before(&self, a: i64, b: i64) -> bool {
        if self.ascending {
            a < b
        } else {
            a > b
        }
    }

    /// The first bucket a newly seen group is expected to produce.
    fn first_bucket(&self, observed: i64) -> i64 {
        if self.ascending {
            if self.start_time != MIN_TIME {
                self.interval.bucket(self.start_time)
            } else {
                observed
            }
        } else if self.end_time != MAX_TIME {
            self.interval.bucket(self.end_time)
        } else {
            observed
        }
    }

    /// The last bucket every group is padded to at end of stream, if the
    /// relevant bound is finite.
    fn last_bucket(&self) -> Option<i64> {
        if self.ascending {
            if self.end_time != MAX_TIME {
                Some(self.interval.bucket(self.end_time))
            } else {
                None
            }
        } else if self.start_time != MIN_TIME {
            Some(self.interval.bucket(self.start_time))
        } else {
            None
        }
    }

    /// The synthesized point for an empty bucket.
    ///
    /// `next` is the upcoming real point's bucket and value when known, which
    /// linear fill interpolates toward.
    fn filler(
        &self,
        state: &GroupFillState<T>,
        bucket: i64,
        next: Option<(i64, &T)>,
    ) -> Point<T> {
        let null = || Point::null(state.name.clone(), state.tags.clone(), bucket);
        let with_value = |value: T| Point {
            name: state.name.clone(),
            tags: state.tags.clone(),
            time: bucket,
            value,
            nil: false,
            aux: Vec::new(),
        };

        match self.policy {
            FillPolicy::None | FillPolicy::Null => null(),
            FillPolicy::Number(_) => match &self.number_value {
                Some(v) => with_value(v.clone()),
                None => null(),
            },
            FillPolicy::Previous => match &state.prev {
                Some((_, v)) => with_value(v.clone()),
                None => null(),
            },
            FillPolicy::Linear => {
                let (to_f64, from_f64) = match (self.to_f64, self.from_f64) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return null(),
                };
                match (&state.prev, next) {
                    (Some((t0, v0)), Some((t1, v1))) if *t0 != t1 => {
                        let v0 = to_f64(v0);
                        let v1 = to_f64(v1);
                        let fraction = (bucket - t0) as f64 / (t1 - t0) as f64;
                        with_value(from_f64(v0 + (v1 - v0) * fraction))
                    }
                    _ => null(),
                }
            }
        }
    }

    /// Queue fillers for the gap before `p`, then `p` itself.
    fn process(&mut self, p: Point<T>) {
        let bucket = self.interval.bucket(p.time);
        let key = p.series_key();
        if !self.groups.contains_key(&key) {
            let first = self.first_bucket(bucket);
            self.groups.insert(
                key.clone(),
                GroupFillState {
                    name: p.name.clone(),
                    tags: p.tags.clone(),
                    next_bucket: first,
                    prev: None,
                },
            );
            self.order.push(key.clone());
        }

        let step = self.step();
        let next = if p.nil { None } else { Some((bucket, &p.value)) };
        let state = &self.groups[&key];
        let mut cursor = state.next_bucket;
        let mut fillers = Vec::new();
        while self.before(cursor, bucket) {
            fillers.push(self.filler(state, cursor, next));
            cursor += step;
        }

        let state = self.groups.get_mut(&key).expect("group state");
        if !p.nil {
            state.prev = Some((bucket, p.value.clone()));
        }
        state.next_bucket = bucket + step;

        self.pending.extend(fillers);
        self.pending.push_back(p);
    }

    /// Pad every group out to the plan's far bound.
    fn finish(&mut self) {
        let last = match self.last_bucket() {
            Some(last) => last,
            None => return,
        };
        let step = self.step();
        for key in std::mem::take(&mut self.order) {
            let state = self.groups.remove(&key).expect("group state");
            let mut cursor = state.next_bucket;
            while self.before(cursor, last) || cursor == last {
                self.pending.push_back(self.filler(&state, cursor, None));
                cursor += step;
            }
        }
    }
}

impl<T: PointValue> PointIterator for FillIterator<T> {
    type Value = T;

    fn next_point(&mut self) -> Result<Option<Point<T>>> {
        loop {
            if let Some(p) = self.pending.pop_front() {
                return Ok(Some(p));
            }
            if self.done {
                return Ok(None);
            }
            match self.input.next_point()? {
                Some(p) => self.process(p),
                None => {
                    self.done = true;
                    self.finish();
                }
            }
        }
    }

    fn stats(&self) -> IteratorStats {
        self.input.stats()
    }

    fn close(&mut self) {
        self.pending.clear();
        self.done = true;
        self.groups.clear();
        self.order.clear();
        self.input.close();
    }
}

/// Wrap a typed iterator with fill for empty buckets.
///
/// Callers must only apply fill when the interval is non-zero and the policy
/// is not `None`.
pub fn new_fill_iterator(input: TypedIterator, opt: &IteratorOptions) -> TypedIterator {
    fn build<T: PointValue>(
        input: BoxedIterator<T>,
        opt: &IteratorOptions,
        number_value: Option<T>,
        to_f64: Option<fn(&T) -> f64>,
        from_f64: Option<fn(f64) -> T>,
    ) -> BoxedIterator<T> {
        Box::new(FillIterator {
            input,
            interval: opt.interval,
            start_time: opt.start_time,
            end_time: opt.end_time,
            ascending: opt.ascending,
            policy: opt.fill,
            number_value,
            to_f64,
            from_f64,
            groups: HashMap::new(),
            order: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        })
    }

    let number = match opt.fill {
        FillPolicy::Number(v) => Some(v),
        _ => None,
    };
    match input {
        TypedIterator::Float(itr) => TypedIterator::Float(build(
            itr,
            opt,
            number,
            Some(|v: &f64| *v),
            Some(|v: f64| v),
        )),
        TypedIterator::Integer(itr) => TypedIterator::Integer(build(
            itr,
            opt,
            number.map(|v| v as i64),
            Some(|v: &i64| *v as f64),
            Some(|v: f64| v as i64),
        )),
        // Non-numeric streams cannot carry a fill number or interpolate;
        // empty buckets degrade to null.
        TypedIterator::Str(itr) => TypedIterator::Str(build(itr, opt, None, None, None)),
        TypedIterator::Boolean(itr) => TypedIterator::Boolean(build(itr, opt, None, None, None)),
    }
}

// ============================================================================
// Tests
// ============================================================================

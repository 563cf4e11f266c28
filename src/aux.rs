//! Auxiliary-field fan-out iterator
//!
//! When a query mixes raw field references with an aggregate, or projects
//! several raw fields, storage is scanned once: a single upstream iterator
//! carries every referenced field in its points' auxiliary slots. The fan-out
//! splits that stream into one synchronized downstream iterator per field,
//! without re-reading storage.
//!
//! One mutex guards the upstream handle and the per-field ring buffers; one
//! condvar wakes blocked producers and consumers. Buffers are bounded, so a
//! slow downstream backpressures the upstream drain. Two drive modes exist:
//! `background` spawns a producer thread for plans with no primary consumer,
//! and `start` leaves the drain lazy, advanced by whichever consumer runs dry
//! first. Closing any downstream mid-stream cancels the whole fan-out and
//! unblocks its peers.

use crate::ast::{Expr, Measurement};
use crate::error::{QueryError, Result};
use crate::iterator::{
    BoxedIterator, IteratorCreator, IteratorStats, PointIterator, SeriesKey, TypedIterator,
};
use crate::options::IteratorOptions;
use crate::point::{DataType, Point, PointValue, Tags, Value};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Bound on each downstream ring buffer, in points.
const AUX_BUFFER_CAPACITY: usize = 64;

// ============================================================================
// Shared state
// ============================================================================

/// One downstream field buffer.
struct AuxChannel {
    /// Position of the field in the upstream auxiliary slots, if present.
    aux_index: Option<usize>,
    /// Buffered rows: series identity, time, and the field's value.
    queue: VecDeque<(String, Tags, i64, Value)>,
    closed: bool,
}

struct AuxState<T: PointValue> {
    input: Option<BoxedIterator<T>>,
    aux_fields: Vec<String>,
    channels: Vec<AuxChannel>,
    /// Pass-through buffer for the primary consumer, when one exists.
    primary: Option<VecDeque<Point<T>>>,
    started: bool,
    background: bool,
    upstream_done: bool,
    closed: bool,
    error: Option<QueryError>,
    stats: IteratorStats,
    /// Series admitted by the slimit/soffset window, when one applies.
    allowed_series: Option<HashSet<String>>,
}

struct AuxShared<T: PointValue> {
    state: Mutex<AuxState<T>>,
    cond: Condvar,
}

impl<T: PointValue> AuxShared<T> {
    /// Whether every open buffer can accept another point.
    fn has_capacity(state: &AuxState<T>) -> bool {
        let channels_ok = state
            .channels
            .iter()
            .all(|c| c.closed || c.queue.len() < AUX_BUFFER_CAPACITY);
        let primary_ok = state
            .primary
            .as_ref()
            .map_or(true, |q| q.len() < AUX_BUFFER_CAPACITY);
        channels_ok && primary_ok
    }

    /// Copy one upstream point into every open buffer.
    fn distribute(state: &mut AuxState<T>, p: Point<T>) {
        state.stats.point_n += 1;
        for channel in &mut state.channels {
            if channel.closed {
                continue;
            }
            let value = channel
                .aux_index
                .and_then(|i| p.aux.get(i).cloned())
                .unwrap_or(Value::Null);
            channel
                .queue
                .push_back((p.name.clone(), p.tags.clone(), p.time, value));
        }
        if let Some(queue) = &mut state.primary {
            queue.push_back(p);
        }
    }

    /// Advance the upstream by one point, blocking while buffers are full.
    ///
    /// Returns false once the upstream is exhausted, errored, or the fan-out
    /// is closed.
    fn drive(&self, guard: &mut MutexGuard<'_, AuxState<T>>) -> bool {
        loop {
            if guard.closed || guard.upstream_done {
                return false;
            }
            if !Self::has_capacity(guard) {
                self.cond.wait(guard);
                continue;
            }
            let pulled = match guard.input.as_mut() {
                Some(input) => input.next_point(),
                None => Ok(None),
            };
            match pulled {
                Ok(Some(p)) => {
                    if let Some(allowed) = &guard.allowed_series {
                        if !allowed.contains(&p.series_key()) {
                            continue;
                        }
                    }
                    Self::distribute(guard, p);
                    self.cond.notify_all();
                    return true;
                }
                Ok(None) => {
                    guard.upstream_done = true;
                    if let Some(mut input) = guard.input.take() {
                        input.close();
                    }
                    self.cond.notify_all();
                    return false;
                }
                Err(e) => {
                    guard.error = Some(e);
                    guard.upstream_done = true;
                    if let Some(mut input) = guard.input.take() {
                        input.close();
                    }
                    self.cond.notify_all();
                    return false;
                }
            }
        }
    }

    /// Tear the fan-out down: close the upstream, mark every buffer closed,
    /// and wake all waiters.
    fn close_all(&self, guard: &mut MutexGuard<'_, AuxState<T>>) {
        guard.closed = true;
        if let Some(mut input) = guard.input.take() {
            input.close();
        }
        for channel in &mut guard.channels {
            channel.closed = true;
            channel.queue.clear();
        }
        guard.primary = None;
        self.cond.notify_all();
    }
}

// ============================================================================
// Fan-out core
// ============================================================================

/// Typed core of the fan-out; see the module documentation.
struct AuxFanout<T: PointValue> {
    shared: Arc<AuxShared<T>>,
}

impl<T: PointValue> AuxFanout<T> {
    fn new(input: BoxedIterator<T>, series_keys: &[SeriesKey], opt: &IteratorOptions) -> Self {
        let allowed_series = if opt.slimit > 0 || opt.soffset > 0 {
            let mut keys: Vec<String> = series_keys.iter().map(SeriesKey::key).collect();
            keys.sort();
            let end = if opt.slimit > 0 {
                (opt.soffset + opt.slimit).min(keys.len())
            } else {
                keys.len()
            };
            let window = keys
                .get(opt.soffset.min(keys.len())..end)
                .unwrap_or_default();
            Some(window.iter().cloned().collect())
        } else {
            None
        };

        AuxFanout {
            shared: Arc::new(AuxShared {
                state: Mutex::new(AuxState {
                    input: Some(input),
                    aux_fields: opt.aux.clone(),
                    channels: Vec::new(),
                    primary: None,
                    started: false,
                    background: false,
                    upstream_done: false,
                    closed: false,
                    error: None,
                    stats: IteratorStats::default(),
                    allowed_series,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Register a downstream buffer for a field and return its index.
    fn register(&self, name: &str) -> usize {
        let mut state = self.shared.state.lock();
        let aux_index = state.aux_fields.iter().position(|f| f == name);
        state.channels.push(AuxChannel {
            aux_index,
            queue: VecDeque::new(),
            closed: false,
        });
        state.channels.len() - 1
    }

    fn channel_iterator<U: PointValue>(&self, name: &str) -> AuxChannelIterator<T, U> {
        AuxChannelIterator {
            shared: Arc::clone(&self.shared),
            index: self.register(name),
            _marker: std::marker::PhantomData,
        }
    }

    fn primary_iterator(&self) -> AuxPrimaryIterator<T> {
        let mut state = self.shared.state.lock();
        state.primary = Some(VecDeque::new());
        AuxPrimaryIterator {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Enable lazy fan-out: consumers advance the upstream on demand.
    fn start(&self) {
        let mut state = self.shared.state.lock();
        state.started = true;
        self.shared.cond.notify_all();
    }

    /// Spawn a producer thread that drains the upstream into all buffers.
    fn background(&self) {
        {
            let mut state = self.shared.state.lock();
            state.started = true;
            state.background = true;
        }
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            debug!("aux fan-out background drain started");
            let mut guard = shared.state.lock();
            while shared.drive(&mut guard) {}
            debug!("aux fan-out background drain finished");
        });
    }

    fn close(&self) {
        let mut guard = self.shared.state.lock();
        self.shared.close_all(&mut guard);
    }

    fn stats(&self) -> IteratorStats {
        self.shared.state.lock().stats
    }
}

/// Shared consumer loop body: wait or drive until the predicate yields a
/// point or the stream terminates.
fn consume<T: PointValue, P>(
    shared: &AuxShared<T>,
    mut pop: impl FnMut(&mut AuxState<T>) -> ConsumeStep<P>,
) -> Result<Option<P>> {
    let mut guard = shared.state.lock();
    loop {
        match pop(&mut *guard) {
            ConsumeStep::Ready(p) => {
                // A freed buffer slot may unblock the producer.
                shared.cond.notify_all();
                return Ok(Some(p));
            }
            ConsumeStep::Closed => return Ok(None),
            ConsumeStep::Empty => {}
        }
        if let Some(e) = &guard.error {
            return Err(e.clone());
        }
        if guard.upstream_done || guard.closed {
            return Ok(None);
        }
        if guard.background || !guard.started {
            shared.cond.wait(&mut guard);
        } else if !shared.drive(&mut guard) {
            // Stream ended while driving; re-check the buffer for a final
            // point distributed by another consumer.
        }
    }
}

enum ConsumeStep<P> {
    Ready(P),
    Empty,
    Closed,
}

// ============================================================================
// Downstream handles
// ============================================================================

/// A downstream iterator for one auxiliary field.
struct AuxChannelIterator<T: PointValue, U: PointValue> {
    shared: Arc<AuxShared<T>>,
    index: usize,
    _marker: std::marker::PhantomData<fn() -> U>,
}

impl<T: PointValue, U: PointValue> PointIterator for AuxChannelIterator<T, U> {
    type Value = U;

    fn next_point(&mut self) -> Result<Option<Point<U>>> {
        let index = self.index;
        consume(&self.shared, |state| {
            let channel = &mut state.channels[index];
            if let Some((name, tags, time, value)) = channel.queue.pop_front() {
                // A value of the wrong type for this handle becomes null.
                let point = match U::from_value(&value) {
                    Some(v) => Point {
                        name,
                        tags,
                        time,
                        value: v,
                        nil: false,
                        aux: Vec::new(),
                    },
                    None => Point::null(name, tags, time),
                };
                return ConsumeStep::Ready(point);
            }
            if channel.closed {
                return ConsumeStep::Closed;
            }
            ConsumeStep::Empty
        })
    }

    fn stats(&self) -> IteratorStats {
        self.shared.state.lock().stats
    }

    fn close(&mut self) {
        let mut guard = self.shared.state.lock();
        guard.channels[self.index].closed = true;
        guard.channels[self.index].queue.clear();
        if !guard.upstream_done {
            // Cancellation mid-stream tears down the whole fan-out.
            self.shared.close_all(&mut guard);
        } else {
            self.shared.cond.notify_all();
        }
    }
}

/// The pass-through iterator of the upstream's own points.
struct AuxPrimaryIterator<T: PointValue> {
    shared: Arc<AuxShared<T>>,
}

impl<T: PointValue> PointIterator for AuxPrimaryIterator<T> {
    type Value = T;

    fn next_point(&mut self) -> Result<Option<Point<T>>> {
        consume(&self.shared, |state| match &mut state.primary {
            Some(queue) => match queue.pop_front() {
                Some(p) => ConsumeStep::Ready(p),
                None => ConsumeStep::Empty,
            },
            None => ConsumeStep::Closed,
        })
    }

    fn stats(&self) -> IteratorStats {
        self.shared.state.lock().stats
    }

    fn close(&mut self) {
        let mut guard = self.shared.state.lock();
        guard.primary = None;
        if !guard.upstream_done {
            self.shared.close_all(&mut guard);
        } else {
            self.shared.cond.notify_all();
        }
    }
}

// ============================================================================
// Public surface
// ============================================================================

enum Inner {
    Float(AuxFanout<f64>),
    Integer(AuxFanout<i64>),
    Str(AuxFanout<String>),
    Boolean(AuxFanout<bool>),
}

/// Splits one upstream iterator into synchronized per-field downstreams.
///
/// Register every downstream with [`AuxIterator::iterator`] (and at most one
/// [`AuxIterator::primary`]) before calling [`AuxIterator::start`] or
/// [`AuxIterator::background`]. Each downstream emits points in upstream
/// order; the multiset of emitted times is identical across downstreams.
pub struct AuxIterator {
    inner: Inner,
    series_keys: Vec<SeriesKey>,
}

impl AuxIterator {
    /// Wrap an upstream iterator for fan-out.
    pub fn new(input: TypedIterator, series_keys: Vec<SeriesKey>, opt: &IteratorOptions) -> Self {
        let inner = match input {
            TypedIterator::Float(itr) => Inner::Float(AuxFanout::new(itr, &series_keys, opt)),
            TypedIterator::Integer(itr) => Inner::Integer(AuxFanout::new(itr, &series_keys, opt)),
            TypedIterator::Str(itr) => Inner::Str(AuxFanout::new(itr, &series_keys, opt)),
            TypedIterator::Boolean(itr) => Inner::Boolean(AuxFanout::new(itr, &series_keys, opt)),
        };
        AuxIterator { inner, series_keys }
    }

    /// A downstream iterator for the named auxiliary field.
    ///
    /// The handle's point type is the field's declared type; unknown types
    /// default to float. Values that do not match the declared type surface
    /// as null points.
    pub fn iterator(&self, name: &str, data_type: DataType) -> TypedIterator {
        fn handle<T: PointValue>(fanout: &AuxFanout<T>, name: &str, typ: DataType) -> TypedIterator {
            match typ {
                DataType::Integer => TypedIterator::Integer(Box::new(fanout.channel_iterator(name))),
                DataType::String => TypedIterator::Str(Box::new(fanout.channel_iterator(name))),
                DataType::Boolean => {
                    TypedIterator::Boolean(Box::new(fanout.channel_iterator(name)))
                }
                DataType::Float | DataType::Unknown => {
                    TypedIterator::Float(Box::new(fanout.channel_iterator(name)))
                }
            }
        }
        match &self.inner {
            Inner::Float(f) => handle(f, name, data_type),
            Inner::Integer(f) => handle(f, name, data_type),
            Inner::Str(f) => handle(f, name, data_type),
            Inner::Boolean(f) => handle(f, name, data_type),
        }
    }

    /// The pass-through iterator of the upstream's own points.
    pub fn primary(&self) -> TypedIterator {
        match &self.inner {
            Inner::Float(f) => TypedIterator::Float(Box::new(f.primary_iterator())),
            Inner::Integer(f) => TypedIterator::Integer(Box::new(f.primary_iterator())),
            Inner::Str(f) => TypedIterator::Str(Box::new(f.primary_iterator())),
            Inner::Boolean(f) => TypedIterator::Boolean(Box::new(f.primary_iterator())),
        }
    }

    /// Enable lazy fan-out, driven by whichever consumer runs dry first.
    pub fn start(&self) {
        match &self.inner {
            Inner::Float(f) => f.start(),
            Inner::Integer(f) => f.start(),
            Inner::Str(f) => f.start(),
            Inner::Boolean(f) => f.start(),
        }
    }

    /// Spawn a dedicated producer draining the upstream into all buffers.
    pub fn background(&self) {
        match &self.inner {
            Inner::Float(f) => f.background(),
            Inner::Integer(f) => f.background(),
            Inner::Str(f) => f.background(),
            Inner::Boolean(f) => f.background(),
        }
    }

    /// Close the fan-out, its upstream, and every downstream.
    pub fn close(&self) {
        match &self.inner {
            Inner::Float(f) => f.close(),
            Inner::Integer(f) => f.close(),
            Inner::Str(f) => f.close(),
            Inner::Boolean(f) => f.close(),
        }
    }

    /// Cumulative scan counters of the shared upstream drain.
    pub fn stats(&self) -> IteratorStats {
        match &self.inner {
            Inner::Float(f) => f.stats(),
            Inner::Integer(f) => f.stats(),
            Inner::Str(f) => f.stats(),
            Inner::Boolean(f) => f.stats(),
        }
    }
}

/// The planner resolves raw references inside expressions against the fan-out
/// by treating it as an iterator creator.
impl IteratorCreator for AuxIterator {
    fn create_iterator(&self, opt: &IteratorOptions) -> Result<TypedIterator> {
        match &opt.expr {
            Some(Expr::VarRef { name, data_type }) => Ok(self.iterator(name, *data_type)),
            other => Err(QueryError::InvalidExpression(format!(
                "auxiliary fan-out can only resolve field references, got {:?}",
                other
            ))),
        }
    }

    fn series_keys(&self, _opt: &IteratorOptions) -> Result<Vec<SeriesKey>> {
        Ok(self.series_keys.clone())
    }

    fn field_dimensions(
        &self,
        _sources: &[Measurement],
    ) -> Result<(HashMap<String, DataType>, HashSet<String>)> {
        Ok((HashMap::new(), HashSet::new()))
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Fluxion - Streaming query execution engine for a distributed time-series database
//!
//! This library turns a parsed, rewritten `SELECT` statement into a tree of
//! streaming iterators producing typed time-stamped points:
//! - Four point types (float, integer, string, boolean) with implicit
//!   integer-to-float promotion in expressions
//! - Lazy, cancellable pull-based iterator composition
//! - Windowed aggregates and selectors with fill policies
//! - A single-scan auxiliary fan-out for projections mixing aggregates
//!   with raw field references
//!
//! # Architecture
//!
//! ```text
//! SelectStatement + SelectOptions
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Planner   │  Classify projection, derive IteratorOptions
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │ Expr build  │  Recursive expression → iterator construction
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Iterators  │  Leaves from storage, transforms, aggregates,
//! └─────────────┘  interval/fill, fan-out, limit/offset
//! ```
//!
//! Storage is abstracted behind [`IteratorCreator`]: the planner asks it for
//! leaf iterators (raw fields or pushed-down aggregate calls) and drains the
//! resulting tree lazily. Consumers may drain the returned iterators from
//! parallel tasks; closing any iterator cancels and releases its subtree.
//!
//! # Example
//!
//! ```rust,ignore
//! use fluxion::{select, SelectOptions, SelectStatement};
//!
//! let itrs = select(&stmt, &storage, &SelectOptions::default())?;
//! for itr in itrs {
//!     // drain each projected field's stream
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod ast;
pub mod aux;
pub mod error;
pub mod iterator;
pub mod options;
pub mod point;
pub mod select;
pub mod transform;
pub mod window;

pub use ast::{BinaryOp, Dimension, Expr, Field, Literal, Measurement, SelectStatement};
pub use aux::AuxIterator;
pub use error::{QueryError, Result};
pub use iterator::{
    BoxedIterator, IteratorCreator, IteratorStats, PointIterator, SeriesKey, TypedIterator,
};
pub use options::{FillPolicy, Interval, IteratorOptions, SelectOptions};
pub use point::{
    BooleanPoint, DataType, FloatPoint, IntegerPoint, Point, PointValue, StringPoint, Tags, Value,
    MAX_TIME, MIN_TIME,
};
pub use select::{build_expr_iterator, select};

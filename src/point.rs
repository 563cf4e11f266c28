//! Core point and value types for the query engine
//!
//! Every iterator in the engine streams points of exactly one of four scalar
//! types: float, integer, string, or boolean. A point carries the series
//! identity (measurement name + tags), a nanosecond timestamp, the typed
//! value, a null indicator, and an ordered list of auxiliary values that
//! travel alongside the primary value.
//!
//! # Key Types
//!
//! - **`DataType`**: The closed set of point value types
//! - **`Value`**: A dynamically typed scalar (or null), used for auxiliary slots
//! - **`Tags`**: An ordered tag key/value set identifying a series
//! - **`Point<T>`**: A single typed, time-stamped measurement

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum representable point timestamp, used as an unbounded lower sentinel.
pub const MIN_TIME: i64 = i64::MIN;

/// Maximum representable point timestamp, used as an unbounded upper sentinel.
pub const MAX_TIME: i64 = i64::MAX;

// ============================================================================
// Data Types
// ============================================================================

/// The type of values produced by an iterator or stored in a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 64-bit floating point values
    Float,
    /// 64-bit signed integer values
    Integer,
    /// UTF-8 string values
    String,
    /// Boolean values
    Boolean,
    /// Type could not be determined
    Unknown,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float => write!(f, "float"),
            DataType::Integer => write!(f, "integer"),
            DataType::String => write!(f, "string"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A dynamically typed scalar value, or null.
///
/// Used wherever a value's type is not known statically: auxiliary slots on a
/// point, raw storage rows, and fill values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Float value
    Float(f64),
    /// Integer value
    Integer(i64),
    /// String value
    Str(String),
    /// Boolean value
    Boolean(bool),
    /// Absent value
    Null,
}

impl Value {
    /// The data type of this value. `Null` reports `Unknown`.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Float(_) => DataType::Float,
            Value::Integer(_) => DataType::Integer,
            Value::Str(_) => DataType::String,
            Value::Boolean(_) => DataType::Boolean,
            Value::Null => DataType::Unknown,
        }
    }

    /// Whether this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

// ============================================================================
// Point Values
// ============================================================================

/// The closed set of scalar types a [`Point`] may carry.
///
/// Implemented for `f64`, `i64`, `String`, and `bool` only. Supplies the zero
/// value used when a point's value must be blanked, the static [`DataType`]
/// tag, and conversion to and from the dynamic [`Value`] representation.
pub trait PointValue: Clone + PartialEq + fmt::Debug + Send + 'static {
    /// The static type tag for this value type.
    const DATA_TYPE: DataType;

    /// The zero value for this type.
    fn zero() -> Self;

    /// Convert into the dynamic representation.
    fn into_value(self) -> Value;

    /// Extract from the dynamic representation, if the types match.
    fn from_value(v: &Value) -> Option<Self>;
}

impl PointValue for f64 {
    const DATA_TYPE: DataType = DataType::Float;

    fn zero() -> Self {
        0.0
    }

    fn into_value(self) -> Value {
        Value::Float(self)
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PointValue for i64 {
    const DATA_TYPE: DataType = DataType::Integer;

    fn zero() -> Self {
        0
    }

    fn into_value(self) -> Value {
        Value::Integer(self)
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl PointValue for String {
    const DATA_TYPE: DataType = DataType::String;

    fn zero() -> Self {
        String::new()
    }

    fn into_value(self) -> Value {
        Value::Str(self)
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl PointValue for bool {
    const DATA_TYPE: DataType = DataType::Boolean;

    fn zero() -> Self {
        false
    }

    fn into_value(self) -> Value {
        Value::Boolean(self)
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

// ============================================================================
// Tags
// ============================================================================

/// An ordered set of tag key/value pairs.
///
/// Tags are kept sorted by key so that equality and the canonical group key
/// are order-insensitive with respect to insertion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Tags(Vec::new())
    }

    /// Create a tag set from key/value pairs. Later duplicates win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut tags = Tags::new();
        for (k, v) in pairs {
            tags.insert(k.into(), v.into());
        }
        tags
    }

    /// Insert a tag, replacing any existing value for the key.
    pub fn insert(&mut self, key: String, value: String) {
        match self.0.binary_search_by(|(k, _)| k.as_str().cmp(&key)) {
            Ok(i) => self.0[i].1 = value,
            Err(i) => self.0.insert(i, (key, value)),
        }
    }

    /// Look up the value for a tag key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    /// Number of tags in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Project this tag set onto the given dimension keys.
    ///
    /// Every requested key appears in the result; keys absent from the set map
    /// to the empty string so that group keys stay aligned across series.
    pub fn project(&self, keys: &[String]) -> Tags {
        let mut out = Tags::new();
        for key in keys {
            let value = self.get(key).unwrap_or("").to_string();
            out.insert(key.clone(), value);
        }
        out
    }

    /// Canonical string encoding of the set, usable as a grouping key.
    pub fn key(&self) -> String {
        let mut s = String::new();
        for (k, v) in &self.0 {
            s.push_str(k);
            s.push('\u{0}');
            s.push_str(v);
            s.push('\u{0}');
        }
        s
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

// ============================================================================
// Point
// ============================================================================

/// A single typed, time-stamped measurement in a series.
///
/// `time` is nanoseconds since the epoch. If `nil` is set the `value` field
/// must be ignored by readers. `aux` carries one dynamic value per auxiliary
/// field requested by the plan, in the plan's auxiliary field order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point<T> {
    /// Measurement name of the series this point belongs to.
    pub name: String,
    /// Tag set of the series this point belongs to.
    pub tags: Tags,
    /// Timestamp in nanoseconds since the epoch.
    pub time: i64,
    /// The point's value. Ignore when `nil` is set.
    pub value: T,
    /// Null indicator.
    pub nil: bool,
    /// Auxiliary values, one per auxiliary field in plan order.
    pub aux: Vec<Value>,
}

impl<T: PointValue> Point<T> {
    /// Create a point with no tags and no auxiliary values.
    pub fn new(name: impl Into<String>, time: i64, value: T) -> Self {
        Point {
            name: name.into(),
            tags: Tags::new(),
            time,
            value,
            nil: false,
            aux: Vec::new(),
        }
    }

    /// Create a null point carrying series metadata only.
    pub fn null(name: impl Into<String>, tags: Tags, time: i64) -> Self {
        Point {
            name: name.into(),
            tags,
            time,
            value: T::zero(),
            nil: true,
            aux: Vec::new(),
        }
    }

    /// Attach a tag set.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Attach auxiliary values.
    pub fn with_aux(mut self, aux: Vec<Value>) -> Self {
        self.aux = aux;
        self
    }

    /// The series key of this point: measurement name plus encoded tags.
    pub fn series_key(&self) -> String {
        let mut s = String::with_capacity(self.name.len() + 1);
        s.push_str(&self.name);
        s.push('\u{0}');
        s.push_str(&self.tags.key());
        s
    }

    /// A canonical encoding of the entire point, used for deduplication.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}\u{0}{}\u{0}{}\u{0}{:?}\u{0}{}\u{0}{:?}",
            self.name,
            self.tags.key(),
            self.time,
            self.value,
            self.nil,
            self.aux
        )
    }
}

/// A float-valued point.
pub type FloatPoint = Point<f64>;
/// An integer-valued point.
pub type IntegerPoint = Point<i64>;
/// A string-valued point.
pub type StringPoint = Point<String>;
/// A boolean-valued point.
pub type BooleanPoint = Point<bool>;

// ============================================================================
// Tests
// ============================================================================

//! Statement and expression surface consumed by the planner
//!
//! The engine does not parse query text. It consumes a rewritten
//! [`SelectStatement`] — wildcards and sources already expanded — and walks its
//! expression trees to wire up iterators. This module defines that surface
//! along with the small amount of expression analysis the planner needs:
//! constant folding, raw-reference detection, and time-bound extraction from a
//! condition tree.

use crate::options::{FillPolicy, Interval};
use crate::point::DataType;
use std::fmt;

// ============================================================================
// Expressions
// ============================================================================

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Equality
    Eq,
    /// Inequality
    Neq,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
    /// Logical and
    And,
    /// Logical or
    Or,
}

impl BinaryOp {
    /// Whether this operator produces a boolean result.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        };
        write!(f, "{}", s)
    }
}

/// A literal value appearing in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A floating point number.
    Number(f64),
    /// An integer number.
    Integer(i64),
    /// A string.
    Str(String),
    /// A boolean.
    Boolean(bool),
    /// A duration in nanoseconds.
    Duration(i64),
}

impl Literal {
    /// The data type this literal produces when evaluated.
    pub fn data_type(&self) -> DataType {
        match self {
            Literal::Number(_) => DataType::Float,
            Literal::Integer(_) | Literal::Duration(_) => DataType::Integer,
            Literal::Str(_) => DataType::String,
            Literal::Boolean(_) => DataType::Boolean,
        }
    }

    /// Numeric view of the literal, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Number(v) => Some(*v),
            Literal::Integer(v) | Literal::Duration(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(v) => write!(f, "{}", v),
            Literal::Integer(v) => write!(f, "{}", v),
            Literal::Str(s) => write!(f, "'{}'", s),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Duration(ns) => write!(f, "{}ns", ns),
        }
    }
}

/// An expression node in a projection, condition, or call argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A reference to a field or tag, with its declared type.
    VarRef {
        /// Referenced field or tag name
        name: String,
        /// Declared type of the reference
        data_type: DataType,
    },
    /// A function call.
    Call {
        /// Function name, lower case
        name: String,
        /// Argument expressions
        args: Vec<Expr>,
    },
    /// A binary operation.
    Binary {
        /// Left operand
        lhs: Box<Expr>,
        /// Operator
        op: BinaryOp,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// A parenthesized expression.
    Paren(Box<Expr>),
    /// A literal value.
    Literal(Literal),
}

impl Expr {
    /// Shorthand for a typed variable reference.
    pub fn var_ref(name: impl Into<String>, data_type: DataType) -> Expr {
        Expr::VarRef {
            name: name.into(),
            data_type,
        }
    }

    /// Shorthand for a call expression.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    /// Shorthand for a binary expression.
    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Expr {
        Expr::Binary {
            lhs: Box::new(lhs),
            op,
            rhs: Box::new(rhs),
        }
    }

    /// Whether this node is a literal.
    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::VarRef { name, .. } => write!(f, "{}", name),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Binary { lhs, op, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            Expr::Paren(inner) => write!(f, "({})", inner),
            Expr::Literal(lit) => write!(f, "{}", lit),
        }
    }
}

/// Reports whether an expression contains a raw variable reference.
///
/// Call nodes are opaque: references inside call arguments belong to the call
/// and do not count as raw references of the surrounding expression.
pub fn contains_var_ref(expr: &Expr) -> bool {
    match expr {
        Expr::VarRef { .. } => true,
        Expr::Call { .. } => false,
        Expr::Binary { lhs, rhs, .. } => contains_var_ref(lhs) || contains_var_ref(rhs),
        Expr::Paren(inner) => contains_var_ref(inner),
        Expr::Literal(_) => false,
    }
}

/// Folds constant sub-expressions.
///
/// Binary operations over two literals are evaluated; parentheses around the
/// result are dropped. Anything that cannot fold is returned unchanged. Integer
/// division promotes to float, and division by zero folds to zero, matching
/// runtime evaluation.
pub fn reduce(expr: &Expr) -> Expr {
    match expr {
        Expr::Paren(inner) => reduce(inner),
        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(reduce).collect(),
        },
        Expr::Binary { lhs, op, rhs } => {
            let lhs = reduce(lhs);
            let rhs = reduce(rhs);
            if let (Expr::Literal(a), Expr::Literal(b)) = (&lhs, &rhs) {
                if let Some(folded) = fold_literals(a, *op, b) {
                    return Expr::Literal(folded);
                }
            }
            Expr::Binary {
                lhs: Box::new(lhs),
                op: *op,
                rhs: Box::new(rhs),
            }
        }
        other => other.clone(),
    }
}

fn fold_literals(a: &Literal, op: BinaryOp, b: &Literal) -> Option<Literal> {
    use Literal::*;
    match (a, b) {
        (Integer(x) | Duration(x), Integer(y) | Duration(y)) => {
            Some(match op {
                BinaryOp::Add => Integer(x.wrapping_add(*y)),
                BinaryOp::Sub => Integer(x.wrapping_sub(*y)),
                BinaryOp::Mul => Integer(x.wrapping_mul(*y)),
                BinaryOp::Div => {
                    if *y == 0 {
                        Number(0.0)
                    } else {
                        Number(*x as f64 / *y as f64)
                    }
                }
                BinaryOp::Eq => Boolean(x == y),
                BinaryOp::Neq => Boolean(x != y),
                BinaryOp::Lt => Boolean(x < y),
                BinaryOp::Lte => Boolean(x <= y),
                BinaryOp::Gt => Boolean(x > y),
                BinaryOp::Gte => Boolean(x >= y),
                _ => return None,
            })
        }
        _ => {
            // Mixed numeric forms promote to float.
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                return Some(match op {
                    BinaryOp::Add => Number(x + y),
                    BinaryOp::Sub => Number(x - y),
                    BinaryOp::Mul => Number(x * y),
                    BinaryOp::Div => {
                        if y == 0.0 {
                            Number(0.0)
                        } else {
                            Number(x / y)
                        }
                    }
                    BinaryOp::Eq => Boolean(x == y),
                    BinaryOp::Neq => Boolean(x != y),
                    BinaryOp::Lt => Boolean(x < y),
                    BinaryOp::Lte => Boolean(x <= y),
                    BinaryOp::Gt => Boolean(x > y),
                    BinaryOp::Gte => Boolean(x >= y),
                    _ => return None,
                });
            }
            match (a, b) {
                (Str(x), Str(y)) => Some(match op {
                    BinaryOp::Add => Str(format!("{}{}", x, y)),
                    BinaryOp::Eq => Boolean(x == y),
                    BinaryOp::Neq => Boolean(x != y),
                    _ => return None,
                }),
                (Boolean(x), Boolean(y)) => Some(match op {
                    BinaryOp::And => Boolean(*x && *y),
                    BinaryOp::Or => Boolean(*x || *y),
                    BinaryOp::Eq => Boolean(x == y),
                    BinaryOp::Neq => Boolean(x != y),
                    _ => return None,
                }),
                _ => None,
            }
        }
    }
}

// ============================================================================
// Statement
// ============================================================================

/// A measurement source in the `FROM` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    /// Measurement name
    pub name: String,
}

impl Measurement {
    /// Create a measurement source.
    pub fn new(name: impl Into<String>) -> Self {
        Measurement { name: name.into() }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A projected field: an expression with an optional alias.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// The projected expression
    pub expr: Expr,
    /// Optional output alias
    pub alias: Option<String>,
}

impl Field {
    /// Create an unaliased field.
    pub fn new(expr: Expr) -> Self {
        Field { expr, alias: None }
    }

    /// The output name of the field: alias, referenced name, or call name.
    pub fn name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.expr {
            Expr::VarRef { name, .. } => name.clone(),
            Expr::Call { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} AS {}", self.expr, alias),
            None => write!(f, "{}", self.expr),
        }
    }
}

/// A `GROUP BY` entry: either a tag key or a time bucketing interval.
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    /// Group by a tag key.
    Tag(String),
    /// Bucket by time with the given interval.
    Time(Interval),
}

/// A rewritten `SELECT` statement ready for planning.
///
/// Wildcard and source expansion must already have happened; every projected
/// expression is concrete and every `VarRef` carries its declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    /// Projected fields, in output order.
    pub fields: Vec<Field>,
    /// Measurement sources.
    pub sources: Vec<Measurement>,
    /// Optional `WHERE` condition.
    pub condition: Option<Expr>,
    /// `GROUP BY` entries.
    pub dimensions: Vec<Dimension>,
    /// Fill policy for empty time buckets.
    pub fill: FillPolicy,
    /// Maximum points per series, zero for unlimited.
    pub limit: usize,
    /// Points to skip per series.
    pub offset: usize,
    /// Maximum number of series, zero for unlimited.
    pub slimit: usize,
    /// Series to skip.
    pub soffset: usize,
    /// Time ordering of results.
    pub ascending: bool,
    /// Whether duplicate rows are removed.
    pub dedupe: bool,
}

impl Default for SelectStatement {
    fn default() -> Self {
        SelectStatement {
            fields: Vec::new(),
            sources: Vec::new(),
            condition: None,
            dimensions: Vec::new(),
            fill: FillPolicy::None,
            limit: 0,
            offset: 0,
            slimit: 0,
            soffset: 0,
            ascending: true,
            dedupe: false,
        }
    }
}

impl SelectStatement {
    /// The time bucketing interval from the `GROUP BY` clause, if any.
    pub fn interval(&self) -> Interval {
        for dim in &self.dimensions {
            if let Dimension::Time(interval) = dim {
                return *interval;
            }
        }
        Interval::default()
    }

    /// The tag keys from the `GROUP BY` clause, sorted.
    pub fn tag_dimensions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .dimensions
            .iter()
            .filter_map(|d| match d {
                Dimension::Tag(key) => Some(key.clone()),
                Dimension::Time(_) => None,
            })
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

// ============================================================================
// Condition time bounds
// ============================================================================

/// Extracts `time` bounds from a condition tree.
///
/// Walks AND-combined comparisons of the `time` reference against numeric or
/// duration literals and intersects them into inclusive `(min, max)` bounds.
/// An OR node cannot constrain the range and yields unbounded sides.
pub fn time_range(cond: &Expr) -> (Option<i64>, Option<i64>) {
    match cond {
        Expr::Paren(inner) => time_range(inner),
        Expr::Binary { lhs, op, rhs } => match op {
            BinaryOp::And => {
                let (lmin, lmax) = time_range(lhs);
                let (rmin, rmax) = time_range(rhs);
                (max_opt(lmin, rmin), min_opt(lmax, rmax))
            }
            BinaryOp::Or => (None, None),
            _ => {
                // Normalize so the time reference is on the left.
                if let (Some(value), Some(flipped)) = time_comparison(lhs, rhs, *op) {
                    return bound_for(flipped, value);
                }
                (None, None)
            }
        },
        _ => (None, None),
    }
}

/// Extracts `(literal value, effective operator)` from a comparison involving
/// the `time` reference, flipping the operator when `time` is on the right.
fn time_comparison(lhs: &Expr, rhs: &Expr, op: BinaryOp) -> (Option<i64>, Option<BinaryOp>) {
    let lit_value = |e: &Expr| match e {
        Expr::Literal(Literal::Integer(v)) | Expr::Literal(Literal::Duration(v)) => Some(*v),
        Expr::Literal(Literal::Number(v)) => Some(*v as i64),
        _ => None,
    };
    let is_time = |e: &Expr| matches!(e, Expr::VarRef { name, .. } if name == "time");

    if is_time(lhs) {
        (lit_value(rhs), Some(op))
    } else if is_time(rhs) {
        let flipped = match op {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Lte => BinaryOp::Gte,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Gte => BinaryOp::Lte,
            other => other,
        };
        (lit_value(lhs), Some(flipped))
    } else {
        (None, None)
    }
}

fn bound_for(op: BinaryOp, value: i64) -> (Option<i64>, Option<i64>) {
    match op {
        BinaryOp::Gt => (Some(value.saturating_add(1)), None),
        BinaryOp::Gte => (Some(value), None),
        BinaryOp::Lt => (None, Some(value.saturating_sub(1))),
        BinaryOp::Lte => (None, Some(value)),
        BinaryOp::Eq => (Some(value), Some(value)),
        _ => (None, None),
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn time_ref() -> Expr {
        Expr::var_ref("time", DataType::Integer)
    }

    #[test]
    fn test_contains_var_ref_skips_calls() {
        let expr = Expr::call("mean", vec![Expr::var_ref("value", DataType::Float)]);
        assert!(!contains_var_ref(&expr));

        let expr = Expr::binary(
            Expr::var_ref("value", DataType::Float),
            BinaryOp::Add,
            Expr::Literal(Literal::Number(1.0)),
        );
        assert!(contains_var_ref(&expr));
    }

    #[test]
    fn test_reduce_folds_literals() {
        let expr = Expr::binary(
            Expr::Literal(Literal::Integer(6)),
            BinaryOp::Mul,
            Expr::Literal(Literal::Integer(7)),
        );
        assert_eq!(reduce(&expr), Expr::Literal(Literal::Integer(42)));
    }

    #[test]
    fn test_reduce_integer_division_promotes() {
        let expr = Expr::binary(
            Expr::Literal(Literal::Integer(1)),
            BinaryOp::Div,
            Expr::Literal(Literal::Integer(2)),
        );
        assert_eq!(reduce(&expr), Expr::Literal(Literal::Number(0.5)));
    }

    #[test]
    fn test_reduce_division_by_zero_is_zero() {
        let expr = Expr::binary(
            Expr::Literal(Literal::Number(5.0)),
            BinaryOp::Div,
            Expr::Literal(Literal::Number(0.0)),
        );
        assert_eq!(reduce(&expr), Expr::Literal(Literal::Number(0.0)));
    }

    #[test]
    fn test_reduce_unwraps_parens() {
        let expr = Expr::Paren(Box::new(Expr::var_ref("v", DataType::Float)));
        assert_eq!(reduce(&expr), Expr::var_ref("v", DataType::Float));
    }

    #[test]
    fn test_time_range_intersection() {
        // time >= 10 AND time < 100
        let cond = Expr::binary(
            Expr::binary(time_ref(), BinaryOp::Gte, Expr::Literal(Literal::Integer(10))),
            BinaryOp::And,
            Expr::binary(time_ref(), BinaryOp::Lt, Expr::Literal(Literal::Integer(100))),
        );
        assert_eq!(time_range(&cond), (Some(10), Some(99)));
    }

    #[test]
    fn test_time_range_flipped_operand() {
        // 10 <= time
        let cond = Expr::binary(Expr::Literal(Literal::Integer(10)), BinaryOp::Lte, time_ref());
        assert_eq!(time_range(&cond), (Some(10), None));
    }

    #[test]
    fn test_time_range_equality_pins_both() {
        let cond = Expr::binary(time_ref(), BinaryOp::Eq, Expr::Literal(Literal::Integer(42)));
        assert_eq!(time_range(&cond), (Some(42), Some(42)));
    }

    #[test]
    fn test_time_range_or_is_unbounded() {
        let cond = Expr::binary(
            Expr::binary(time_ref(), BinaryOp::Gte, Expr::Literal(Literal::Integer(10))),
            BinaryOp::Or,
            Expr::binary(time_ref(), BinaryOp::Lt, Expr::Literal(Literal::Integer(5))),
        );
        assert_eq!(time_range(&cond), (None, None));
    }

    #[test]
    fn test_statement_dimensions() {
        let stmt = SelectStatement {
            dimensions: vec![
                Dimension::Tag("host".to_string()),
                Dimension::Time(Interval::new(10, 0)),
                Dimension::Tag("dc".to_string()),
            ],
            ..Default::default()
        };
        assert_eq!(stmt.interval(), Interval::new(10, 0));
        assert_eq!(stmt.tag_dimensions(), vec!["dc".to_string(), "host".to_string()]);
    }

    #[test]
    fn test_expr_display() {
        let expr = Expr::binary(
            Expr::call("top", vec![
                Expr::var_ref("v", DataType::Float),
                Expr::Literal(Literal::Integer(3)),
            ]),
            BinaryOp::Add,
            Expr::Literal(Literal::Number(1.0)),
        );
        assert_eq!(expr.to_string(), "top(v, 3) + 1");
    }
}

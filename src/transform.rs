//! Pointwise transform iterators for binary expressions
//!
//! A binary expression over streams becomes a combining iterator that zips its
//! operands pointwise; an expression with a literal on one side becomes a
//! mapping iterator over the other side. Type dispatch follows the numeric
//! promotion rules: any float operand pulls the whole expression into the
//! float family, integer division always promotes to float, and comparisons
//! produce booleans. Integer iterators feeding a float operator are wrapped in
//! a transparent cast.
//!
//! Division by zero yields zero of the result type and integer arithmetic
//! wraps; neither raises an error mid-stream.

use crate::ast::{BinaryOp, Literal};
use crate::error::{QueryError, Result};
use crate::iterator::{BoxedIterator, IteratorStats, PointIterator, TypedIterator};
use crate::point::{DataType, Point, PointValue};

// ============================================================================
// Mapping iterator
// ============================================================================

/// Applies a function to every point of an upstream iterator.
pub struct TransformIterator<T: PointValue, U: PointValue> {
    input: BoxedIterator<T>,
    f: Box<dyn FnMut(Point<T>) -> Point<U> + Send>,
}

impl<T: PointValue, U: PointValue> TransformIterator<T, U> {
    /// Wrap an iterator with a pointwise function.
    pub fn new(input: BoxedIterator<T>, f: impl FnMut(Point<T>) -> Point<U> + Send + 'static) -> Self {
        TransformIterator {
            input,
            f: Box::new(f),
        }
    }
}

impl<T: PointValue, U: PointValue> PointIterator for TransformIterator<T, U> {
    type Value = U;

    fn next_point(&mut self) -> Result<Option<Point<U>>> {
        Ok(self.input.next_point()?.map(&mut self.f))
    }

    fn stats(&self) -> IteratorStats {
        self.input.stats()
    }

    fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Combining iterator
// ============================================================================

/// Zips two same-typed streams through a binary function.
///
/// Operands are paired in arrival order. When one side is exhausted the other
/// side's metadata is carried through with a null value; when either paired
/// point is null the output is null.
pub struct BinaryExprIterator<T: PointValue, U: PointValue> {
    left: BoxedIterator<T>,
    right: BoxedIterator<T>,
    f: Box<dyn FnMut(&T, &T) -> U + Send>,
}

impl<T: PointValue, U: PointValue> BinaryExprIterator<T, U> {
    /// Combine two iterators with a binary function.
    pub fn new(
        left: BoxedIterator<T>,
        right: BoxedIterator<T>,
        f: impl FnMut(&T, &T) -> U + Send + 'static,
    ) -> Self {
        BinaryExprIterator {
            left,
            right,
            f: Box::new(f),
        }
    }
}

impl<T: PointValue, U: PointValue> PointIterator for BinaryExprIterator<T, U> {
    type Value = U;

    fn next_point(&mut self) -> Result<Option<Point<U>>> {
        let a = self.left.next_point()?;
        let b = self.right.next_point()?;
        match (a, b) {
            (None, None) => Ok(None),
            (Some(a), Some(b)) => {
                let nil = a.nil || b.nil;
                let value = if nil {
                    U::zero()
                } else {
                    (self.f)(&a.value, &b.value)
                };
                Ok(Some(Point {
                    name: a.name,
                    tags: a.tags,
                    time: a.time,
                    value,
                    nil,
                    aux: a.aux,
                }))
            }
            (Some(a), None) => Ok(Some(Point::null(a.name, a.tags, a.time).with_aux(a.aux))),
            (None, Some(b)) => Ok(Some(Point::null(b.name, b.tags, b.time).with_aux(b.aux))),
        }
    }

    fn stats(&self) -> IteratorStats {
        let mut stats = self.left.stats();
        stats.add(self.right.stats());
        stats
    }

    fn close(&mut self) {
        self.left.close();
        self.right.close();
    }
}

// ============================================================================
// Operator tables
// ============================================================================

fn float_arith(op: BinaryOp) -> Option<fn(f64, f64) -> f64> {
    Some(match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| if b == 0.0 { 0.0 } else { a / b },
        _ => return None,
    })
}

fn float_cmp(op: BinaryOp) -> Option<fn(f64, f64) -> bool> {
    Some(match op {
        BinaryOp::Eq => |a, b| a == b,
        BinaryOp::Neq => |a, b| a != b,
        BinaryOp::Lt => |a, b| a < b,
        BinaryOp::Lte => |a, b| a <= b,
        BinaryOp::Gt => |a, b| a > b,
        BinaryOp::Gte => |a, b| a >= b,
        _ => return None,
    })
}

fn integer_arith(op: BinaryOp) -> Option<fn(i64, i64) -> i64> {
    Some(match op {
        BinaryOp::Add => i64::wrapping_add,
        BinaryOp::Sub => i64::wrapping_sub,
        BinaryOp::Mul => i64::wrapping_mul,
        _ => return None,
    })
}

fn integer_cmp(op: BinaryOp) -> Option<fn(i64, i64) -> bool> {
    Some(match op {
        BinaryOp::Eq => |a, b| a == b,
        BinaryOp::Neq => |a, b| a != b,
        BinaryOp::Lt => |a, b| a < b,
        BinaryOp::Lte => |a, b| a <= b,
        BinaryOp::Gt => |a, b| a > b,
        BinaryOp::Gte => |a, b| a >= b,
        _ => return None,
    })
}

fn unsupported(op: BinaryOp, lhs: DataType, rhs: DataType) -> QueryError {
    QueryError::InvalidExpression(format!(
        "operator {} is not valid between {} and {} operands",
        op, lhs, rhs
    ))
}

// Mapping helpers used by the literal-on-one-side builders.

fn map_same<T: PointValue>(
    input: BoxedIterator<T>,
    f: impl Fn(&T) -> T + Send + 'static,
) -> BoxedIterator<T> {
    Box::new(TransformIterator::new(input, move |mut p: Point<T>| {
        if !p.nil {
            p.value = f(&p.value);
        }
        p
    }))
}

fn map_to<T: PointValue, U: PointValue>(
    input: BoxedIterator<T>,
    f: impl Fn(&T) -> U + Send + 'static,
) -> BoxedIterator<U> {
    Box::new(TransformIterator::new(input, move |p: Point<T>| Point {
        name: p.name,
        tags: p.tags,
        time: p.time,
        value: if p.nil { U::zero() } else { f(&p.value) },
        nil: p.nil,
        aux: p.aux,
    }))
}

// ============================================================================
// Builders
// ============================================================================

/// Build the iterator for `stream op literal`.
pub fn build_rhs_transform_iterator(
    lhs: TypedIterator,
    lit: &Literal,
    op: BinaryOp,
) -> Result<TypedIterator> {
    build_literal_transform(lhs, lit, op, false)
}

/// Build the iterator for `literal op stream`.
pub fn build_lhs_transform_iterator(
    lit: &Literal,
    rhs: TypedIterator,
    op: BinaryOp,
) -> Result<TypedIterator> {
    build_literal_transform(rhs, lit, op, true)
}

/// Shared literal-on-one-side construction. `flipped` means the literal is the
/// left operand.
fn build_literal_transform(
    input: TypedIterator,
    lit: &Literal,
    op: BinaryOp,
    flipped: bool,
) -> Result<TypedIterator> {
    let input_type = input.data_type();
    let lit_type = lit.data_type();

    match (input_type, lit_type) {
        // Integer stream against an integer literal stays in the integer
        // family, except for division which always promotes.
        (DataType::Integer, DataType::Integer) => {
            let lit = match lit {
                Literal::Integer(v) | Literal::Duration(v) => *v,
                _ => unreachable!(),
            };
            let itr = input.into_integer(if flipped { "RHS" } else { "LHS" })?;
            if let Some(f) = integer_arith(op) {
                return Ok(TypedIterator::Integer(map_same(itr, move |&v| {
                    if flipped {
                        f(lit, v)
                    } else {
                        f(v, lit)
                    }
                })));
            }
            if op == BinaryOp::Div {
                return Ok(TypedIterator::Float(map_to(itr, move |&v| {
                    let (a, b) = if flipped { (lit, v) } else { (v, lit) };
                    if b == 0 {
                        0.0
                    } else {
                        a as f64 / b as f64
                    }
                })));
            }
            if let Some(f) = integer_cmp(op) {
                return Ok(TypedIterator::Boolean(map_to(itr, move |&v| {
                    if flipped {
                        f(lit, v)
                    } else {
                        f(v, lit)
                    }
                })));
            }
            let mut itr = itr;
            itr.close();
            Err(unsupported(op, DataType::Integer, DataType::Integer))
        }
        // Any other numeric pairing runs in the float family.
        (DataType::Float | DataType::Integer, DataType::Float | DataType::Integer) => {
            let lit = lit.as_f64().expect("numeric literal");
            let itr = input.into_float(if flipped { "RHS" } else { "LHS" })?;
            if let Some(f) = float_arith(op) {
                return Ok(TypedIterator::Float(map_same(itr, move |&v| {
                    if flipped {
                        f(lit, v)
                    } else {
                        f(v, lit)
                    }
                })));
            }
            if let Some(f) = float_cmp(op) {
                return Ok(TypedIterator::Boolean(map_to(itr, move |&v| {
                    if flipped {
                        f(lit, v)
                    } else {
                        f(v, lit)
                    }
                })));
            }
            let mut itr = itr;
            itr.close();
            Err(unsupported(op, input_type, lit_type))
        }
        (DataType::String, DataType::String) => {
            let lit = match lit {
                Literal::Str(s) => s.clone(),
                _ => unreachable!(),
            };
            let itr = match input {
                TypedIterator::Str(itr) => itr,
                _ => unreachable!(),
            };
            match op {
                BinaryOp::Eq => Ok(TypedIterator::Boolean(map_to(itr, move |v| *v == lit))),
                BinaryOp::Neq => Ok(TypedIterator::Boolean(map_to(itr, move |v| *v != lit))),
                _ => {
                    let mut itr = itr;
                    itr.close();
                    Err(unsupported(op, DataType::String, DataType::String))
                }
            }
        }
        (DataType::Boolean, DataType::Boolean) => {
            let lit = match lit {
                Literal::Boolean(b) => *b,
                _ => unreachable!(),
            };
            let itr = match input {
                TypedIterator::Boolean(itr) => itr,
                _ => unreachable!(),
            };
            let f: fn(bool, bool) -> bool = match op {
                BinaryOp::Eq => |a, b| a == b,
                BinaryOp::Neq => |a, b| a != b,
                BinaryOp::And => |a, b| a && b,
                BinaryOp::Or => |a, b| a || b,
                _ => return Err(unsupported(op, DataType::Boolean, DataType::Boolean)),
            };
            Ok(TypedIterator::Boolean(map_same(itr, move |&v| {
                if flipped {
                    f(lit, v)
                } else {
                    f(v, lit)
                }
            })))
        }
        _ => {
            let mut input = input;
            input.close();
            Err(QueryError::TypeMismatch {
                side: if flipped { "LHS" } else { "RHS" },
                found: lit_type,
                want: input_type,
            })
        }
    }
}

/// Build the combining iterator for `stream op stream`.
pub fn build_transform_iterator(
    lhs: TypedIterator,
    rhs: TypedIterator,
    op: BinaryOp,
) -> Result<TypedIterator> {
    let lhs_type = lhs.data_type();
    let rhs_type = rhs.data_type();

    match (lhs_type, rhs_type) {
        (DataType::Integer, DataType::Integer) => {
            let left = lhs.into_integer("LHS")?;
            let right = match rhs.into_integer("RHS") {
                Ok(itr) => itr,
                Err(e) => {
                    let mut left = left;
                    left.close();
                    return Err(e);
                }
            };
            if let Some(f) = integer_arith(op) {
                return Ok(TypedIterator::Integer(Box::new(BinaryExprIterator::new(
                    left,
                    right,
                    move |&a, &b| f(a, b),
                ))));
            }
            if op == BinaryOp::Div {
                // Integer division always promotes to float.
                return Ok(TypedIterator::Float(Box::new(BinaryExprIterator::new(
                    left,
                    right,
                    |&a, &b| if b == 0 { 0.0 } else { a as f64 / b as f64 },
                ))));
            }
            if let Some(f) = integer_cmp(op) {
                return Ok(TypedIterator::Boolean(Box::new(BinaryExprIterator::new(
                    left,
                    right,
                    move |&a, &b| f(a, b),
                ))));
            }
            let (mut left, mut right) = (left, right);
            left.close();
            right.close();
            Err(unsupported(op, lhs_type, rhs_type))
        }
        (DataType::Float | DataType::Integer, DataType::Float | DataType::Integer) => {
            let left = lhs.into_float("LHS")?;
            let right = match rhs.into_float("RHS") {
                Ok(itr) => itr,
                Err(e) => {
                    let mut left = left;
                    left.close();
                    return Err(e);
                }
            };
            if let Some(f) = float_arith(op) {
                return Ok(TypedIterator::Float(Box::new(BinaryExprIterator::new(
                    left,
                    right,
                    move |&a, &b| f(a, b),
                ))));
            }
            if let Some(f) = float_cmp(op) {
                return Ok(TypedIterator::Boolean(Box::new(BinaryExprIterator::new(
                    left,
                    right,
                    move |&a, &b| f(a, b),
                ))));
            }
            let (mut left, mut right) = (left, right);
            left.close();
            right.close();
            Err(unsupported(op, lhs_type, rhs_type))
        }
        (DataType::String, DataType::String) => {
            let (left, right) = match (lhs, rhs) {
                (TypedIterator::Str(l), TypedIterator::Str(r)) => (l, r),
                _ => unreachable!(),
            };
            match op {
                BinaryOp::Eq => Ok(TypedIterator::Boolean(Box::new(BinaryExprIterator::new(
                    left,
                    right,
                    |a: &String, b: &String| a == b,
                )))),
                BinaryOp::Neq => Ok(TypedIterator::Boolean(Box::new(BinaryExprIterator::new(
                    left,
                    right,
                    |a: &String, b: &String| a != b,
                )))),
                _ => {
                    let mut left = left;
                    let mut right = right;
                    left.close();
                    right.close();
                    Err(unsupported(op, lhs_type, rhs_type))
                }
            }
        }
        (DataType::Boolean, DataType::Boolean) => {
            let (left, right) = match (lhs, rhs) {
                (TypedIterator::Boolean(l), TypedIterator::Boolean(r)) => (l, r),
                _ => unreachable!(),
            };
            let f: fn(bool, bool) -> bool = match op {
                BinaryOp::Eq => |a, b| a == b,
                BinaryOp::Neq => |a, b| a != b,
                BinaryOp::And => |a, b| a && b,
                BinaryOp::Or => |a, b| a || b,
                _ => {
                    let mut left = left;
                    let mut right = right;
                    left.close();
                    right.close();
                    return Err(unsupported(op, lhs_type, rhs_type));
                }
            };
            Ok(TypedIterator::Boolean(Box::new(BinaryExprIterator::new(
                left,
                right,
                move |&a, &b| f(a, b),
            ))))
        }
        _ => {
            let mut lhs = lhs;
            let mut rhs = rhs;
            lhs.close();
            rhs.close();
            Err(QueryError::TypeMismatch {
                side: "RHS",
                found: rhs_type,
                want: lhs_type,
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::VecIterator;
    use crate::point::{FloatPoint, IntegerPoint, Tags};

    fn int_itr(points: Vec<IntegerPoint>) -> TypedIterator {
        TypedIterator::Integer(Box::new(VecIterator::new(points)))
    }

    fn float_itr(points: Vec<FloatPoint>) -> TypedIterator {
        TypedIterator::Float(Box::new(VecIterator::new(points)))
    }

    fn drain_float(itr: TypedIterator) -> Vec<FloatPoint> {
        let mut itr = match itr {
            TypedIterator::Float(itr) => itr,
            other => panic!("expected float iterator, got {}", other.data_type()),
        };
        let mut out = Vec::new();
        while let Some(p) = itr.next_point().unwrap() {
            out.push(p);
        }
        out
    }

    #[test]
    fn test_integer_division_promotes_to_float() {
        let lhs = int_itr(vec![IntegerPoint::new("m", 1, 10)]);
        let rhs = int_itr(vec![IntegerPoint::new("m", 1, 3)]);
        let out = drain_float(build_transform_iterator(lhs, rhs, BinaryOp::Div).unwrap());
        assert_eq!(out.len(), 1);
        assert!((out[0].value - 10.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_integer_addition_stays_integer() {
        let lhs = int_itr(vec![IntegerPoint::new("m", 1, 2)]);
        let rhs = int_itr(vec![IntegerPoint::new("m", 1, 3)]);
        let itr = build_transform_iterator(lhs, rhs, BinaryOp::Add).unwrap();
        assert_eq!(itr.data_type(), DataType::Integer);
        let mut itr = match itr {
            TypedIterator::Integer(itr) => itr,
            _ => unreachable!(),
        };
        assert_eq!(itr.next_point().unwrap().unwrap().value, 5);
    }

    #[test]
    fn test_integer_overflow_wraps() {
        let lhs = int_itr(vec![IntegerPoint::new("m", 1, i64::MAX)]);
        let rhs = int_itr(vec![IntegerPoint::new("m", 1, 1)]);
        let mut itr = match build_transform_iterator(lhs, rhs, BinaryOp::Add).unwrap() {
            TypedIterator::Integer(itr) => itr,
            _ => unreachable!(),
        };
        assert_eq!(itr.next_point().unwrap().unwrap().value, i64::MIN);
    }

    #[test]
    fn test_null_propagation() {
        let lhs = float_itr(vec![FloatPoint::new("m", 1, 5.0)]);
        let rhs = float_itr(vec![FloatPoint::null("m", Tags::new(), 1)]);
        let out = drain_float(build_transform_iterator(lhs, rhs, BinaryOp::Add).unwrap());
        assert_eq!(out.len(), 1);
        assert!(out[0].nil);
    }

    #[test]
    fn test_exhausted_side_yields_null() {
        let lhs = float_itr(vec![
            FloatPoint::new("m", 1, 1.0),
            FloatPoint::new("m", 2, 2.0),
        ]);
        let rhs = float_itr(vec![FloatPoint::new("m", 1, 10.0)]);
        let out = drain_float(build_transform_iterator(lhs, rhs, BinaryOp::Add).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, 11.0);
        assert!(out[1].nil);
        assert_eq!(out[1].time, 2);
    }

    #[test]
    fn test_division_by_zero_is_zero() {
        let lhs = float_itr(vec![FloatPoint::new("m", 1, 5.0)]);
        let rhs = float_itr(vec![FloatPoint::new("m", 1, 0.0)]);
        let out = drain_float(build_transform_iterator(lhs, rhs, BinaryOp::Div).unwrap());
        assert_eq!(out[0].value, 0.0);
        assert!(!out[0].nil);
    }

    #[test]
    fn test_rhs_literal_transform() {
        let lhs = float_itr(vec![FloatPoint::new("m", 1, 5.0)]);
        let out = drain_float(
            build_rhs_transform_iterator(lhs, &Literal::Number(2.0), BinaryOp::Mul).unwrap(),
        );
        assert_eq!(out[0].value, 10.0);
    }

    #[test]
    fn test_lhs_literal_transform_is_not_commutative() {
        let rhs = float_itr(vec![FloatPoint::new("m", 1, 4.0)]);
        let out = drain_float(
            build_lhs_transform_iterator(&Literal::Number(20.0), rhs, BinaryOp::Div).unwrap(),
        );
        assert_eq!(out[0].value, 5.0);
    }

    #[test]
    fn test_literal_comparison_produces_boolean() {
        let lhs = int_itr(vec![
            IntegerPoint::new("m", 1, 1),
            IntegerPoint::new("m", 2, 9),
        ]);
        let itr = build_rhs_transform_iterator(lhs, &Literal::Integer(5), BinaryOp::Gt).unwrap();
        assert_eq!(itr.data_type(), DataType::Boolean);
        let mut itr = match itr {
            TypedIterator::Boolean(itr) => itr,
            _ => unreachable!(),
        };
        assert!(!itr.next_point().unwrap().unwrap().value);
        assert!(itr.next_point().unwrap().unwrap().value);
    }

    #[test]
    fn test_literal_transform_preserves_nil() {
        let lhs = float_itr(vec![FloatPoint::null("m", Tags::new(), 1)]);
        let out = drain_float(
            build_rhs_transform_iterator(lhs, &Literal::Number(2.0), BinaryOp::Add).unwrap(),
        );
        assert!(out[0].nil);
    }

    #[test]
    fn test_mismatched_types_error() {
        let lhs = float_itr(vec![]);
        let rhs = TypedIterator::Str(Box::new(VecIterator::new(vec![])));
        let err = build_transform_iterator(lhs, rhs, BinaryOp::Add).unwrap_err();
        assert!(err.to_string().contains("type mismatch"));
    }
}

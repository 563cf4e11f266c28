//! Select planner: statement to iterator tree
//!
//! The planner walks a rewritten statement's projection, classifies each
//! expression, and wires one iterator per projected field. Projections made
//! only of raw field references share a single storage scan through the
//! auxiliary fan-out; projections with one aggregate and extra raw references
//! fan the aggregate's input out instead. Everything else builds recursively
//! through [`build_expr_iterator`].

use crate::aggregate::{
    new_bottom_iterator, new_count_iterator, new_derivative_iterator, new_distinct_iterator,
    new_median_iterator, new_percentile_iterator, new_spread_iterator, new_stddev_iterator,
    new_top_iterator,
};
use crate::ast::{contains_var_ref, reduce, Expr, Field, Literal, SelectStatement};
use crate::aux::AuxIterator;
use crate::error::{QueryError, Result};
use crate::iterator::{
    close_all, new_dedupe_iterator, new_limit_iterator, IteratorCreator, TypedIterator,
};
use crate::options::{FillPolicy, IteratorOptions, SelectOptions};
use crate::point::DataType;
use std::collections::BTreeMap;
use tracing::debug;

// ============================================================================
// Projection analysis
// ============================================================================

/// Calls and raw references gathered from a projection.
///
/// Call nodes are not descended into: a reference inside a call's arguments
/// belongs to the call, not to the surrounding projection.
struct SelectInfo {
    calls: Vec<Expr>,
    refs: BTreeMap<String, DataType>,
}

impl SelectInfo {
    fn new(stmt: &SelectStatement) -> Self {
        let mut info = SelectInfo {
            calls: Vec::new(),
            refs: BTreeMap::new(),
        };
        for field in &stmt.fields {
            info.gather(&field.expr);
        }
        info
    }

    fn gather(&mut self, expr: &Expr) {
        match expr {
            Expr::VarRef { name, data_type } => {
                self.refs.entry(name.clone()).or_insert(*data_type);
            }
            Expr::Call { .. } => self.calls.push(expr.clone()),
            Expr::Binary { lhs, rhs, .. } => {
                self.gather(lhs);
                self.gather(rhs);
            }
            Expr::Paren(inner) => self.gather(inner),
            Expr::Literal(_) => {}
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Execute a statement against an iterator creator, returning one iterator
/// per projected field.
///
/// `top` and `bottom` calls with interior tag references contribute extra
/// projected fields, appended directly after their call's field; these are
/// observable result columns.
pub fn select(
    stmt: &SelectStatement,
    ic: &dyn IteratorCreator,
    sopt: &SelectOptions,
) -> Result<Vec<TypedIterator>> {
    let mut opt = IteratorOptions::from_statement(stmt, sopt)?;

    let info = SelectInfo::new(stmt);
    if info.calls.len() > 1 && !info.refs.is_empty() {
        return Err(QueryError::MixedAggregateFields);
    }

    // Auxiliary fields are the sorted unique raw references.
    opt.aux = info.refs.keys().cloned().collect();

    // A projection of raw references only shares one storage scan.
    if info.calls.is_empty() && !info.refs.is_empty() {
        debug!(aux = ?opt.aux, "planning auxiliary fan-out pipeline");
        return build_aux_iterators(&stmt.fields, ic, &opt);
    }

    // Interior tag references of top/bottom ride along as auxiliary fields
    // and become implicit projected columns after their call.
    let mut fields: Vec<Field> = Vec::with_capacity(stmt.fields.len());
    for field in &stmt.fields {
        fields.push(field.clone());
        if let Expr::Call { name, args } = &field.expr {
            if (name == "top" || name == "bottom") && args.len() > 2 {
                for arg in &args[1..args.len() - 1] {
                    match arg {
                        Expr::VarRef { name: ref_name, .. } => {
                            opt.aux.push(ref_name.clone());
                            fields.push(Field::new(arg.clone()));
                        }
                        other => {
                            return Err(QueryError::InvalidArgument {
                                call: name.clone(),
                                reason: format!("expected tag reference, got {}", other),
                            })
                        }
                    }
                }
            }
        }
    }

    debug!(fields = fields.len(), "planning field iterator pipeline");
    build_field_iterators(&fields, ic, &opt)
}

// ============================================================================
// Raw-reference pipeline
// ============================================================================

/// Build one fan-out handle per projected field over a single shared scan.
fn build_aux_iterators(
    fields: &[Field],
    ic: &dyn IteratorCreator,
    opt: &IteratorOptions,
) -> Result<Vec<TypedIterator>> {
    let mut input = ic.create_iterator(opt)?;

    if opt.dedupe {
        input = new_dedupe_iterator(input);
    }
    if opt.limit > 0 || opt.offset > 0 {
        input = new_limit_iterator(input, opt);
    }

    let series_keys = match ic.series_keys(opt) {
        Ok(keys) => keys,
        Err(e) => {
            input.close();
            return Err(e);
        }
    };

    let aitr = AuxIterator::new(input, series_keys, opt);

    let mut itrs: Vec<Option<TypedIterator>> = Vec::with_capacity(fields.len());
    for field in fields {
        let expr = reduce(&field.expr);
        let built = match &expr {
            Expr::VarRef { name, data_type } => Ok(aitr.iterator(name, *data_type)),
            Expr::Binary { .. } => build_expr_iterator(&expr, &aitr, opt),
            other => Err(QueryError::InvalidExpression(other.to_string())),
        };
        match built {
            Ok(itr) => itrs.push(Some(itr)),
            Err(e) => {
                close_all(&mut itrs);
                aitr.close();
                return Err(e.for_field(field.to_string()));
            }
        }
    }

    // No field consumes the upstream directly, so a dedicated producer
    // drains it into the fan-out buffers.
    aitr.background();

    Ok(itrs.into_iter().map(|itr| itr.expect("built")).collect())
}

// ============================================================================
// Field pipeline
// ============================================================================

/// Build an iterator per field, fanning the single aggregate's stream out to
/// any fields made of raw references.
fn build_field_iterators(
    fields: &[Field],
    ic: &dyn IteratorCreator,
    opt: &IteratorOptions,
) -> Result<Vec<TypedIterator>> {
    let mut itrs: Vec<Option<TypedIterator>> = (0..fields.len()).map(|_| None).collect();

    let build = |itrs: &mut Vec<Option<TypedIterator>>| -> Result<()> {
        let mut has_aux_fields = false;
        let mut input: Option<usize> = None;

        // Calls build first so their iterator can feed the fan-out, while the
        // projection keeps the user's field order.
        for (i, field) in fields.iter().enumerate() {
            if contains_var_ref(&field.expr) {
                has_aux_fields = true;
                continue;
            }
            let expr = reduce(&field.expr);
            let itr =
                build_expr_iterator(&expr, ic, opt).map_err(|e| e.for_field(field.to_string()))?;
            itrs[i] = Some(itr);
            input = Some(i);
        }

        let input_index = match input {
            Some(i) if has_aux_fields => i,
            _ => return Ok(()),
        };

        // Validation left exactly one call, so its stream feeds the fan-out
        // and its projection slot becomes the pass-through.
        let series_keys = ic.series_keys(opt)?;
        let upstream = itrs[input_index].take().expect("input iterator");
        let aitr = AuxIterator::new(upstream, series_keys, opt);
        itrs[input_index] = Some(aitr.primary());

        for (i, field) in fields.iter().enumerate() {
            if itrs[i].is_some() {
                continue;
            }
            let expr = reduce(&field.expr);
            let itr = build_expr_iterator(&expr, &aitr, opt)
                .map_err(|e| e.for_field(field.to_string()))?;
            itrs[i] = Some(itr);
        }

        aitr.start();
        Ok(())
    };

    if let Err(e) = build(&mut itrs) {
        close_all(&mut itrs);
        return Err(e);
    }

    // Every field that defers on raw references needs an aggregate stream to
    // attach to; an expression mixing both inside itself has none.
    if itrs.iter().any(|itr| itr.is_none()) {
        close_all(&mut itrs);
        return Err(QueryError::InvalidExpression(
            "cannot mix raw field references and aggregates in a single expression".to_string(),
        ));
    }

    let mut out: Vec<TypedIterator> = itrs.into_iter().map(|itr| itr.expect("built")).collect();

    if opt.limit > 0 || opt.offset > 0 {
        out = out
            .into_iter()
            .map(|itr| new_limit_iterator(itr, opt))
            .collect();
    }

    Ok(out)
}

// ============================================================================
// Expression builder
// ============================================================================

/// Recursively build the iterator evaluating `expr`.
pub fn build_expr_iterator(
    expr: &Expr,
    ic: &dyn IteratorCreator,
    opt: &IteratorOptions,
) -> Result<TypedIterator> {
    match expr {
        Expr::Paren(inner) => build_expr_iterator(inner, ic, opt),
        Expr::VarRef { .. } => {
            let mut opt = opt.clone();
            opt.expr = Some(expr.clone());
            ic.create_iterator(&opt)
        }
        Expr::Call { name, args } => build_call_iterator(name, args, expr, ic, opt),
        Expr::Binary { lhs, op, rhs } => {
            match (lhs.is_literal(), rhs.is_literal()) {
                // Two literals could not be folded away by reduce.
                (true, true) => Err(QueryError::TwoLiterals),
                (false, true) => {
                    let lit = match rhs.as_ref() {
                        Expr::Literal(lit) => lit,
                        _ => unreachable!(),
                    };
                    let input = build_expr_iterator(lhs, ic, opt)?;
                    crate::transform::build_rhs_transform_iterator(input, lit, *op)
                }
                (true, false) => {
                    let lit = match lhs.as_ref() {
                        Expr::Literal(lit) => lit,
                        _ => unreachable!(),
                    };
                    let input = build_expr_iterator(rhs, ic, opt)?;
                    crate::transform::build_lhs_transform_iterator(lit, input, *op)
                }
                (false, false) => {
                    let left = build_expr_iterator(lhs, ic, opt)?;
                    let right = match build_expr_iterator(rhs, ic, opt) {
                        Ok(itr) => itr,
                        Err(e) => {
                            let mut left = left;
                            left.close();
                            return Err(e);
                        }
                    };
                    crate::transform::build_transform_iterator(left, right, *op)
                }
            }
        }
        Expr::Literal(_) => Err(QueryError::InvalidExpression(expr.to_string())),
    }
}

/// Validate and build the single field-reference argument of a call.
fn build_field_arg(
    call: &str,
    args: &[Expr],
    ic: &dyn IteratorCreator,
    opt: &IteratorOptions,
) -> Result<TypedIterator> {
    match args.first() {
        Some(arg @ Expr::VarRef { .. }) => build_expr_iterator(arg, ic, opt),
        other => Err(QueryError::InvalidArgument {
            call: call.to_string(),
            reason: format!(
                "expected field argument, got {}",
                other.map_or_else(|| "nothing".to_string(), |e| e.to_string())
            ),
        }),
    }
}

fn build_call_iterator(
    name: &str,
    args: &[Expr],
    expr: &Expr,
    ic: &dyn IteratorCreator,
    opt: &IteratorOptions,
) -> Result<TypedIterator> {
    let mut opt = opt.clone();
    opt.expr = Some(expr.clone());

    match name {
        // Distinct imposes interval alignment itself and takes no fill.
        "distinct" => {
            let input = build_field_arg("distinct", args, ic, &opt)?;
            let input = new_distinct_iterator(input, &opt)?;
            return Ok(crate::window::new_interval_iterator(input, &opt));
        }
        // Derivatives consume whatever their argument produces, bucketed or
        // raw, and apply no windowing of their own.
        "derivative" | "non_negative_derivative" => {
            if args.is_empty() || args.len() > 2 {
                return Err(QueryError::InvalidArgument {
                    call: name.to_string(),
                    reason: format!("expected 1 or 2 arguments, got {}", args.len()),
                });
            }
            let unit = opt.derivative_interval();
            let input = build_expr_iterator(&args[0], ic, &opt)?;
            return new_derivative_iterator(input, unit, name == "non_negative_derivative");
        }
        _ => {}
    }

    let itr = match name {
        "count" => match args.first() {
            Some(arg @ Expr::Call { name: inner, .. }) => {
                if inner == "distinct" {
                    let input = build_expr_iterator(arg, ic, &opt)?;
                    new_count_iterator(input, &opt)?
                } else {
                    // Aggregate arguments are only valid in the distinct form.
                    return Err(QueryError::InvalidArgument {
                        call: "count".to_string(),
                        reason: format!("cannot count an aggregate: {}", arg),
                    });
                }
            }
            _ => ic.create_iterator(&opt)?,
        },
        "min" | "max" | "sum" | "first" | "last" | "mean" => ic.create_iterator(&opt)?,
        "median" => {
            let input = build_field_arg("median", args, ic, &opt)?;
            new_median_iterator(input, &opt)?
        }
        "stddev" => {
            let input = build_field_arg("stddev", args, ic, &opt)?;
            new_stddev_iterator(input, &opt)?
        }
        "spread" => {
            let input = build_field_arg("spread", args, ic, &opt)?;
            new_spread_iterator(input, &opt)?
        }
        "percentile" => {
            if args.len() != 2 {
                return Err(QueryError::InvalidArgument {
                    call: "percentile".to_string(),
                    reason: format!("expected 2 arguments, got {}", args.len()),
                });
            }
            let percentile = match &args[1] {
                Expr::Literal(lit) => lit.as_f64(),
                _ => None,
            }
            .ok_or_else(|| QueryError::InvalidArgument {
                call: "percentile".to_string(),
                reason: format!("expected number argument, got {}", args[1]),
            })?;
            if !(percentile > 0.0 && percentile <= 100.0) {
                return Err(QueryError::InvalidPercentile(percentile));
            }
            let input = build_field_arg("percentile", args, ic, &opt)?;
            new_percentile_iterator(input, &opt, percentile)?
        }
        "top" | "bottom" => {
            if args.len() < 2 {
                return Err(QueryError::SelectorArity {
                    call: name.to_string(),
                    got: args.len(),
                });
            }
            let n = match args.last() {
                Some(Expr::Literal(Literal::Integer(n))) => *n,
                Some(Expr::Literal(Literal::Number(v))) if v.fract() == 0.0 => *v as i64,
                other => {
                    return Err(QueryError::InvalidArgument {
                        call: name.to_string(),
                        reason: format!(
                            "limit must be an integer, got {}",
                            other.map_or_else(|| "nothing".to_string(), |e| e.to_string())
                        ),
                    })
                }
            };
            if n < 1 {
                return Err(QueryError::SelectorLimit {
                    call: name.to_string(),
                    got: n,
                });
            }

            // Interior tag references resolve to their auxiliary positions.
            let mut tag_idx = Vec::new();
            for arg in &args[1..args.len() - 1] {
                match arg {
                    Expr::VarRef { name: ref_name, .. } => {
                        if let Some(i) = opt.aux.iter().position(|a| a == ref_name) {
                            tag_idx.push(i);
                        }
                    }
                    other => {
                        return Err(QueryError::InvalidArgument {
                            call: name.to_string(),
                            reason: format!("expected tag reference, got {}", other),
                        })
                    }
                }
            }

            let input = build_field_arg(name, args, ic, &opt)?;
            if name == "top" {
                new_top_iterator(input, &opt, n as usize, tag_idx)?
            } else {
                new_bottom_iterator(input, &opt, n as usize, tag_idx)?
            }
        }
        other => return Err(QueryError::UnsupportedCall(other.to_string())),
    };

    // Top and bottom bucket internally; everything else aligns to the
    // interval here, then fill synthesizes empty buckets.
    let itr = if name != "top" && name != "bottom" {
        crate::window::new_interval_iterator(itr, &opt)
    } else {
        itr
    };
    let itr = if !opt.interval.is_zero() && !matches!(opt.fill, FillPolicy::None) {
        crate::window::new_fill_iterator(itr, &opt)
    } else {
        itr
    };
    Ok(itr)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::new_call_iterator;
    use crate::ast::{BinaryOp, Measurement};
    use crate::iterator::{SeriesKey, VecIterator};
    use crate::point::{FloatPoint, Value};
    use std::collections::{HashMap, HashSet};

    /// Minimal creator backed by a fixed float series.
    struct FixedCreator {
        points: Vec<FloatPoint>,
    }

    impl IteratorCreator for FixedCreator {
        fn create_iterator(&self, opt: &IteratorOptions) -> Result<TypedIterator> {
            let leaf = TypedIterator::Float(Box::new(VecIterator::new(self.points.clone())));
            match &opt.expr {
                Some(Expr::Call { .. }) => new_call_iterator(leaf, opt),
                _ => Ok(leaf),
            }
        }

        fn series_keys(&self, _opt: &IteratorOptions) -> Result<Vec<SeriesKey>> {
            Ok(vec![SeriesKey::new("m", crate::point::Tags::new())])
        }

        fn field_dimensions(
            &self,
            _sources: &[Measurement],
        ) -> Result<(HashMap<String, DataType>, HashSet<String>)> {
            Ok((HashMap::new(), HashSet::new()))
        }
    }

    fn creator() -> FixedCreator {
        FixedCreator {
            points: vec![
                FloatPoint::new("m", 1, 1.0).with_aux(vec![Value::Float(1.0)]),
                FloatPoint::new("m", 2, 2.0).with_aux(vec![Value::Float(2.0)]),
            ],
        }
    }

    fn field(expr: Expr) -> Field {
        Field::new(expr)
    }

    #[test]
    fn test_mixed_aggregates_with_fields_rejected() {
        let stmt = SelectStatement {
            fields: vec![
                field(Expr::call("mean", vec![Expr::var_ref("v", DataType::Float)])),
                field(Expr::call("max", vec![Expr::var_ref("v", DataType::Float)])),
                field(Expr::var_ref("host", DataType::String)),
            ],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let err = select(&stmt, &creator(), &SelectOptions::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot select fields when selecting multiple aggregates"
        );
    }

    #[test]
    fn test_top_zero_limit_rejected() {
        let stmt = SelectStatement {
            fields: vec![field(Expr::call(
                "top",
                vec![
                    Expr::var_ref("v", DataType::Float),
                    Expr::Literal(Literal::Integer(0)),
                ],
            ))],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let err = select(&stmt, &creator(), &SelectOptions::default()).unwrap_err();
        assert!(err.to_string().contains("top() limit must be at least 1"));
    }

    #[test]
    fn test_top_arity_rejected() {
        let stmt = SelectStatement {
            fields: vec![field(Expr::call(
                "top",
                vec![Expr::var_ref("v", DataType::Float)],
            ))],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let err = select(&stmt, &creator(), &SelectOptions::default()).unwrap_err();
        assert!(err
            .to_string()
            .contains("top() requires 2 or more arguments, got 1"));
    }

    #[test]
    fn test_unsupported_call_rejected() {
        let stmt = SelectStatement {
            fields: vec![field(Expr::call(
                "exp",
                vec![Expr::var_ref("v", DataType::Float)],
            ))],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let err = select(&stmt, &creator(), &SelectOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unsupported call: exp"));
    }

    #[test]
    fn test_two_literals_rejected() {
        // A non-foldable pair would be required to reach the builder, so call
        // the builder directly with an unreduced expression.
        let expr = Expr::binary(
            Expr::Literal(Literal::Str("a".to_string())),
            BinaryOp::Add,
            Expr::Literal(Literal::Integer(1)),
        );
        let err =
            build_expr_iterator(&expr, &creator(), &IteratorOptions::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to construct an iterator from two literals"
        );
    }

    #[test]
    fn test_count_of_non_distinct_aggregate_rejected() {
        let stmt = SelectStatement {
            fields: vec![field(Expr::call(
                "count",
                vec![Expr::call("mean", vec![Expr::var_ref("v", DataType::Float)])],
            ))],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let err = select(&stmt, &creator(), &SelectOptions::default()).unwrap_err();
        assert!(err.to_string().contains("cannot count an aggregate"));
    }

    #[test]
    fn test_ref_mixed_into_aggregate_expression_rejected() {
        let stmt = SelectStatement {
            fields: vec![field(Expr::binary(
                Expr::var_ref("v", DataType::Float),
                BinaryOp::Add,
                Expr::call("mean", vec![Expr::var_ref("v", DataType::Float)]),
            ))],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let err = select(&stmt, &creator(), &SelectOptions::default()).unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot mix raw field references and aggregates"));
    }

    #[test]
    fn test_single_aggregate_plan() {
        let stmt = SelectStatement {
            fields: vec![field(Expr::call(
                "sum",
                vec![Expr::var_ref("v", DataType::Float)],
            ))],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let mut itrs = select(&stmt, &creator(), &SelectOptions::default()).unwrap();
        assert_eq!(itrs.len(), 1);
        let mut itr = match itrs.remove(0) {
            TypedIterator::Float(itr) => itr,
            other => panic!("expected float iterator, got {}", other.data_type()),
        };
        let p = itr.next_point().unwrap().unwrap();
        assert_eq!(p.value, 3.0);
        assert!(itr.next_point().unwrap().is_none());
    }

    #[test]
    fn test_empty_storage_yields_empty_streams() {
        let stmt = SelectStatement {
            fields: vec![field(Expr::call(
                "sum",
                vec![Expr::var_ref("v", DataType::Float)],
            ))],
            sources: vec![Measurement::new("m")],
            ..Default::default()
        };
        let empty = FixedCreator { points: Vec::new() };
        let mut itrs = select(&stmt, &empty, &SelectOptions::default()).unwrap();
        let mut itr = match itrs.remove(0) {
            TypedIterator::Float(itr) => itr,
            _ => unreachable!(),
        };
        assert!(itr.next_point().unwrap().is_none());
        itr.close();
        itr.close();
    }
}

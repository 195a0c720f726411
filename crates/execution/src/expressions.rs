use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, AsArray, BooleanArray, Datum, Float64Array, Int64Array,
    NullArray, Scalar, StringArray, UInt32Array,
};
use arrow::compute::kernels::{cmp, numeric};
use arrow::compute::{
    and_kleene, cast, filter_record_batch, is_not_null, is_null, not, or_kleene, take,
};
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use riq_common::{Result, RiqError};
use riq_planner::{BinaryOp, Expr, LiteralValue};

/// An [`Expr`] with column names resolved to batch positions.
#[derive(Debug, Clone)]
pub enum PhysicalExpr {
    Column(usize),
    Literal(ArrayRef),
    Binary {
        left: Box<PhysicalExpr>,
        op: BinaryOp,
        right: Box<PhysicalExpr>,
    },
    And(Box<PhysicalExpr>, Box<PhysicalExpr>),
    Or(Box<PhysicalExpr>, Box<PhysicalExpr>),
    Not(Box<PhysicalExpr>),
    IsNull(Box<PhysicalExpr>),
    IsNotNull(Box<PhysicalExpr>),
    InList {
        expr: Box<PhysicalExpr>,
        list: Vec<ArrayRef>,
        negated: bool,
    },
}

/// Result of evaluating a [`PhysicalExpr`]: a full column or a one-row scalar.
#[derive(Debug, Clone)]
pub enum ColumnarValue {
    Array(ArrayRef),
    Scalar(ArrayRef),
}

impl ColumnarValue {
    fn data_type(&self) -> &DataType {
        match self {
            ColumnarValue::Array(a) | ColumnarValue::Scalar(a) => a.data_type(),
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(self, ColumnarValue::Scalar(_))
    }

    fn map(self, f: impl FnOnce(ArrayRef) -> Result<ArrayRef>) -> Result<ColumnarValue> {
        Ok(match self {
            ColumnarValue::Array(a) => ColumnarValue::Array(f(a)?),
            ColumnarValue::Scalar(a) => ColumnarValue::Scalar(f(a)?),
        })
    }

    /// Materializes to `num_rows` values, repeating a scalar.
    pub fn into_array(self, num_rows: usize) -> Result<ArrayRef> {
        match self {
            ColumnarValue::Array(a) => Ok(a),
            ColumnarValue::Scalar(a) => repeat_scalar(&a, num_rows),
        }
    }
}

/// Resolves column names in `expr` against `schema`.
pub fn compile_expr(expr: &Expr, schema: &Schema) -> Result<PhysicalExpr> {
    Ok(match expr {
        Expr::Column(name) => {
            let idx = schema.index_of(name).map_err(|_| {
                RiqError::Planning(format!("predicate column '{name}' is not in the scan schema"))
            })?;
            PhysicalExpr::Column(idx)
        }
        Expr::Literal(v) => PhysicalExpr::Literal(literal_to_array(v)),
        Expr::BinaryOp { left, op, right } => PhysicalExpr::Binary {
            left: Box::new(compile_expr(left, schema)?),
            op: *op,
            right: Box::new(compile_expr(right, schema)?),
        },
        Expr::And(a, b) => PhysicalExpr::And(
            Box::new(compile_expr(a, schema)?),
            Box::new(compile_expr(b, schema)?),
        ),
        Expr::Or(a, b) => PhysicalExpr::Or(
            Box::new(compile_expr(a, schema)?),
            Box::new(compile_expr(b, schema)?),
        ),
        Expr::Not(x) => PhysicalExpr::Not(Box::new(compile_expr(x, schema)?)),
        Expr::IsNull(x) => PhysicalExpr::IsNull(Box::new(compile_expr(x, schema)?)),
        Expr::IsNotNull(x) => PhysicalExpr::IsNotNull(Box::new(compile_expr(x, schema)?)),
        Expr::InList {
            expr,
            list,
            negated,
        } => PhysicalExpr::InList {
            expr: Box::new(compile_expr(expr, schema)?),
            list: list.iter().map(literal_to_array).collect(),
            negated: *negated,
        },
    })
}

impl PhysicalExpr {
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<ColumnarValue> {
        match self {
            PhysicalExpr::Column(idx) => Ok(ColumnarValue::Array(Arc::clone(batch.column(*idx)))),
            PhysicalExpr::Literal(v) => Ok(ColumnarValue::Scalar(Arc::clone(v))),
            PhysicalExpr::Binary { left, op, right } => {
                let l = left.evaluate(batch)?;
                let r = right.evaluate(batch)?;
                eval_binary(l, *op, r)
            }
            PhysicalExpr::And(a, b) => {
                let n = batch.num_rows();
                let a = as_boolean(a.evaluate(batch)?.into_array(n)?)?;
                let b = as_boolean(b.evaluate(batch)?.into_array(n)?)?;
                let out = and_kleene(&a, &b).map_err(exec_err)?;
                Ok(ColumnarValue::Array(Arc::new(out)))
            }
            PhysicalExpr::Or(a, b) => {
                let n = batch.num_rows();
                let a = as_boolean(a.evaluate(batch)?.into_array(n)?)?;
                let b = as_boolean(b.evaluate(batch)?.into_array(n)?)?;
                let out = or_kleene(&a, &b).map_err(exec_err)?;
                Ok(ColumnarValue::Array(Arc::new(out)))
            }
            PhysicalExpr::Not(x) => x.evaluate(batch)?.map(|a| {
                let b = as_boolean(a)?;
                Ok(Arc::new(not(&b).map_err(exec_err)?) as ArrayRef)
            }),
            PhysicalExpr::IsNull(x) => x
                .evaluate(batch)?
                .map(|a| Ok(Arc::new(is_null(a.as_ref()).map_err(exec_err)?) as ArrayRef)),
            PhysicalExpr::IsNotNull(x) => x
                .evaluate(batch)?
                .map(|a| Ok(Arc::new(is_not_null(a.as_ref()).map_err(exec_err)?) as ArrayRef)),
            PhysicalExpr::InList {
                expr,
                list,
                negated,
            } => {
                let n = batch.num_rows();
                let target = expr.evaluate(batch)?;
                let mut acc = BooleanArray::from(vec![false; n]);
                for item in list {
                    let hit = eval_binary(
                        target.clone(),
                        BinaryOp::Eq,
                        ColumnarValue::Scalar(Arc::clone(item)),
                    )?;
                    let hit = as_boolean(hit.into_array(n)?)?;
                    acc = or_kleene(&acc, &hit).map_err(exec_err)?;
                }
                if *negated {
                    acc = not(&acc).map_err(exec_err)?;
                }
                Ok(ColumnarValue::Array(Arc::new(acc)))
            }
        }
    }

    /// Evaluates as a row mask; nulls count as "not selected" downstream.
    pub fn evaluate_mask(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let out = self.evaluate(batch)?.into_array(batch.num_rows())?;
        if out.data_type() == &DataType::Null {
            return Ok(BooleanArray::from(vec![None; batch.num_rows()]));
        }
        as_boolean(out)
    }
}

/// Keeps only the rows of `batch` for which `predicate` is true.
pub fn filter_batch(batch: &RecordBatch, predicate: &PhysicalExpr) -> Result<RecordBatch> {
    let mask = predicate.evaluate_mask(batch)?;
    filter_record_batch(batch, &mask).map_err(exec_err)
}

fn eval_binary(l: ColumnarValue, op: BinaryOp, r: ColumnarValue) -> Result<ColumnarValue> {
    let both_scalar = l.is_scalar() && r.is_scalar();
    let (l, r) = coerce_pair(l, r)?;
    let ld = as_datum(&l);
    let rd = as_datum(&r);
    let out: ArrayRef = match op {
        BinaryOp::Eq => Arc::new(cmp::eq(ld.as_ref(), rd.as_ref()).map_err(exec_err)?),
        BinaryOp::NotEq => Arc::new(cmp::neq(ld.as_ref(), rd.as_ref()).map_err(exec_err)?),
        BinaryOp::Lt => Arc::new(cmp::lt(ld.as_ref(), rd.as_ref()).map_err(exec_err)?),
        BinaryOp::LtEq => Arc::new(cmp::lt_eq(ld.as_ref(), rd.as_ref()).map_err(exec_err)?),
        BinaryOp::Gt => Arc::new(cmp::gt(ld.as_ref(), rd.as_ref()).map_err(exec_err)?),
        BinaryOp::GtEq => Arc::new(cmp::gt_eq(ld.as_ref(), rd.as_ref()).map_err(exec_err)?),
        BinaryOp::Plus => numeric::add(ld.as_ref(), rd.as_ref()).map_err(exec_err)?,
        BinaryOp::Minus => numeric::sub(ld.as_ref(), rd.as_ref()).map_err(exec_err)?,
        BinaryOp::Multiply => numeric::mul(ld.as_ref(), rd.as_ref()).map_err(exec_err)?,
        BinaryOp::Divide => numeric::div(ld.as_ref(), rd.as_ref()).map_err(exec_err)?,
    };
    Ok(if both_scalar {
        ColumnarValue::Scalar(out)
    } else {
        ColumnarValue::Array(out)
    })
}

fn as_datum(v: &ColumnarValue) -> Box<dyn Datum> {
    match v {
        ColumnarValue::Array(a) => Box::new(Arc::clone(a)),
        ColumnarValue::Scalar(a) => Box::new(Scalar::new(Arc::clone(a))),
    }
}

// Int64 widens to Float64; otherwise the scalar side is cast to the array side.
fn coerce_pair(l: ColumnarValue, r: ColumnarValue) -> Result<(ColumnarValue, ColumnarValue)> {
    let lt = l.data_type().clone();
    let rt = r.data_type().clone();
    if lt == rt {
        return Ok((l, r));
    }
    let target = match (&lt, &rt) {
        (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
            DataType::Float64
        }
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        _ if r.is_scalar() => lt.clone(),
        _ => rt.clone(),
    };
    let l = cast_value(l, &target)?;
    let r = cast_value(r, &target)?;
    Ok((l, r))
}

fn cast_value(v: ColumnarValue, to: &DataType) -> Result<ColumnarValue> {
    if v.data_type() == to {
        return Ok(v);
    }
    v.map(|a| cast(&a, to).map_err(exec_err))
}

fn as_boolean(a: ArrayRef) -> Result<BooleanArray> {
    match a.data_type() {
        DataType::Boolean => Ok(a.as_boolean().clone()),
        DataType::Null => Ok(BooleanArray::from(vec![None; a.len()])),
        other => Err(RiqError::Execution(format!(
            "expected boolean predicate result, got {other}"
        ))),
    }
}

fn repeat_scalar(a: &ArrayRef, num_rows: usize) -> Result<ArrayRef> {
    if a.data_type() == &DataType::Null {
        return Ok(new_null_array(&DataType::Null, num_rows));
    }
    let indices = UInt32Array::from(vec![0_u32; num_rows]);
    take(a.as_ref(), &indices, None).map_err(exec_err)
}

/// One-row Arrow array holding `v`.
pub fn literal_to_array(v: &LiteralValue) -> ArrayRef {
    match v {
        LiteralValue::Int64(x) => Arc::new(Int64Array::from(vec![*x])),
        LiteralValue::Float64(x) => Arc::new(Float64Array::from(vec![*x])),
        LiteralValue::Utf8(x) => Arc::new(StringArray::from(vec![x.as_str()])),
        LiteralValue::Boolean(x) => Arc::new(BooleanArray::from(vec![*x])),
        LiteralValue::Null => Arc::new(NullArray::new(1)),
    }
}

/// `num_rows` copies of `v` typed as `data_type` (partition key columns).
pub fn constant_column(
    v: &LiteralValue,
    data_type: &DataType,
    num_rows: usize,
) -> Result<ArrayRef> {
    if v.is_null() {
        return Ok(new_null_array(data_type, num_rows));
    }
    let one = cast(&literal_to_array(v), data_type).map_err(exec_err)?;
    repeat_scalar(&one, num_rows)
}

fn exec_err(e: arrow::error::ArrowError) -> RiqError {
    RiqError::Execution(e.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, AsArray, Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Int64Type, Schema};
    use arrow::record_batch::RecordBatch;
    use riq_planner::*;

    use super::{compile_expr, constant_column, filter_batch};

    fn sales_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("location_key", DataType::Int64, false),
            Field::new("sales", DataType::Float64, true),
            Field::new("region", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![12_i64, 7, 12, 3])),
                Arc::new(Float64Array::from(vec![Some(10.0), Some(2.5), None, Some(99.0)])),
                Arc::new(StringArray::from(vec![Some("East"), Some("West"), Some("East"), None])),
            ],
        )
        .expect("batch")
    }

    fn filtered_keys(e: &Expr) -> Vec<i64> {
        let batch = sales_batch();
        let compiled = compile_expr(e, batch.schema().as_ref()).expect("compile");
        let out = filter_batch(&batch, &compiled).expect("filter");
        out.column(0)
            .as_primitive::<Int64Type>()
            .values()
            .iter()
            .copied()
            .collect()
    }

    #[test]
    fn equality_against_literal_filters_rows() {
        assert_eq!(filtered_keys(&eq(col("location_key"), lit_i64(12))), vec![12, 12]);
    }

    #[test]
    fn null_comparisons_drop_rows() {
        assert_eq!(filtered_keys(&gt(col("sales"), lit_i64(5))), vec![12, 3]);
        assert_eq!(filtered_keys(&Expr::IsNull(Box::new(col("region")))), vec![3]);
    }

    #[test]
    fn boolean_combinators_and_in_list() {
        let e = or(
            eq(col("region"), lit_str("West")),
            in_list(col("location_key"), vec![LiteralValue::Int64(3)]),
        );
        assert_eq!(filtered_keys(&e), vec![7, 3]);
        let negated = not(eq(col("region"), lit_str("East")));
        assert_eq!(filtered_keys(&negated), vec![7]);
    }

    #[test]
    fn arithmetic_is_evaluated_per_row() {
        let e = eq(plus(col("location_key"), lit_i64(1)), lit_i64(8));
        assert_eq!(filtered_keys(&e), vec![7]);
    }

    #[test]
    fn identity_and_constant_false_filters() {
        assert_eq!(filtered_keys(&Expr::always_true()).len(), 4);
        assert!(filtered_keys(&Expr::always_false()).is_empty());
    }

    #[test]
    fn unknown_column_is_a_planning_error() {
        let batch = sales_batch();
        let err = compile_expr(&eq(col("nope"), lit_i64(1)), batch.schema().as_ref())
            .expect_err("unknown column");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn constant_columns_repeat_partition_values() {
        let arr = constant_column(&LiteralValue::Int64(2017), &DataType::Int64, 3).expect("const");
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.as_primitive::<Int64Type>().value(2), 2017);
        let nulls = constant_column(&LiteralValue::Null, &DataType::Utf8, 2).expect("nulls");
        assert_eq!(nulls.null_count(), 2);
    }
}

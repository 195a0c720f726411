//! Typed row view over Arrow batches.

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use arrow::record_batch::RecordBatch;
use riq_common::{Result, RiqError};
use riq_planner::LiteralValue;

/// One result row; values are in the batch's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(pub Vec<LiteralValue>);

impl Row {
    pub fn get(&self, idx: usize) -> Option<&LiteralValue> {
        self.0.get(idx)
    }
}

/// Converts batches to rows, in batch order then row order.
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    let mut out = Vec::with_capacity(batches.iter().map(|b| b.num_rows()).sum());
    for batch in batches {
        for row in 0..batch.num_rows() {
            let values = batch
                .columns()
                .iter()
                .map(|c| cell(c.as_ref(), row))
                .collect::<Result<Vec<_>>>()?;
            out.push(Row(values));
        }
    }
    Ok(out)
}

fn cell(col: &dyn Array, row: usize) -> Result<LiteralValue> {
    if col.is_null(row) {
        return Ok(LiteralValue::Null);
    }
    Ok(match col.data_type() {
        DataType::Int64 => LiteralValue::Int64(col.as_primitive::<Int64Type>().value(row)),
        DataType::Float64 => LiteralValue::Float64(col.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => LiteralValue::Utf8(col.as_string::<i32>().value(row).to_string()),
        DataType::Boolean => LiteralValue::Boolean(col.as_boolean().value(row)),
        DataType::Null => LiteralValue::Null,
        other => {
            return Err(RiqError::Unsupported(format!(
                "row conversion for column type {other}"
            )))
        }
    })
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;

use crate::catalog::{ColumnDef, ColumnType, Sensitivity, TableDescriptor};

pub(crate) fn fact_sales() -> TableDescriptor {
    TableDescriptor::new(
        "fact_sales",
        vec![
            ColumnDef::new("order_year", ColumnType::Int64, Sensitivity::Low),
            ColumnDef::new("order_month", ColumnType::Int64, Sensitivity::Low),
            ColumnDef::new("location_key", ColumnType::Int64, Sensitivity::Low),
            ColumnDef::new("customer_name", ColumnType::Utf8, Sensitivity::High),
            ColumnDef::new("sales", ColumnType::Float64, Sensitivity::Medium),
        ],
        &["order_year", "order_month"],
    )
    .with_option("partition.pad.order_month", "2")
}

/// Rows are `(year, month, location_key, customer_name, sales)`.
pub(crate) fn sales_batch(rows: &[(i64, i64, i64, Option<&str>, f64)]) -> RecordBatch {
    RecordBatch::try_new(
        fact_sales().arrow_schema(),
        vec![
            Arc::new(Int64Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
            Arc::new(StringArray::from(rows.iter().map(|r| r.3).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.4).collect::<Vec<_>>())),
        ],
    )
    .expect("sales batch")
}

pub(crate) fn unique_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

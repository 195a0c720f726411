#![allow(dead_code)]

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arrow::array::{Array, AsArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{Float64Type, Int64Type};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use riq_client::Warehouse;
use riq_common::{Result, WarehouseConfig};
use riq_policy::RoleRegistry;
use riq_storage::{
    ColumnDef, ColumnType, MemoryBackend, Sensitivity, StorageBackend, TableDescriptor,
};

pub const NAMES: [&str; 3] = ["John Smith", "Ann Lee", "Émile Zola"];
pub const LOCATIONS: [i64; 3] = [12, 13, 12];

pub fn unique_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

pub fn fact_sales() -> TableDescriptor {
    TableDescriptor::new(
        "fact_sales",
        vec![
            ColumnDef::new("order_year", ColumnType::Int64, Sensitivity::Low),
            ColumnDef::new("order_month", ColumnType::Int64, Sensitivity::Low),
            ColumnDef::new("location_key", ColumnType::Int64, Sensitivity::Low),
            ColumnDef::new("customer_id", ColumnType::Utf8, Sensitivity::High),
            ColumnDef::new("customer_name", ColumnType::Utf8, Sensitivity::High),
            ColumnDef::new("email", ColumnType::Utf8, Sensitivity::High),
            ColumnDef::new("phone", ColumnType::Utf8, Sensitivity::High),
            ColumnDef::new("sales", ColumnType::Float64, Sensitivity::Medium),
            ColumnDef::new("quantity", ColumnType::Int64, Sensitivity::Medium),
            ColumnDef::new("profit", ColumnType::Float64, Sensitivity::Medium),
            ColumnDef::new("discount", ColumnType::Float64, Sensitivity::Medium),
        ],
        &["order_year", "order_month"],
    )
    .with_option("partition.pad.order_month", "2")
}

/// Three rows per `(year, month)`, one per entry of [`NAMES`]; the third
/// row has no email.
pub fn sales_batch(months: &[(i64, i64)]) -> RecordBatch {
    let mut years = Vec::new();
    let mut month_col = Vec::new();
    let mut locations = Vec::new();
    let mut ids = Vec::new();
    let mut names = Vec::new();
    let mut emails = Vec::new();
    let mut phones = Vec::new();
    let mut sales = Vec::new();
    let mut quantity = Vec::new();
    let mut profit = Vec::new();
    let mut discount = Vec::new();
    for &(year, month) in months {
        for (i, name) in NAMES.iter().enumerate() {
            years.push(year);
            month_col.push(month);
            locations.push(LOCATIONS[i]);
            ids.push(format!("C-{i}"));
            names.push(name.to_string());
            let email = format!("{}@example.com", name.to_lowercase().replace(' ', "."));
            emails.push((i < 2).then_some(email));
            phones.push(format!("555-010{i}"));
            sales.push(month as f64 * 10.0 + i as f64);
            quantity.push(i as i64 + 1);
            profit.push(month as f64 + 0.5);
            discount.push(0.1 * i as f64);
        }
    }
    RecordBatch::try_new(
        fact_sales().arrow_schema(),
        vec![
            Arc::new(Int64Array::from(years)),
            Arc::new(Int64Array::from(month_col)),
            Arc::new(Int64Array::from(locations)),
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(names)),
            Arc::new(StringArray::from(emails)),
            Arc::new(StringArray::from(phones)),
            Arc::new(Float64Array::from(sales)),
            Arc::new(Int64Array::from(quantity)),
            Arc::new(Float64Array::from(profit)),
            Arc::new(Float64Array::from(discount)),
        ],
    )
    .expect("sales batch")
}

pub fn all_months(years: Range<i64>) -> Vec<(i64, i64)> {
    years
        .flat_map(|y| (1..=12).map(move |m| (y, m)))
        .collect()
}

/// Warehouse over `backend` with `fact_sales` written for `months`.
pub fn warehouse_with(
    backend: Arc<dyn StorageBackend>,
    config: WarehouseConfig,
    months: &[(i64, i64)],
) -> Warehouse {
    let warehouse =
        Warehouse::open(config, backend, RoleRegistry::retail_defaults()).expect("open");
    warehouse.register_table(fact_sales()).expect("register");
    if !months.is_empty() {
        warehouse
            .write_partitioned("fact_sales", &sales_batch(months))
            .expect("write");
    }
    warehouse
}

pub fn memory_warehouse(months: &[(i64, i64)]) -> Warehouse {
    warehouse_with(
        Arc::new(MemoryBackend::new()),
        WarehouseConfig::default(),
        months,
    )
}

pub fn strings(batches: &[RecordBatch], column: &str) -> Vec<Option<String>> {
    let mut out = Vec::new();
    for batch in batches {
        let idx = batch.schema().index_of(column).expect("column");
        let values = batch.column(idx).as_string::<i32>();
        for i in 0..values.len() {
            out.push(values.is_valid(i).then(|| values.value(i).to_string()));
        }
    }
    out
}

pub fn ints(batches: &[RecordBatch], column: &str) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| {
            let idx = b.schema().index_of(column).expect("column");
            b.column(idx)
                .as_primitive::<Int64Type>()
                .values()
                .to_vec()
        })
        .collect()
}

pub fn floats(batches: &[RecordBatch], column: &str) -> Vec<f64> {
    batches
        .iter()
        .flat_map(|b| {
            let idx = b.schema().index_of(column).expect("column");
            b.column(idx)
                .as_primitive::<Float64Type>()
                .values()
                .to_vec()
        })
        .collect()
}

pub fn column_names(batches: &[RecordBatch]) -> Vec<String> {
    batches
        .first()
        .map(|b| {
            b.schema()
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Backend whose reads of matching data files take `delay`.
#[derive(Debug)]
pub struct SlowBackend {
    inner: MemoryBackend,
    slow_paths: Vec<String>,
    delay: Duration,
}

impl SlowBackend {
    pub fn new(slow_paths: Vec<String>, delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::new(),
            slow_paths,
            delay,
        }
    }

    fn pause(&self, path: &str) {
        if self.slow_paths.iter().any(|p| path.starts_with(p.as_str())) {
            std::thread::sleep(self.delay);
        }
    }
}

impl StorageBackend for SlowBackend {
    fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.inner.put(path, data)
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        self.pause(path);
        self.inner.get(path)
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        self.pause(path);
        self.inner.get_range(path, range)
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.inner.size(path)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path)
    }
}

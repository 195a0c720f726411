use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use riq_common::{Result, RiqError};
use riq_execution::batches_to_rows;
use riq_planner::LiteralValue;
use tracing::{info, warn};

use crate::backend::StorageBackend;
use crate::catalog::TableDescriptor;
use crate::layout::{data_file_path, partition_location};
use crate::metastore::{MetadataStore, PartitionEntry};

/// Splits table-shaped batches into Hive partitions and records them.
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    backend: Arc<dyn StorageBackend>,
    store: Arc<MetadataStore>,
}

struct PartitionRows {
    key_values: BTreeMap<String, LiteralValue>,
    rows: Vec<u32>,
}

impl PartitionWriter {
    pub fn new(backend: Arc<dyn StorageBackend>, store: Arc<MetadataStore>) -> Self {
        Self { backend, store }
    }

    /// Writes one `data.parquet` per distinct partition key combination in
    /// `batch` and appends the manifest entries, in location order.
    ///
    /// `batch` must carry every table column (any order). Partitions that
    /// already exist are rejected before anything is written; a concurrent
    /// writer of the same key loses with `PartitionConflict` and never
    /// replaces the winner's data file.
    pub fn write(&self, table: &str, batch: &RecordBatch) -> Result<Vec<PartitionEntry>> {
        let descriptor = self.store.descriptor(table)?;
        let batch = conform(&descriptor, batch)?;
        let groups = group_by_partition(&descriptor, &batch)?;

        let snapshot = self.store.snapshot(table)?;
        for (location, group) in &groups {
            if snapshot.entries.iter().any(|e| e.key_values == group.key_values) {
                return Err(RiqError::PartitionConflict {
                    table: table.to_string(),
                    partition: location.clone(),
                });
            }
        }

        let data_indices = descriptor
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !descriptor.is_partition_key(&c.name))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();

        let mut entries = Vec::with_capacity(groups.len());
        for (location, group) in groups {
            let indices = UInt32Array::from(group.rows);
            let rows = take_record_batch(&batch, &indices)
                .and_then(|b| b.project(&data_indices))
                .map_err(|e| RiqError::Execution(format!("partition split failed: {e}")))?;
            let encoded = encode_parquet(&rows)?;
            let data_file = data_file_path(&location);
            let mut stored = false;
            // the put happens under the table's commit lock, after the key check
            let recorded = self
                .store
                .append_partition(table, group.key_values, &location, || {
                    self.backend.put(&data_file, encoded)?;
                    stored = true;
                    Ok(rows.num_rows() as u64)
                });
            match recorded {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    if stored {
                        if let Err(cleanup) = self.backend.delete(&data_file) {
                            warn!(
                                table = %table,
                                path = %data_file,
                                error = %cleanup,
                                "unrecorded data file left behind"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!(
            table = %table,
            operator = "PartitionWriter",
            partitions = entries.len(),
            rows = batch.num_rows(),
            "partitions written"
        );
        Ok(entries)
    }
}

/// Reorders `batch` to the descriptor's column order with declared types.
fn conform(descriptor: &TableDescriptor, batch: &RecordBatch) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut columns = Vec::with_capacity(descriptor.columns.len());
    for c in &descriptor.columns {
        let idx = schema.index_of(&c.name).map_err(|_| RiqError::MissingColumn {
            table: descriptor.name.clone(),
            column: c.name.clone(),
            partition: None,
        })?;
        let column = batch.column(idx);
        if column.data_type() != &c.column_type.data_type() {
            return Err(RiqError::SchemaConflict {
                table: descriptor.name.clone(),
                reason: format!(
                    "column '{}' has type {}, table declares {:?}",
                    c.name,
                    column.data_type(),
                    c.column_type
                ),
            });
        }
        columns.push(Arc::clone(column));
    }
    RecordBatch::try_new(descriptor.arrow_schema(), columns)
        .map_err(|e| RiqError::Execution(format!("batch does not fit table schema: {e}")))
}

fn group_by_partition(
    descriptor: &TableDescriptor,
    batch: &RecordBatch,
) -> Result<BTreeMap<String, PartitionRows>> {
    let key_indices = descriptor
        .partition_keys
        .iter()
        .map(|k| {
            batch
                .schema()
                .index_of(k)
                .map_err(|e| RiqError::Execution(format!("partition key '{k}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let keys = batch
        .project(&key_indices)
        .map_err(|e| RiqError::Execution(format!("partition key projection failed: {e}")))?;

    let mut groups: BTreeMap<String, PartitionRows> = BTreeMap::new();
    for (row_idx, row) in batches_to_rows(&[keys])?.into_iter().enumerate() {
        let key_values = descriptor
            .partition_keys
            .iter()
            .cloned()
            .zip(row.0)
            .collect::<BTreeMap<_, _>>();
        let location = partition_location(descriptor, &key_values)?;
        groups
            .entry(location)
            .or_insert_with(|| PartitionRows {
                key_values,
                rows: Vec::new(),
            })
            .rows
            .push(row_idx as u32);
    }
    Ok(groups)
}

fn encode_parquet(batch: &RecordBatch) -> Result<Bytes> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
        .map_err(|e| RiqError::Execution(format!("parquet writer init failed: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| RiqError::Execution(format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| RiqError::Execution(format!("parquet writer close failed: {e}")))?;
    Ok(Bytes::from(buf))
}

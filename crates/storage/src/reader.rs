use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use bytes::Bytes;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ProjectionMask;
use riq_common::{Result, RiqError};
use riq_execution::{
    batches_to_rows, compile_expr, constant_column, filter_batch, PhysicalExpr, Row,
};
use riq_planner::{combine_conjuncts, split_conjuncts, Expr, LiteralValue};
use tracing::debug;

use crate::backend::StorageBackend;
use crate::catalog::TableDescriptor;
use crate::metastore::PartitionEntry;

/// Row-level access rules applied by the reader before data leaves storage.
///
/// The row filter sees raw values; masking runs after it, and residual
/// clauses over masked columns are evaluated on the masked values.
pub trait BatchPolicy: Send + Sync + Debug {
    /// Literal `true` when rows are unrestricted.
    fn row_filter(&self) -> &Expr;

    /// Columns whose values [`BatchPolicy::mask_batch`] rewrites.
    fn masked_columns(&self) -> BTreeSet<String>;

    /// Rewrites masked columns present in `batch`, returning the number of
    /// non-null values masked. Columns absent from `batch` are ignored.
    fn mask_batch(&self, batch: RecordBatch) -> Result<(RecordBatch, u64)>;

    /// Metrics label (role name).
    fn label(&self) -> &str {
        "unrestricted"
    }
}

/// Identity policy: every row, no masking.
#[derive(Debug, Clone)]
pub struct NoPolicy {
    filter: Expr,
}

impl Default for NoPolicy {
    fn default() -> Self {
        Self {
            filter: Expr::always_true(),
        }
    }
}

impl BatchPolicy for NoPolicy {
    fn row_filter(&self) -> &Expr {
        &self.filter
    }

    fn masked_columns(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn mask_batch(&self, batch: RecordBatch) -> Result<(RecordBatch, u64)> {
        Ok((batch, 0))
    }
}

#[derive(Debug, Clone)]
enum ColumnSource {
    /// Partition key re-materialised from the manifest entry.
    Key(LiteralValue, DataType),
    /// Stored column, addressed by name in the decoded batch.
    Data(String),
}

/// Reads partitions of one table.
#[derive(Debug, Clone)]
pub struct ColumnarReader {
    backend: Arc<dyn StorageBackend>,
    descriptor: Arc<TableDescriptor>,
    batch_size: usize,
}

impl ColumnarReader {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        descriptor: Arc<TableDescriptor>,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            descriptor,
            batch_size: batch_size.max(1),
        }
    }

    /// Opens one partition for reading `requested_columns`.
    ///
    /// Only the requested columns plus those referenced by `residual` and the
    /// policy row filter are decoded. Output batches have exactly
    /// `requested_columns`, in request order.
    pub fn read(
        &self,
        entry: &PartitionEntry,
        requested_columns: &[String],
        residual: &Expr,
        policy: Arc<dyn BatchPolicy>,
    ) -> Result<PartitionScan> {
        let table = self.descriptor.name.clone();
        let partition = entry.location.clone();
        let corrupt = |reason: String| RiqError::CorruptPartition {
            table: table.clone(),
            partition: partition.clone(),
            reason,
        };

        let bytes = self
            .backend
            .get(&entry.data_file())
            .map_err(|e| corrupt(format!("data file unreadable: {e}")))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())
            .map_err(|e| corrupt(format!("parquet footer decode failed: {e}")))?;
        let file_schema = Arc::clone(builder.schema());

        let masked = policy.masked_columns();
        let (post_mask, pre_mask): (Vec<Expr>, Vec<Expr>) = split_conjuncts(residual.clone())
            .into_iter()
            .filter(|c| !c.is_always_true())
            .partition(|c| c.columns().iter().any(|col| masked.contains(col)));
        let mut pre_mask = pre_mask;
        pre_mask.push(policy.row_filter().clone());
        let pre_mask = combine_conjuncts(pre_mask);
        let post_mask = combine_conjuncts(post_mask);

        let mut needed = BTreeSet::new();
        needed.extend(requested_columns.iter().cloned());
        needed.extend(pre_mask.columns());
        needed.extend(post_mask.columns());

        let mut fields = Vec::with_capacity(needed.len());
        let mut sources = Vec::with_capacity(needed.len());
        let mut roots = Vec::new();
        for name in &needed {
            if self.descriptor.is_partition_key(name) {
                let def = self.descriptor.require_column(name)?;
                let value = entry.key_values.get(name).cloned().ok_or_else(|| {
                    corrupt(format!("manifest entry has no value for key '{name}'"))
                })?;
                let data_type = def.column_type.data_type();
                fields.push(Field::new(name, data_type.clone(), true));
                sources.push(ColumnSource::Key(value, data_type));
                continue;
            }
            let Ok(idx) = file_schema.index_of(name) else {
                return Err(RiqError::MissingColumn {
                    table: table.clone(),
                    column: name.clone(),
                    partition: Some(partition.clone()),
                });
            };
            roots.push(idx);
            fields.push(Field::new(
                name,
                file_schema.field(idx).data_type().clone(),
                true,
            ));
            sources.push(ColumnSource::Data(name.clone()));
        }
        let working: SchemaRef = Arc::new(Schema::new(fields));

        let projection = requested_columns
            .iter()
            .map(|c| {
                working
                    .index_of(c)
                    .map_err(|e| RiqError::Execution(format!("projection of '{c}' failed: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            table = %table,
            partition = %partition,
            operator = "ColumnarReader",
            decoded_columns = roots.len(),
            key_columns = sources.len() - roots.len(),
            "partition opened"
        );

        Ok(PartitionScan {
            table,
            partition,
            bytes,
            roots,
            sources,
            pre_mask: compile_filter(&pre_mask, &working)?,
            post_mask: compile_filter(&post_mask, &working)?,
            working,
            projection,
            policy,
            batch_size: self.batch_size,
        })
    }
}

fn compile_filter(e: &Expr, schema: &Schema) -> Result<Option<PhysicalExpr>> {
    if e.is_always_true() {
        return Ok(None);
    }
    compile_expr(e, schema).map(Some)
}

/// Totals for one fully consumed [`PartitionScan`].
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub batches: Vec<RecordBatch>,
    pub rows_decoded: u64,
    pub rows_emitted: u64,
    pub values_masked: u64,
}

/// An opened partition; iterating decodes it again, so scans are restartable.
#[derive(Debug)]
pub struct PartitionScan {
    table: String,
    partition: String,
    bytes: Bytes,
    roots: Vec<usize>,
    sources: Vec<ColumnSource>,
    working: SchemaRef,
    pre_mask: Option<PhysicalExpr>,
    post_mask: Option<PhysicalExpr>,
    projection: Vec<usize>,
    policy: Arc<dyn BatchPolicy>,
    batch_size: usize,
}

struct Processed {
    batch: RecordBatch,
    rows_in: usize,
    masked: u64,
}

impl PartitionScan {
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Policy-applied, projected batches. Empty batches are dropped.
    pub fn batches(&self) -> impl Iterator<Item = Result<RecordBatch>> + '_ {
        self.decoded().filter_map(move |raw| {
            match raw.and_then(|b| self.process(b)) {
                Ok(p) if p.batch.num_rows() == 0 => None,
                Ok(p) => Some(Ok(p.batch)),
                Err(e) => Some(Err(e)),
            }
        })
    }

    pub fn rows(&self) -> Result<Vec<Row>> {
        let batches = self.batches().collect::<Result<Vec<_>>>()?;
        batches_to_rows(&batches)
    }

    /// Consumes the whole partition, keeping counters for metrics.
    pub fn execute(&self) -> Result<ScanOutput> {
        let mut out = ScanOutput::default();
        for raw in self.decoded() {
            let p = self.process(raw?)?;
            out.rows_decoded += p.rows_in as u64;
            out.values_masked += p.masked;
            if p.batch.num_rows() > 0 {
                out.rows_emitted += p.batch.num_rows() as u64;
                out.batches.push(p.batch);
            }
        }
        Ok(out)
    }

    fn corrupt(&self, reason: String) -> RiqError {
        RiqError::CorruptPartition {
            table: self.table.clone(),
            partition: self.partition.clone(),
            reason,
        }
    }

    fn open(&self) -> Result<ParquetRecordBatchReader> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(self.bytes.clone())
            .map_err(|e| self.corrupt(format!("parquet footer decode failed: {e}")))?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), self.roots.iter().copied());
        builder
            .with_projection(mask)
            .with_batch_size(self.batch_size)
            .build()
            .map_err(|e| self.corrupt(format!("parquet reader open failed: {e}")))
    }

    fn decoded(&self) -> Box<dyn Iterator<Item = Result<RecordBatch>> + '_> {
        match self.open() {
            Ok(reader) => Box::new(reader.map(move |b| {
                b.map_err(|e| self.corrupt(format!("parquet decode failed: {e}")))
            })),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn process(&self, raw: RecordBatch) -> Result<Processed> {
        let rows_in = raw.num_rows();
        let columns = self
            .sources
            .iter()
            .map(|s| match s {
                ColumnSource::Key(v, dt) => constant_column(v, dt, rows_in),
                ColumnSource::Data(name) => raw
                    .column_by_name(name)
                    .cloned()
                    .ok_or_else(|| self.corrupt(format!("decoded batch lacks column '{name}'"))),
            })
            .collect::<Result<Vec<ArrayRef>>>()?;
        let working = RecordBatch::try_new_with_options(
            Arc::clone(&self.working),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(rows_in)),
        )
        .map_err(|e| self.corrupt(format!("decoded columns do not match schema: {e}")))?;

        let filtered = match &self.pre_mask {
            Some(p) => filter_batch(&working, p)?,
            None => working,
        };
        let (masked_batch, masked) = self.policy.mask_batch(filtered)?;
        let kept = match &self.post_mask {
            Some(p) => filter_batch(&masked_batch, p)?,
            None => masked_batch,
        };
        let batch = kept
            .project(&self.projection)
            .map_err(|e| RiqError::Execution(format!("output projection failed: {e}")))?;
        Ok(Processed {
            batch,
            rows_in,
            masked,
        })
    }
}

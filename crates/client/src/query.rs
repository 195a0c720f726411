//! One policy-checked read of a table, driven partition by partition.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use futures::stream::{self, BoxStream, StreamExt};
use riq_common::{global_metrics, QueryId, Result, RiqError};
use riq_planner::{combine_conjuncts, parse_select, split_conjuncts, Expr, LiteralValue};
use riq_policy::{AuditEvent, AuditOutcome, PolicyBundle, Principal};
use riq_storage::{resolve, BatchPolicy, ColumnarReader, PartitionEntry, ScanOutput};
use tracing::{debug, info, warn};

use crate::session::SharedSession;

/// What to read, as whom.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub table: String,
    /// `None` reads every table column.
    pub columns: Option<Vec<String>>,
    /// Conjunctive filters over raw (or, for masked columns, masked) values.
    pub filters: Vec<Expr>,
    pub principal: Principal,
    /// Fail with `ColumnDenied` instead of dropping denied columns.
    pub strict_columns: bool,
}

impl QueryRequest {
    pub fn new(table: &str, principal: Principal) -> Self {
        Self {
            table: table.to_string(),
            columns: None,
            filters: Vec::new(),
            principal,
            strict_columns: false,
        }
    }

    /// Request for `SELECT cols|* FROM table [WHERE ...]`.
    pub fn from_sql(sql: &str, principal: Principal) -> Result<Self> {
        let select = parse_select(sql)?;
        let mut request = Self::new(&select.table, principal);
        request.columns = select.columns;
        request.filters.extend(select.filter);
        Ok(request)
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict_columns = true;
        self
    }
}

/// Lifecycle of a [`QueryExecution`].
///
/// `Failed` is entered from `Pruning` (authorization, unknown names), from
/// `Reading` (corrupt data, missing columns, cancellation) and from
/// `PolicyApply` (output not shaped by the policy bundle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Pruning,
    /// Waiting on the partition at this manifest position.
    Reading(usize),
    /// Checking a decoded partition against the policy bundle.
    PolicyApply,
    Emitting,
    Done,
    Failed,
}

/// One partition's rows after masking and filtering.
#[derive(Debug, Clone)]
pub struct PartitionOutput {
    pub location: String,
    pub key_values: BTreeMap<String, LiteralValue>,
    pub batches: Vec<RecordBatch>,
    pub rows_decoded: u64,
    pub rows_emitted: u64,
    pub values_masked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Complete,
    /// Stopped by a timeout; `unread` lists what was never returned.
    Partial,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub query_id: QueryId,
    pub table: String,
    pub status: QueryOutcome,
    pub batches: Vec<RecordBatch>,
    /// Locations returned, in manifest order.
    pub completed: Vec<String>,
    /// Corrupt partitions passed over.
    pub skipped: Vec<String>,
    pub unread: Vec<String>,
    pub denied_columns: Vec<String>,
}

impl QueryResult {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn is_partial(&self) -> bool {
        self.status == QueryOutcome::Partial
    }

    /// Turns a partial result into `RiqError::PartialResult`.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            QueryOutcome::Complete => Ok(self),
            QueryOutcome::Partial => Err(RiqError::PartialResult {
                table: self.table,
                completed: self.completed.len(),
                unread: self.unread,
            }),
        }
    }
}

/// Stops a running query at its next partition boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct ReadOutcome {
    index: usize,
    entry: PartitionEntry,
    result: Result<ScanOutput>,
    elapsed: Duration,
}

struct Planned {
    bundle: Arc<PolicyBundle>,
    partitions: Vec<PartitionEntry>,
    reads: BoxStream<'static, ReadOutcome>,
}

/// Lazily executed query.
///
/// Authorization and pruning run on the first [`QueryExecution::next_partition`]
/// call. Partitions are read on the blocking pool, up to
/// `max_concurrent_partitions` at a time, and handed out in manifest order.
/// Decoding, row filtering and masking of one partition happen in one
/// blocking task, so `PolicyApply` and `Emitting` are passed through as its
/// output is taken over.
pub struct QueryExecution {
    id: QueryId,
    session: SharedSession,
    request: QueryRequest,
    state: QueryState,
    planned: Option<Planned>,
    next_index: usize,
    deadline: Option<tokio::time::Instant>,
    cancel: CancelHandle,
    completed: Vec<String>,
    skipped: Vec<String>,
    unread: Vec<String>,
    rows_returned: u64,
    audited: bool,
}

impl fmt::Debug for QueryExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecution")
            .field("id", &self.id)
            .field("table", &self.request.table)
            .field("state", &self.state)
            .field("next_index", &self.next_index)
            .finish()
    }
}

impl QueryExecution {
    pub(crate) fn new(session: SharedSession, request: QueryRequest) -> Self {
        let deadline = session
            .config
            .query_timeout()
            .map(|d| tokio::time::Instant::now() + d);
        Self {
            id: QueryId::next(),
            session,
            request,
            state: QueryState::Pending,
            planned: None,
            next_index: 0,
            deadline,
            cancel: CancelHandle::default(),
            completed: Vec::new(),
            skipped: Vec::new(),
            unread: Vec::new(),
            rows_returned: 0,
            audited: false,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Authorization outcome; `None` until the query has been planned.
    pub fn policy(&self) -> Option<&PolicyBundle> {
        self.planned.as_ref().map(|p| p.bundle.as_ref())
    }

    /// Next partition with rows ready for the caller, or `None` when the
    /// query is finished (completely or, after a timeout, partially).
    pub async fn next_partition(&mut self) -> Result<Option<PartitionOutput>> {
        if self.state == QueryState::Pending {
            self.state = QueryState::Pruning;
            match self.plan() {
                Ok(planned) => self.planned = Some(planned),
                Err(e) => return Err(self.fail(e)),
            }
        }
        loop {
            if matches!(self.state, QueryState::Done | QueryState::Failed) {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(self.fail(RiqError::Cancelled(self.id.to_string())));
            }
            self.state = QueryState::Reading(self.next_index);

            let deadline = self.deadline;
            // outer `None`: the query deadline passed
            let next = match self.planned.as_mut() {
                Some(planned) => match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, planned.reads.next())
                        .await
                        .ok(),
                    None => Some(planned.reads.next().await),
                },
                None => Some(None),
            };
            let Some(next) = next else {
                self.stop_partial("query timeout");
                return Ok(None);
            };
            let Some(read) = next else {
                self.finish();
                return Ok(None);
            };

            self.next_index = read.index + 1;
            let location = read.entry.location.clone();
            match read.result {
                Ok(out) => {
                    self.state = QueryState::PolicyApply;
                    let permitted = self
                        .planned
                        .as_ref()
                        .map(|p| p.bundle.permitted_columns.as_slice())
                        .unwrap_or_default();
                    if let Err(e) = ensure_permitted(&self.request.table, permitted, &out.batches) {
                        return Err(self.fail(e));
                    }
                    global_metrics().record_partition_read(
                        &self.request.table,
                        &self.role_label(),
                        out.rows_emitted,
                        out.rows_decoded.saturating_sub(out.rows_emitted),
                        out.values_masked,
                        read.elapsed.as_secs_f64(),
                    );
                    self.state = QueryState::Emitting;
                    debug!(
                        query_id = %self.id,
                        table = %self.request.table,
                        operator = "QueryExecution",
                        partition = %location,
                        rows = out.rows_emitted,
                        masked = out.values_masked,
                        "partition emitted"
                    );
                    self.completed.push(location.clone());
                    self.rows_returned += out.rows_emitted;
                    return Ok(Some(PartitionOutput {
                        location,
                        key_values: read.entry.key_values,
                        batches: out.batches,
                        rows_decoded: out.rows_decoded,
                        rows_emitted: out.rows_emitted,
                        values_masked: out.values_masked,
                    }));
                }
                Err(RiqError::Timeout { .. }) => {
                    self.next_index = read.index;
                    self.stop_partial("partition timeout");
                    return Ok(None);
                }
                Err(e @ RiqError::CorruptPartition { .. })
                    if self.session.config.skip_corrupt_partitions =>
                {
                    warn!(
                        query_id = %self.id,
                        table = %self.request.table,
                        operator = "QueryExecution",
                        partition = %location,
                        error = %e,
                        "skipping corrupt partition"
                    );
                    global_metrics().record_partition_skipped(&self.request.table);
                    self.skipped.push(location);
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Drains the query into one result.
    pub async fn collect(mut self) -> Result<QueryResult> {
        let mut batches = Vec::new();
        while let Some(output) = self.next_partition().await? {
            batches.extend(output.batches);
        }
        let status = if self.unread.is_empty() {
            QueryOutcome::Complete
        } else {
            QueryOutcome::Partial
        };
        Ok(QueryResult {
            query_id: self.id,
            table: self.request.table.clone(),
            status,
            batches,
            completed: std::mem::take(&mut self.completed),
            skipped: std::mem::take(&mut self.skipped),
            unread: std::mem::take(&mut self.unread),
            denied_columns: self
                .policy()
                .map(|p| p.denied_columns.clone())
                .unwrap_or_default(),
        })
    }

    fn plan(&self) -> Result<Planned> {
        let session = &self.session;
        let request = &self.request;
        let descriptor = session.store.descriptor(&request.table)?;
        let requested = match &request.columns {
            Some(columns) => columns.clone(),
            None => descriptor.column_names(),
        };
        let bundle = session.policy.authorize(
            &request.table,
            &requested,
            &request.principal,
            request.strict_columns,
        )?;

        let filter_columns = request
            .filters
            .iter()
            .flat_map(Expr::columns)
            .collect::<BTreeSet<_>>();
        for column in &filter_columns {
            descriptor.require_column(column)?;
        }
        bundle.check_filter_columns(&filter_columns)?;

        // Clauses over masked columns compare masked values, so they cannot prune.
        let (on_masked, plain): (Vec<Expr>, Vec<Expr>) = request
            .filters
            .iter()
            .cloned()
            .flat_map(split_conjuncts)
            .partition(|c| c.columns().iter().any(|col| bundle.masks.contains_key(col)));
        let resolved = resolve(&session.store, &request.table, &plain)?;
        let mut residual = split_conjuncts(resolved.residual.clone());
        residual.extend(on_masked);
        let residual = combine_conjuncts(residual);

        info!(
            query_id = %self.id,
            table = %request.table,
            operator = "QueryExecution",
            role = %bundle.role,
            partitions = resolved.partitions.len(),
            pruned = resolved.pruned(),
            denied = bundle.denied_columns.len(),
            "query planned"
        );

        let bundle = Arc::new(bundle);
        let reader = Arc::new(ColumnarReader::new(
            Arc::clone(&session.backend),
            Arc::clone(&resolved.descriptor),
            session.config.batch_size_rows,
        ));
        let reads = spawn_reads(
            reader,
            resolved.partitions.clone(),
            Arc::new(bundle.permitted_columns.clone()),
            Arc::new(residual),
            Arc::clone(&bundle) as Arc<dyn BatchPolicy>,
            session.config.partition_timeout(),
            session.config.max_concurrent_partitions,
        );
        Ok(Planned {
            bundle,
            partitions: resolved.partitions,
            reads,
        })
    }

    fn role_label(&self) -> String {
        match &self.planned {
            Some(p) => p.bundle.role.clone(),
            None => self.request.principal.role_name.clone(),
        }
    }

    fn finish(&mut self) {
        self.state = QueryState::Done;
        info!(
            query_id = %self.id,
            table = %self.request.table,
            operator = "QueryExecution",
            partitions = self.completed.len(),
            skipped = self.skipped.len(),
            rows = self.rows_returned,
            "query finished"
        );
        self.audit(AuditOutcome::Success, None);
    }

    fn stop_partial(&mut self, reason: &str) {
        self.state = QueryState::Done;
        self.unread = self
            .planned
            .as_ref()
            .map(|p| {
                p.partitions
                    .iter()
                    .skip(self.next_index)
                    .map(|e| e.location.clone())
                    .collect()
            })
            .unwrap_or_default();
        // in-flight reads are abandoned with the stream
        if let Some(planned) = self.planned.as_mut() {
            planned.reads = stream::empty().boxed();
        }
        global_metrics().record_partitions_unread(&self.request.table, self.unread.len() as u64);
        warn!(
            query_id = %self.id,
            table = %self.request.table,
            operator = "QueryExecution",
            completed = self.completed.len(),
            unread = self.unread.len(),
            reason,
            "query stopped early"
        );
        let detail = format!("{reason}: {} partitions unread", self.unread.len());
        self.audit(AuditOutcome::Partial, Some(detail));
    }

    fn fail(&mut self, error: RiqError) -> RiqError {
        self.state = QueryState::Failed;
        let outcome = match &error {
            RiqError::ColumnDenied { .. } | RiqError::UnknownRole(_) => AuditOutcome::Denied,
            RiqError::Cancelled(_) => AuditOutcome::Cancelled,
            _ => AuditOutcome::Failed,
        };
        warn!(
            query_id = %self.id,
            table = %self.request.table,
            operator = "QueryExecution",
            error = %error,
            "query failed"
        );
        self.audit(outcome, Some(error.to_string()));
        error
    }

    fn audit(&mut self, outcome: AuditOutcome, detail: Option<String>) {
        if self.audited {
            return;
        }
        self.audited = true;
        let mut event =
            AuditEvent::new(&self.request.principal, &self.request.table, "query", outcome)
                .with_counts(self.rows_returned, self.completed.len() as u64);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        if let Err(e) = self.session.audit.record(&event) {
            warn!(
                query_id = %self.id,
                table = %self.request.table,
                error = %e,
                "audit record failed"
            );
        }
    }
}

impl Drop for QueryExecution {
    fn drop(&mut self) {
        if !self.audited {
            self.audit(
                AuditOutcome::Cancelled,
                Some("dropped before completion".to_string()),
            );
        }
    }
}

/// Every emitted batch carries exactly the permitted columns, in order.
fn ensure_permitted(table: &str, permitted: &[String], batches: &[RecordBatch]) -> Result<()> {
    for batch in batches {
        let schema = batch.schema();
        let names = schema.fields().iter().map(|f| f.name().as_str());
        if !names.eq(permitted.iter().map(String::as_str)) {
            return Err(RiqError::Execution(format!(
                "partition output of table '{table}' does not match its permitted columns"
            )));
        }
    }
    Ok(())
}

fn spawn_reads(
    reader: Arc<ColumnarReader>,
    partitions: Vec<PartitionEntry>,
    columns: Arc<Vec<String>>,
    residual: Arc<Expr>,
    policy: Arc<dyn BatchPolicy>,
    partition_timeout: Option<Duration>,
    max_concurrent: usize,
) -> BoxStream<'static, ReadOutcome> {
    stream::iter(partitions.into_iter().enumerate())
        .map(move |(index, entry)| {
            let reader = Arc::clone(&reader);
            let columns = Arc::clone(&columns);
            let residual = Arc::clone(&residual);
            let policy = Arc::clone(&policy);
            async move {
                let started = Instant::now();
                let task_entry = entry.clone();
                let task = tokio::task::spawn_blocking(move || {
                    reader
                        .read(&task_entry, &columns, &residual, policy)?
                        .execute()
                });
                let result = match partition_timeout {
                    Some(limit) => match tokio::time::timeout(limit, task).await {
                        Ok(joined) => flatten_join(joined),
                        Err(_) => Err(RiqError::Timeout {
                            during: format!("reading partition {}", entry.location),
                            elapsed_ms: limit.as_millis() as u64,
                        }),
                    },
                    None => flatten_join(task.await),
                };
                ReadOutcome {
                    index,
                    entry,
                    result,
                    elapsed: started.elapsed(),
                }
            }
        })
        .buffered(max_concurrent.max(1))
        .boxed()
}

fn flatten_join(
    joined: std::result::Result<Result<ScanOutput>, tokio::task::JoinError>,
) -> Result<ScanOutput> {
    joined.map_err(|e| RiqError::Execution(format!("partition read task failed: {e}")))?
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use riq_common::{global_metrics, Result, SchemaVersion, WarehouseConfig};
use riq_policy::{AuditSink, NullAuditSink, Principal, RoleRegistry};
use riq_storage::{
    is_object_store_uri, LocalFsBackend, ObjectStoreBackend, PartitionEntry, StorageBackend,
    TableDescriptor,
};
use tracing::info;

use crate::query::{QueryExecution, QueryRequest};
use crate::session::{Session, SharedSession};

/// Entry point for reading and administering one warehouse root.
#[derive(Debug, Clone)]
pub struct Warehouse {
    session: SharedSession,
}

impl Warehouse {
    /// Opens the warehouse stored in `backend`, loading persisted manifests
    /// when `persist_manifests` is set.
    pub fn open(
        config: WarehouseConfig,
        backend: Arc<dyn StorageBackend>,
        registry: RoleRegistry,
    ) -> Result<Self> {
        Self::open_with_audit(config, backend, registry, Arc::new(NullAuditSink))
    }

    pub fn open_with_audit(
        config: WarehouseConfig,
        backend: Arc<dyn StorageBackend>,
        registry: RoleRegistry,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let session = Arc::new(Session::new(config, backend, registry, audit)?);
        info!(
            tables = session.store.tables()?.len(),
            max_concurrent_partitions = session.config.max_concurrent_partitions,
            "warehouse opened"
        );
        Ok(Self { session })
    }

    /// Storage backend for `root`: an object-store URI such as
    /// `s3://bucket/warehouse`, or a local directory.
    pub fn backend_for(
        root: &str,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn StorageBackend>> {
        if is_object_store_uri(root) {
            Ok(Arc::new(ObjectStoreBackend::from_uri(root, options)?))
        } else {
            Ok(Arc::new(LocalFsBackend::new(Path::new(root))))
        }
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.session.config
    }

    /// Registers a table, or appends columns to a registered one.
    pub fn register_table(&self, descriptor: TableDescriptor) -> Result<SchemaVersion> {
        self.session.policy.validate_table(&descriptor)?;
        self.session.store.register_table(descriptor)
    }

    /// Swaps the role registry; queries already planned keep their roles.
    pub fn set_roles(&self, registry: RoleRegistry) -> Result<()> {
        self.session.policy.replace_registry(registry)
    }

    /// Starts a query; nothing is read until the execution is polled.
    pub fn query(&self, request: QueryRequest) -> QueryExecution {
        QueryExecution::new(Arc::clone(&self.session), request)
    }

    /// `SELECT cols|* FROM table [WHERE ...]` as `principal`.
    pub fn sql(&self, sql: &str, principal: Principal) -> Result<QueryExecution> {
        Ok(self.query(QueryRequest::from_sql(sql, principal)?))
    }

    /// Splits `batch` into partitions of `table` and records them.
    pub fn write_partitioned(
        &self,
        table: &str,
        batch: &RecordBatch,
    ) -> Result<Vec<PartitionEntry>> {
        self.session.writer.write(table, batch)
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.session.store.tables()
    }

    pub fn describe_table(&self, table: &str) -> Result<Arc<TableDescriptor>> {
        self.session.store.descriptor(table)
    }

    /// Manifest entries of `table`, in manifest order.
    pub fn show_partitions(&self, table: &str) -> Result<Vec<PartitionEntry>> {
        Ok(self.session.store.snapshot(table)?.entries.as_ref().clone())
    }

    /// Rebuilds the manifest of `table` from the data files in storage.
    pub fn rebuild_manifest(&self, table: &str) -> Result<usize> {
        let descriptor = self.session.store.descriptor(table)?;
        self.session.store.rebuild_manifest(descriptor.as_ref().clone())
    }

    /// Re-attaches a table whose manifest is gone, scanning its data files.
    pub fn recover_table(&self, descriptor: TableDescriptor) -> Result<usize> {
        self.session.policy.validate_table(&descriptor)?;
        self.session.store.rebuild_manifest(descriptor)
    }

    pub fn prometheus_metrics(&self) -> String {
        global_metrics().render_prometheus()
    }
}

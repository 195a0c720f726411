use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use riq_common::{Result, RiqError, SchemaVersion};
use riq_planner::{evaluate, Expr, LiteralValue, Truth};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::catalog::{Evolution, TableDescriptor};
use crate::layout::{
    data_file_path, manifest_path, parse_partition_path, partition_location, table_prefix,
    validate_key_values, DATA_FILE_NAME, MANIFEST_FILE_NAME,
};
use crate::manifest::{footer_row_count, ManifestFile, MANIFEST_FORMAT_VERSION};

/// One physical partition of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub table: String,
    pub key_values: BTreeMap<String, LiteralValue>,
    /// Directory holding `data.parquet`, ending in `/`.
    pub location: String,
    pub row_count: u64,
    pub created_at_ms: u64,
    /// Table schema version the data file was written with.
    pub schema_version: SchemaVersion,
}

impl PartitionEntry {
    pub fn data_file(&self) -> String {
        data_file_path(&self.location)
    }
}

/// Immutable view of one table's manifest.
#[derive(Debug, Clone)]
pub struct ManifestSnapshot {
    pub descriptor: Arc<TableDescriptor>,
    pub entries: Arc<Vec<PartitionEntry>>,
}

/// Manifest entries not ruled out by a predicate over partition key values.
///
/// Iterating never blocks writers and can be repeated; it always sees the
/// snapshot taken when the listing was created.
#[derive(Debug, Clone)]
pub struct PartitionListing {
    entries: Arc<Vec<PartitionEntry>>,
    predicate: Expr,
}

impl PartitionListing {
    pub fn iter(&self) -> impl Iterator<Item = &PartitionEntry> + '_ {
        self.entries
            .iter()
            .filter(|e| evaluate(&self.predicate, &e.key_values) != Truth::False)
    }

    pub fn predicate(&self) -> &Expr {
        &self.predicate
    }
}

#[derive(Debug, Clone)]
struct TableState {
    current: Arc<TableDescriptor>,
    history: Vec<Arc<TableDescriptor>>,
    entries: Arc<Vec<PartitionEntry>>,
}

impl TableState {
    fn to_manifest(&self) -> ManifestFile {
        ManifestFile {
            format_version: MANIFEST_FORMAT_VERSION,
            table: self.current.name.clone(),
            schema_versions: self.history.iter().map(|d| d.as_ref().clone()).collect(),
            partitions: self.entries.as_ref().clone(),
        }
    }
}

/// Table descriptors and partition manifests.
///
/// Writers of one table are serialised by that table's commit lock. They
/// copy the manifest, append, persist, and only then swap the `Arc` under a
/// short map write lock. Readers only clone `Arc`s, so they never wait on
/// storage I/O and never see a partially written entry.
#[derive(Debug, Default)]
pub struct MetadataStore {
    tables: RwLock<BTreeMap<String, TableState>>,
    commits: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl MetadataStore {
    /// Process-local store; nothing is persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store persisting manifests to `backend`.
    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    /// Loads every `<table>/_METADATA.json` found in `backend`.
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for path in backend.list("")? {
            let Some(table) = path.strip_suffix(&format!("/{MANIFEST_FILE_NAME}")) else {
                continue;
            };
            if table.contains('/') {
                continue;
            }
            let manifest = ManifestFile::from_bytes(&path, &backend.get(&path)?)?;
            let history = manifest
                .schema_versions
                .into_iter()
                .map(Arc::new)
                .collect::<Vec<_>>();
            let Some(current) = history.last().cloned() else {
                continue;
            };
            debug!(
                table = %table,
                partitions = manifest.partitions.len(),
                schema_version = %current.schema_version,
                "manifest loaded"
            );
            tables.insert(
                table.to_string(),
                TableState {
                    current,
                    history,
                    entries: Arc::new(manifest.partitions),
                },
            );
        }
        info!(tables = tables.len(), "metadata store opened");
        Ok(Self {
            tables: RwLock::new(tables),
            commits: Mutex::new(BTreeMap::new()),
            backend: Some(backend),
        })
    }

    pub fn backend(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.backend.as_ref()
    }

    fn read_tables(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, TableState>>> {
        self.tables.read().map_err(|_| poisoned())
    }

    fn write_tables(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, TableState>>> {
        self.tables.write().map_err(|_| poisoned())
    }

    /// Commit lock of `table`, created on first use.
    fn commit_lock(&self, table: &str) -> Result<Arc<Mutex<()>>> {
        let mut commits = self.commits.lock().map_err(|_| poisoned())?;
        Ok(Arc::clone(commits.entry(table.to_string()).or_default()))
    }

    fn state(&self, table: &str) -> Result<Option<TableState>> {
        Ok(self.read_tables()?.get(table).cloned())
    }

    /// Persists `next` and makes it visible. Caller holds the commit lock.
    fn publish(&self, next: TableState) -> Result<()> {
        if let Some(backend) = &self.backend {
            backend.put(
                &manifest_path(&next.current.name),
                next.to_manifest().to_bytes()?,
            )?;
        }
        self.write_tables()?.insert(next.current.name.clone(), next);
        Ok(())
    }

    /// Registers a table or evolves its schema by appending columns.
    ///
    /// Returns the schema version now current. Re-registering an identical
    /// schema is a no-op.
    pub fn register_table(&self, descriptor: TableDescriptor) -> Result<SchemaVersion> {
        descriptor.validate()?;
        let lock = self.commit_lock(&descriptor.name)?;
        let _commit = lock.lock().map_err(|_| poisoned())?;
        self.register_locked(descriptor)
    }

    fn register_locked(&self, descriptor: TableDescriptor) -> Result<SchemaVersion> {
        let name = descriptor.name.clone();
        let next = match self.state(&name)? {
            None => {
                let current = Arc::new(TableDescriptor {
                    schema_version: SchemaVersion::INITIAL,
                    ..descriptor
                });
                TableState {
                    history: vec![Arc::clone(&current)],
                    current,
                    entries: Arc::new(Vec::new()),
                }
            }
            Some(state) => match state.current.evolution_to(&descriptor) {
                Ok(Evolution::Identical) => return Ok(state.current.schema_version),
                Ok(Evolution::Appended(added)) => {
                    let current = Arc::new(TableDescriptor {
                        schema_version: state.current.schema_version.next(),
                        ..descriptor
                    });
                    info!(
                        table = %name,
                        added_columns = added,
                        schema_version = %current.schema_version,
                        "table schema evolved"
                    );
                    let mut history = state.history;
                    history.push(Arc::clone(&current));
                    TableState {
                        current,
                        history,
                        entries: state.entries,
                    }
                }
                Err(reason) => return Err(RiqError::SchemaConflict { table: name, reason }),
            },
        };
        let version = next.current.schema_version;
        self.publish(next)?;
        Ok(version)
    }

    /// Appends a manifest entry stamped with the current schema version.
    pub fn record_partition(
        &self,
        table: &str,
        key_values: BTreeMap<String, LiteralValue>,
        location: &str,
        row_count: u64,
    ) -> Result<PartitionEntry> {
        self.append_partition(table, key_values, location, || Ok(row_count))
    }

    /// Appends a manifest entry whose data is produced by `write_data`.
    ///
    /// `write_data` runs under the table's commit lock, after the key values
    /// were checked against every recorded entry, and returns the row count.
    /// A second writer of the same key therefore fails with
    /// `PartitionConflict` before it touches storage.
    pub fn append_partition<F>(
        &self,
        table: &str,
        key_values: BTreeMap<String, LiteralValue>,
        location: &str,
        write_data: F,
    ) -> Result<PartitionEntry>
    where
        F: FnOnce() -> Result<u64>,
    {
        let lock = self.commit_lock(table)?;
        let _commit = lock.lock().map_err(|_| poisoned())?;
        let state = self
            .state(table)?
            .ok_or_else(|| RiqError::UnknownTable(table.to_string()))?;
        validate_key_values(&state.current, &key_values)?;
        if !location.starts_with(&table_prefix(table)) {
            return Err(RiqError::InvalidPartition {
                table: table.to_string(),
                reason: format!("location '{location}' is outside the table directory"),
            });
        }
        if let Some(existing) = state.entries.iter().find(|e| e.key_values == key_values) {
            return Err(RiqError::PartitionConflict {
                table: table.to_string(),
                partition: existing.location.clone(),
            });
        }

        let row_count = write_data()?;
        let location = if location.ends_with('/') {
            location.to_string()
        } else {
            format!("{location}/")
        };
        let entry = PartitionEntry {
            table: table.to_string(),
            key_values,
            location,
            row_count,
            created_at_ms: now_ms(),
            schema_version: state.current.schema_version,
        };
        let mut entries = state.entries.as_ref().clone();
        entries.push(entry.clone());
        self.publish(TableState {
            entries: Arc::new(entries),
            ..state
        })?;
        debug!(table = %table, location = %entry.location, rows = row_count, "partition recorded");
        Ok(entry)
    }

    pub fn list_partitions(&self, table: &str, predicate: &Expr) -> Result<PartitionListing> {
        let snapshot = self.snapshot(table)?;
        Ok(PartitionListing {
            entries: snapshot.entries,
            predicate: predicate.clone(),
        })
    }

    pub fn snapshot(&self, table: &str) -> Result<ManifestSnapshot> {
        let tables = self.read_tables()?;
        let state = tables
            .get(table)
            .ok_or_else(|| RiqError::UnknownTable(table.to_string()))?;
        Ok(ManifestSnapshot {
            descriptor: Arc::clone(&state.current),
            entries: Arc::clone(&state.entries),
        })
    }

    /// Current descriptor of `table`.
    pub fn descriptor(&self, table: &str) -> Result<Arc<TableDescriptor>> {
        Ok(self.snapshot(table)?.descriptor)
    }

    pub fn descriptor_version(
        &self,
        table: &str,
        version: SchemaVersion,
    ) -> Result<Arc<TableDescriptor>> {
        let tables = self.read_tables()?;
        let state = tables
            .get(table)
            .ok_or_else(|| RiqError::UnknownTable(table.to_string()))?;
        state
            .history
            .iter()
            .find(|d| d.schema_version == version)
            .cloned()
            .ok_or_else(|| {
                RiqError::Planning(format!("table '{table}' has no schema version {version}"))
            })
    }

    /// Registered table names, sorted.
    pub fn tables(&self) -> Result<Vec<String>> {
        Ok(self.read_tables()?.keys().cloned().collect())
    }

    /// Re-creates the manifest of `descriptor.name` by scanning storage.
    ///
    /// Used when `_METADATA.json` is lost: partition key values come from the
    /// directory names and row counts from the Parquet footers. Only
    /// directories spelled exactly as the layout writes them are accepted;
    /// other files, and files that do not decode, are skipped with a warning.
    /// The table's commit lock is held for the whole scan, so no append can
    /// slip in between. Returns the new entry count.
    pub fn rebuild_manifest(&self, descriptor: TableDescriptor) -> Result<usize> {
        let backend = self.backend.clone().ok_or_else(|| {
            RiqError::InvalidConfig("manifest rebuild needs a storage backend".to_string())
        })?;
        descriptor.validate()?;
        let table = descriptor.name.clone();
        let lock = self.commit_lock(&table)?;
        let _commit = lock.lock().map_err(|_| poisoned())?;
        self.register_locked(descriptor)?;
        let state = self
            .state(&table)?
            .ok_or_else(|| RiqError::UnknownTable(table.clone()))?;
        let current = Arc::clone(&state.current);

        let mut entries: Vec<PartitionEntry> = Vec::new();
        for path in backend.list(&table_prefix(&table))? {
            let Some(location) = path.strip_suffix(DATA_FILE_NAME) else {
                continue;
            };
            let key_values = match parse_partition_path(&current, location) {
                Ok(kv) => kv,
                Err(e) => {
                    warn!(table = %table, path = %path, error = %e, "skipping unrecognised file");
                    continue;
                }
            };
            if partition_location(&current, &key_values)? != location {
                warn!(table = %table, path = %path, "skipping non-canonical partition directory");
                continue;
            }
            if let Some(first) = entries.iter().find(|e| e.key_values == key_values) {
                warn!(
                    table = %table,
                    path = %path,
                    kept = %first.location,
                    "skipping duplicate partition"
                );
                continue;
            }
            let row_count = match footer_row_count(backend.as_ref(), &path) {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        table = %table,
                        path = %path,
                        error = %e,
                        "skipping undecodable partition"
                    );
                    continue;
                }
            };
            entries.push(PartitionEntry {
                table: table.clone(),
                key_values,
                location: location.to_string(),
                row_count,
                created_at_ms: now_ms(),
                schema_version: current.schema_version,
            });
        }

        let count = entries.len();
        self.publish(TableState {
            entries: Arc::new(entries),
            ..state
        })?;
        info!(table = %table, partitions = count, "manifest rebuilt from storage");
        Ok(count)
    }
}

fn poisoned() -> RiqError {
    RiqError::Execution("metadata store lock poisoned".to_string())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

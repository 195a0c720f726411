use thiserror::Error;

/// Canonical warehouse error taxonomy used across crates.
///
/// Classification guidance:
/// - [`RiqError::SchemaConflict`] / [`RiqError::UnknownTable`]: metadata misuse, never retried
/// - [`RiqError::CorruptPartition`]: physical data could not be decoded; skippable by config
/// - [`RiqError::MissingColumn`]: a column is absent from a table or partition schema
/// - [`RiqError::ColumnDenied`]: access policy removed columns under strict matching
/// - [`RiqError::PartialResult`] / [`RiqError::Timeout`]: time-bounded reads that did not finish
/// - [`RiqError::InvalidConfig`]: role registry, config file or environment contract violations
#[derive(Debug, Error)]
pub enum RiqError {
    /// Registration of a table whose schema is not an append-only evolution
    /// of the registered one.
    #[error("schema conflict on table '{table}': {reason}")]
    SchemaConflict { table: String, reason: String },

    /// Table is not registered in the metadata store.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Partition key values do not match the table's partition keys.
    #[error("invalid partition for table '{table}': {reason}")]
    InvalidPartition { table: String, reason: String },

    /// A manifest entry with the same partition key values already exists.
    #[error("partition {partition} of table '{table}' is already recorded")]
    PartitionConflict { table: String, partition: String },

    /// Physical partition data is unreadable or undecodable.
    ///
    /// Examples:
    /// - data file listed in the manifest is gone from storage
    /// - parquet footer or page decode failure
    #[error("corrupt partition {partition} of table '{table}': {reason}")]
    CorruptPartition {
        table: String,
        partition: String,
        reason: String,
    },

    /// Column is not part of the table (or of the partition's schema version).
    #[error("missing column '{column}' in table '{table}'{}", partition_suffix(.partition))]
    MissingColumn {
        table: String,
        column: String,
        partition: Option<String>,
    },

    /// Role may not see the listed columns in any form.
    #[error("role '{role}' is denied columns [{}] of table '{table}'", .columns.join(", "))]
    ColumnDenied {
        table: String,
        role: String,
        columns: Vec<String>,
    },

    /// Principal names a role the registry does not define.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// Read stopped early; completed partitions were returned, these were not.
    #[error(
        "partial result for table '{table}': {completed} partitions read, {} unread",
        .unread.len()
    )]
    PartialResult {
        table: String,
        completed: usize,
        unread: Vec<String>,
    },

    /// Operation exceeded its time bound with nothing usable to return.
    #[error("timeout after {elapsed_ms}ms while {during}")]
    Timeout { during: String, elapsed_ms: u64 },

    /// Query was cancelled by its caller.
    #[error("query {0} cancelled")]
    Cancelled(String),

    /// Invalid or inconsistent configuration / registry state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Request shape issues found before any data is read.
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime evaluation failures after planning succeeded.
    #[error("execution error: {0}")]
    Execution(String),

    /// Valid request for behavior this crate does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn partition_suffix(partition: &Option<String>) -> String {
    match partition {
        Some(p) => format!(" (partition {p})"),
        None => String::new(),
    }
}

impl RiqError {
    /// True for failures that point at caller misuse of metadata rather than
    /// at the data itself.
    pub fn is_metadata_error(&self) -> bool {
        matches!(
            self,
            RiqError::SchemaConflict { .. }
                | RiqError::UnknownTable(_)
                | RiqError::InvalidPartition { .. }
                | RiqError::PartitionConflict { .. }
        )
    }
}

/// Standard warehouse result alias.
pub type Result<T> = std::result::Result<T, RiqError>;

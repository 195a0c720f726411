use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RiqError};

/// Warehouse-wide read and layout settings.
///
/// Precedence (lowest to highest): built-in defaults, JSON config file,
/// `RIQ_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Target rows per decoded batch.
    pub batch_size_rows: usize,
    /// Upper bound on partitions read concurrently by one query.
    pub max_concurrent_partitions: usize,
    /// Skip (and report) undecodable partitions instead of failing the query.
    pub skip_corrupt_partitions: bool,
    /// Per-partition read bound; `None` disables it.
    pub partition_timeout_ms: Option<u64>,
    /// Whole-query read bound; `None` disables it.
    pub query_timeout_ms: Option<u64>,
    /// Persist `_METADATA.json` manifests on every metadata mutation.
    pub persist_manifests: bool,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 8192,
            max_concurrent_partitions: 4,
            skip_corrupt_partitions: false,
            partition_timeout_ms: None,
            query_timeout_ms: None,
            persist_manifests: true,
        }
    }
}

impl WarehouseConfig {
    /// Loads a JSON config file and applies environment overrides on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let cfg: WarehouseConfig = serde_json::from_str(&raw).map_err(|e| {
            RiqError::InvalidConfig(format!("config '{}' is not valid: {e}", path.display()))
        })?;
        cfg.with_env_overrides().validated()
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides().validated()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("RIQ_BATCH_SIZE_ROWS") {
            self.batch_size_rows = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("RIQ_MAX_CONCURRENT_PARTITIONS") {
            self.max_concurrent_partitions = v.max(1);
        }
        if let Some(v) = env_parse::<bool>("RIQ_SKIP_CORRUPT_PARTITIONS") {
            self.skip_corrupt_partitions = v;
        }
        if let Some(v) = env_parse::<u64>("RIQ_PARTITION_TIMEOUT_MS") {
            self.partition_timeout_ms = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse::<u64>("RIQ_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = (v > 0).then_some(v);
        }
        self
    }

    pub fn validated(self) -> Result<Self> {
        if self.batch_size_rows == 0 {
            return Err(RiqError::InvalidConfig(
                "batch_size_rows must be positive".to_string(),
            ));
        }
        if self.max_concurrent_partitions == 0 {
            return Err(RiqError::InvalidConfig(
                "max_concurrent_partitions must be positive".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn partition_timeout(&self) -> Option<Duration> {
        self.partition_timeout_ms.map(Duration::from_millis)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

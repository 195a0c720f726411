//! On-storage manifest (`<table>/_METADATA.json`) and Parquet footer probing.

use bytes::Bytes;
use riq_common::{Result, RiqError};
use serde::{Deserialize, Serialize};

use crate::backend::StorageBackend;
use crate::catalog::TableDescriptor;
use crate::metastore::PartitionEntry;

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const PARQUET_MAGIC: &[u8; 4] = b"PAR1";
const FOOTER_LEN: u64 = 8;

/// Persisted form of one table's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub format_version: u32,
    pub table: String,
    /// Every registered schema version, oldest first.
    pub schema_versions: Vec<TableDescriptor>,
    /// Manifest order.
    pub partitions: Vec<PartitionEntry>,
}

impl ManifestFile {
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec_pretty(self)
            .map(Bytes::from)
            .map_err(|e| {
                RiqError::Execution(format!("manifest encode failed for '{}': {e}", self.table))
            })
    }

    pub fn from_bytes(path: &str, data: &[u8]) -> Result<Self> {
        let manifest: ManifestFile = serde_json::from_slice(data)
            .map_err(|e| RiqError::InvalidConfig(format!("manifest '{path}' is not valid: {e}")))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(RiqError::Unsupported(format!(
                "manifest '{path}' has format version {}, expected {MANIFEST_FORMAT_VERSION}",
                manifest.format_version
            )));
        }
        if manifest.schema_versions.is_empty() {
            return Err(RiqError::InvalidConfig(format!(
                "manifest '{path}' has no schema versions"
            )));
        }
        Ok(manifest)
    }
}

/// Row count from a Parquet footer, reading only the footer bytes.
pub fn footer_row_count(backend: &dyn StorageBackend, path: &str) -> Result<u64> {
    let corrupt = |reason: String| RiqError::Execution(format!("'{path}': {reason}"));
    let size = backend.size(path)?;
    if size < FOOTER_LEN + PARQUET_MAGIC.len() as u64 {
        return Err(corrupt(format!("{size} bytes is too small for parquet")));
    }
    let tail = backend.get_range(path, size - FOOTER_LEN..size)?;
    if &tail[4..8] != PARQUET_MAGIC {
        return Err(corrupt("missing parquet magic".to_string()));
    }
    let metadata_len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as u64;
    if metadata_len + FOOTER_LEN > size {
        return Err(corrupt(format!("footer length {metadata_len} exceeds file size")));
    }
    let metadata = backend.get_range(path, size - FOOTER_LEN - metadata_len..size - FOOTER_LEN)?;
    #[allow(deprecated)]
    let decoded = parquet::file::footer::decode_metadata(&metadata)
        .map_err(|e| corrupt(format!("footer decode failed: {e}")))?;
    Ok(decoded.file_metadata().num_rows().max(0) as u64)
}

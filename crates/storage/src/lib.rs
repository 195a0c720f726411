//! Partitioned columnar storage: table catalog, partition manifests, Hive
//! layout and pruning, and the policy-aware Parquet reader.

pub mod backend;
pub mod catalog;
pub mod layout;
pub mod manifest;
pub mod metastore;
pub mod object_store_backend;
pub mod reader;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_util;

pub use backend::{is_not_found, LocalFsBackend, MemoryBackend, StorageBackend};
pub use catalog::{ColumnDef, ColumnType, Evolution, Sensitivity, TableDescriptor};
pub use layout::{resolve, ResolvedScan};
pub use metastore::{ManifestSnapshot, MetadataStore, PartitionEntry, PartitionListing};
pub use object_store_backend::{is_object_store_uri, ObjectStoreBackend};
pub use reader::{BatchPolicy, ColumnarReader, NoPolicy, PartitionScan, ScanOutput};
pub use writer::PartitionWriter;

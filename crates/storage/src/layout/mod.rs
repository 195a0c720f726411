//! Hive-style partition layout and partition pruning.
//!
//! A table lives under `<table>/`, each partition under
//! `<table>/<k1>=<v1>/<k2>=<v2>/` (keys in declaration order) holding one
//! `data.parquet` file, and the manifest at `<table>/_METADATA.json`.

mod paths;
mod resolve;

pub use paths::{
    data_file_path, escape_segment, manifest_path, parse_partition_path, partition_location,
    table_prefix, unescape_segment, validate_key_values, DATA_FILE_NAME, MANIFEST_FILE_NAME,
    NULL_PARTITION_VALUE,
};
pub use resolve::{resolve, ResolvedScan};

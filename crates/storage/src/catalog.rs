use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use riq_common::{Result, RiqError, SchemaVersion};
use riq_planner::LiteralValue;
use serde::{Deserialize, Serialize};

/// Value type of a warehouse column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
    Boolean,
}

impl ColumnType {
    pub fn data_type(self) -> DataType {
        match self {
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Boolean => DataType::Boolean,
        }
    }

    /// Types allowed for partition keys (must round-trip through a directory name).
    pub fn is_partitionable(self) -> bool {
        !matches!(self, ColumnType::Float64)
    }

    /// True when `v` is a value of this type; null is accepted by every type.
    pub fn accepts(self, v: &LiteralValue) -> bool {
        matches!(
            (self, v),
            (_, LiteralValue::Null)
                | (ColumnType::Int64, LiteralValue::Int64(_))
                | (ColumnType::Float64, LiteralValue::Float64(_))
                | (ColumnType::Utf8, LiteralValue::Utf8(_))
                | (ColumnType::Boolean, LiteralValue::Boolean(_))
        )
    }

    /// Parses the textual form of a value (directory names, principal attributes).
    pub fn parse_literal(self, text: &str) -> Option<LiteralValue> {
        match self {
            ColumnType::Int64 => text.trim().parse().ok().map(LiteralValue::Int64),
            ColumnType::Float64 => text.trim().parse().ok().map(LiteralValue::Float64),
            ColumnType::Utf8 => Some(LiteralValue::Utf8(text.to_string())),
            ColumnType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Some(LiteralValue::Boolean(true)),
                "false" => Some(LiteralValue::Boolean(false)),
                _ => None,
            },
        }
    }
}

/// Data classification driving the access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub sensitivity: Sensitivity,
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType, sensitivity: Sensitivity) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            sensitivity,
        }
    }
}

/// Schema of a warehouse table plus its partitioning.
///
/// `schema_version` is assigned by the metadata store; the value passed to
/// `register_table` is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub partition_keys: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub schema_version: SchemaVersion,
}

/// How a registration relates to the stored descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evolution {
    Identical,
    /// Columns were appended; existing ones are untouched.
    Appended(usize),
}

impl TableDescriptor {
    pub fn new(name: &str, columns: Vec<ColumnDef>, partition_keys: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns,
            partition_keys: partition_keys.iter().map(|k| k.to_string()).collect(),
            options: BTreeMap::new(),
            schema_version: SchemaVersion::INITIAL,
        }
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Looks up a column, failing with `MissingColumn`.
    pub fn require_column(&self, name: &str) -> Result<&ColumnDef> {
        self.column(name).ok_or_else(|| RiqError::MissingColumn {
            table: self.name.clone(),
            column: name.to_string(),
            partition: None,
        })
    }

    pub fn is_partition_key(&self, name: &str) -> bool {
        self.partition_keys.iter().any(|k| k == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Columns stored inside partition data files (everything but the keys).
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| !self.is_partition_key(&c.name))
    }

    /// Zero-pad width for an integer partition key (`partition.pad.<key>`).
    pub fn pad_width(&self, key: &str) -> Option<usize> {
        self.options
            .get(&format!("partition.pad.{key}"))
            .and_then(|v| v.parse::<usize>().ok())
    }

    /// Full logical schema, partition keys included.
    pub fn arrow_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, c.column_type.data_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    /// Schema of `data.parquet` files.
    pub fn data_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.data_columns()
                .map(|c| Field::new(&c.name, c.column_type.data_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn validate(&self) -> Result<()> {
        let conflict = |reason: String| RiqError::SchemaConflict {
            table: self.name.clone(),
            reason,
        };
        if self.name.is_empty() || self.name.contains('/') || self.name.starts_with('_') {
            return Err(conflict(format!("invalid table name '{}'", self.name)));
        }
        if self.columns.is_empty() {
            return Err(conflict("table has no columns".to_string()));
        }
        let mut seen = BTreeSet::new();
        for c in &self.columns {
            if c.name.is_empty() || c.name.contains('=') || c.name.contains('/') {
                return Err(conflict(format!("invalid column name '{}'", c.name)));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(conflict(format!("duplicate column '{}'", c.name)));
            }
        }
        let mut keys = BTreeSet::new();
        for k in &self.partition_keys {
            let Some(def) = self.column(k) else {
                return Err(conflict(format!("partition key '{k}' is not a declared column")));
            };
            if !def.column_type.is_partitionable() {
                return Err(conflict(format!(
                    "partition key '{k}' has unsupported type {:?}",
                    def.column_type
                )));
            }
            // key values surface in locations, listings and errors unmasked
            if def.sensitivity != Sensitivity::Low {
                return Err(conflict(format!(
                    "partition key '{k}' must be LOW sensitivity, not {:?}",
                    def.sensitivity
                )));
            }
            if !keys.insert(k.as_str()) {
                return Err(conflict(format!("duplicate partition key '{k}'")));
            }
        }
        if self.data_columns().next().is_none() {
            return Err(conflict(
                "at least one column must not be a partition key".to_string(),
            ));
        }
        Ok(())
    }

    /// Classifies `next` against this (stored) descriptor.
    ///
    /// Only appending columns is allowed; the error string is the conflict reason.
    pub fn evolution_to(&self, next: &TableDescriptor) -> std::result::Result<Evolution, String> {
        if next.partition_keys != self.partition_keys {
            return Err(format!(
                "partition keys changed from [{}] to [{}]",
                self.partition_keys.join(", "),
                next.partition_keys.join(", ")
            ));
        }
        if next.options != self.options {
            return Err("table options cannot change after registration".to_string());
        }
        if next.columns.len() < self.columns.len() {
            return Err(format!(
                "{} column(s) dropped",
                self.columns.len() - next.columns.len()
            ));
        }
        for (old, new) in self.columns.iter().zip(&next.columns) {
            if old != new {
                return Err(format!(
                    "column '{}' changed (existing columns must keep their name, \
                     type, sensitivity and order)",
                    old.name
                ));
            }
        }
        Ok(match next.columns.len() - self.columns.len() {
            0 => Evolution::Identical,
            n => Evolution::Appended(n),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::fact_sales;

    #[test]
    fn validates_partition_keys() {
        fact_sales().validate().expect("valid");

        let mut bad = fact_sales();
        bad.partition_keys.push("sales".to_string());
        assert!(matches!(bad.validate(), Err(RiqError::SchemaConflict { .. })));

        let mut unknown = fact_sales();
        unknown.partition_keys = vec!["nope".to_string()];
        assert!(unknown.validate().is_err());
    }

    #[test]
    fn sensitive_columns_cannot_partition() {
        let orders = TableDescriptor::new(
            "orders",
            vec![
                ColumnDef::new("customer_name", ColumnType::Utf8, Sensitivity::High),
                ColumnDef::new("region", ColumnType::Utf8, Sensitivity::Medium),
                ColumnDef::new("sales", ColumnType::Float64, Sensitivity::Medium),
            ],
            &["customer_name"],
        );
        match orders.validate() {
            Err(RiqError::SchemaConflict { table, reason }) => {
                assert_eq!(table, "orders");
                assert!(reason.contains("customer_name"), "{reason}");
            }
            other => panic!("expected SchemaConflict, got {other:?}"),
        }

        let mut by_region = orders.clone();
        by_region.partition_keys = vec!["region".to_string()];
        assert!(matches!(by_region.validate(), Err(RiqError::SchemaConflict { .. })));
    }

    #[test]
    fn only_appends_are_an_evolution() {
        let base = fact_sales();
        assert_eq!(base.evolution_to(&fact_sales()), Ok(Evolution::Identical));

        let mut appended = fact_sales();
        appended
            .columns
            .push(ColumnDef::new("promo", ColumnType::Boolean, Sensitivity::Low));
        assert_eq!(base.evolution_to(&appended), Ok(Evolution::Appended(1)));

        let mut retyped = fact_sales();
        retyped.columns[4].column_type = ColumnType::Utf8;
        assert!(base.evolution_to(&retyped).is_err());

        let mut reordered = fact_sales();
        reordered.columns.swap(2, 3);
        assert!(base.evolution_to(&reordered).is_err());
    }

    #[test]
    fn data_schema_excludes_partition_keys() {
        let d = fact_sales();
        let names = d
            .data_schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["location_key", "customer_name", "sales"]);
        assert_eq!(d.arrow_schema().fields().len(), 5);
    }

    #[test]
    fn literals_parse_by_column_type() {
        assert_eq!(
            ColumnType::Int64.parse_literal("01"),
            Some(LiteralValue::Int64(1))
        );
        assert_eq!(ColumnType::Boolean.parse_literal("yes"), None);
        assert!(ColumnType::Utf8.accepts(&LiteralValue::Null));
        assert!(!ColumnType::Int64.accepts(&LiteralValue::Utf8("1".to_string())));
    }

    #[test]
    fn descriptor_deserializes_from_json() {
        let json = r#"{
            "name": "dim_customer",
            "columns": [
                {"name": "customer_key", "type": "int64", "sensitivity": "LOW"},
                {"name": "email", "type": "utf8", "sensitivity": "HIGH"}
            ],
            "partition_keys": []
        }"#;
        let d: TableDescriptor = serde_json::from_str(json).expect("parse");
        assert_eq!(d.schema_version, SchemaVersion::INITIAL);
        assert_eq!(d.columns[1].sensitivity, Sensitivity::High);
        d.validate().expect("valid");
    }
}

use std::collections::{BTreeMap, BTreeSet};

use riq_common::Result;
use riq_planner::{eq, Expr, LiteralValue};
use riq_storage::TableDescriptor;
use serde::{Deserialize, Serialize};

use crate::masking::MaskingRuleId;
use crate::principal::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    Full,
    ReadMasked,
    ReadFiltered,
    ReadAggregated,
}

/// `column = <principal attribute>`, e.g. `location_key = store_location_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilterTemplate {
    pub column: String,
    pub attribute: String,
}

impl RowFilterTemplate {
    /// Binds the template to `principal`.
    ///
    /// A missing attribute, or one that does not parse as the column's type,
    /// yields literal `false`: the principal sees no rows.
    pub fn expand(&self, principal: &Principal, descriptor: &TableDescriptor) -> Result<Expr> {
        let column_type = descriptor.require_column(&self.column)?.column_type;
        let value = principal
            .attribute(&self.attribute)
            .and_then(|raw| column_type.parse_literal(raw));
        Ok(match value {
            Some(v) if v != LiteralValue::Null => {
                eq(Expr::Column(self.column.clone()), Expr::Literal(v))
            }
            _ => Expr::always_false(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub access_level: AccessLevel,
    /// MEDIUM/HIGH columns shown unmasked.
    #[serde(default)]
    pub visible_columns: BTreeSet<String>,
    /// MEDIUM/HIGH columns shown through a masking rule.
    #[serde(default)]
    pub masked_columns: BTreeMap<String, MaskingRuleId>,
    #[serde(default)]
    pub row_filter: Option<RowFilterTemplate>,
}

impl RoleDefinition {
    pub fn new(name: &str, access_level: AccessLevel) -> Self {
        Self {
            name: name.to_string(),
            access_level,
            visible_columns: BTreeSet::new(),
            masked_columns: BTreeMap::new(),
            row_filter: None,
        }
    }

    pub fn with_visible(mut self, columns: &[&str]) -> Self {
        self.visible_columns
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn with_mask(mut self, column: &str, rule: MaskingRuleId) -> Self {
        self.masked_columns.insert(column.to_string(), rule);
        self
    }

    pub fn with_row_filter(mut self, column: &str, attribute: &str) -> Self {
        self.row_filter = Some(RowFilterTemplate {
            column: column.to_string(),
            attribute: attribute.to_string(),
        });
        self
    }

    /// Columns this role references anywhere.
    pub fn referenced_columns(&self) -> BTreeSet<&str> {
        let mut out = self
            .visible_columns
            .iter()
            .map(String::as_str)
            .collect::<BTreeSet<_>>();
        out.extend(self.masked_columns.keys().map(String::as_str));
        if let Some(f) = &self.row_filter {
            out.insert(f.column.as_str());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use riq_planner::*;
    use riq_storage::{ColumnDef, ColumnType, Sensitivity, TableDescriptor};

    use super::*;

    fn fact_sales() -> TableDescriptor {
        TableDescriptor::new(
            "fact_sales",
            vec![
                ColumnDef::new("order_year", ColumnType::Int64, Sensitivity::Low),
                ColumnDef::new("location_key", ColumnType::Int64, Sensitivity::Low),
            ],
            &["order_year"],
        )
    }

    #[test]
    fn row_filter_binds_typed_attribute() {
        let t = RowFilterTemplate {
            column: "location_key".to_string(),
            attribute: "store_location_key".to_string(),
        };
        let manager = Principal::new("store_manager").with_attribute("store_location_key", "12");
        assert_eq!(
            t.expand(&manager, &fact_sales()).expect("expand"),
            eq(col("location_key"), lit_i64(12))
        );
    }

    #[test]
    fn missing_or_bad_attribute_admits_nothing() {
        let t = RowFilterTemplate {
            column: "location_key".to_string(),
            attribute: "store_location_key".to_string(),
        };
        let anonymous = Principal::new("store_manager");
        assert_eq!(
            t.expand(&anonymous, &fact_sales()).expect("expand"),
            Expr::always_false()
        );
        let garbled = Principal::new("store_manager").with_attribute("store_location_key", "West");
        assert_eq!(
            t.expand(&garbled, &fact_sales()).expect("expand"),
            Expr::always_false()
        );
    }

    #[test]
    fn role_config_uses_screaming_access_levels() {
        let role: RoleDefinition = serde_json::from_str(
            r#"{"name": "analyst", "access_level": "READ_MASKED",
                "masked_columns": {"customer_name": "FIRST_CHARACTER"}}"#,
        )
        .expect("parse");
        assert_eq!(role.access_level, AccessLevel::ReadMasked);
        assert_eq!(
            role.masked_columns.get("customer_name"),
            Some(&MaskingRuleId::FirstCharacter)
        );
        assert!(role.row_filter.is_none());
    }
}

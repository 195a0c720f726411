use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use riq_common::{Result, RiqError};
use riq_storage::{Sensitivity, TableDescriptor};
use serde::{Deserialize, Serialize};

use crate::masking::MaskingRuleId;
use crate::role::{AccessLevel, RoleDefinition};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    roles: Vec<RoleDefinition>,
}

/// Validated set of role definitions, keyed by role name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleRegistry {
    roles: BTreeMap<String, RoleDefinition>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from role definitions, validating each.
    pub fn from_roles(roles: impl IntoIterator<Item = RoleDefinition>) -> Result<Self> {
        let mut out = Self::new();
        for role in roles {
            out.insert(role)?;
        }
        Ok(out)
    }

    /// Parses `{"roles": [...]}`.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(raw)
            .map_err(|e| RiqError::InvalidConfig(format!("role registry JSON is not valid: {e}")))?;
        Self::from_roles(file.roles)
    }

    /// Parses `[[roles]]` tables.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(raw)
            .map_err(|e| RiqError::InvalidConfig(format!("role registry TOML is not valid: {e}")))?;
        Self::from_roles(file.roles)
    }

    /// Loads a `.toml` or JSON registry file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml_str(&raw)
        } else {
            Self::from_json_str(&raw)
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        let file = RegistryFile {
            roles: self.roles.values().cloned().collect(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|e| RiqError::InvalidConfig(format!("role registry encode failed: {e}")))
    }

    /// Adds or replaces a role after table-independent validation.
    pub fn insert(&mut self, role: RoleDefinition) -> Result<()> {
        validate_role(&role)?;
        self.roles.insert(role.name.clone(), role);
        Ok(())
    }

    pub fn role(&self, name: &str) -> Result<&RoleDefinition> {
        self.roles
            .get(name)
            .ok_or_else(|| RiqError::UnknownRole(name.to_string()))
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }

    /// Checks every role against one table's column sensitivities.
    ///
    /// Roles span tables, so only columns this table declares are checked.
    pub fn validate_against(&self, descriptor: &TableDescriptor) -> Result<()> {
        for role in self.roles.values() {
            if role.access_level != AccessLevel::ReadAggregated {
                continue;
            }
            let high = role
                .referenced_columns()
                .into_iter()
                .filter(|c| {
                    descriptor
                        .column(c)
                        .is_some_and(|d| d.sensitivity == Sensitivity::High)
                })
                .map(str::to_string)
                .collect::<Vec<_>>();
            if !high.is_empty() {
                return Err(RiqError::InvalidConfig(format!(
                    "READ_AGGREGATED role '{}' lists HIGH columns [{}] of table '{}'",
                    role.name,
                    high.join(", "),
                    descriptor.name
                )));
            }
        }
        Ok(())
    }

    /// Checks that every column a role names exists in some table, and every
    /// per-table rule of [`RoleRegistry::validate_against`].
    pub fn validate_tables(&self, descriptors: &[&TableDescriptor]) -> Result<()> {
        for descriptor in descriptors {
            self.validate_against(descriptor)?;
        }
        let Some(first) = descriptors.first() else {
            return Ok(());
        };
        for role in self.roles.values() {
            for column in role.referenced_columns() {
                if !descriptors.iter().any(|d| d.column(column).is_some()) {
                    return Err(RiqError::MissingColumn {
                        table: if descriptors.len() == 1 {
                            first.name.clone()
                        } else {
                            "*".to_string()
                        },
                        column: column.to_string(),
                        partition: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// Roles of the retail warehouse: admin, analyst, store manager, executive.
    pub fn retail_defaults() -> Self {
        let roles = [
            RoleDefinition::new("admin", AccessLevel::Full),
            RoleDefinition::new("analyst", AccessLevel::ReadMasked)
                .with_visible(&["sales", "quantity", "profit", "discount"])
                .with_mask("customer_name", MaskingRuleId::FirstCharacter)
                .with_mask("email", MaskingRuleId::Email)
                .with_mask("customer_id", MaskingRuleId::Hash),
            RoleDefinition::new("store_manager", AccessLevel::ReadFiltered)
                .with_visible(&["sales", "quantity", "profit", "discount"])
                .with_mask("customer_name", MaskingRuleId::FirstCharacter)
                .with_mask("email", MaskingRuleId::Email)
                .with_row_filter("location_key", "store_location_key"),
            RoleDefinition::new("executive", AccessLevel::ReadAggregated)
                .with_visible(&["sales", "quantity", "profit", "discount"]),
        ];
        let mut out = Self::new();
        for role in roles {
            out.roles.insert(role.name.clone(), role);
        }
        out
    }
}

fn validate_role(role: &RoleDefinition) -> Result<()> {
    let invalid = |reason: String| {
        RiqError::InvalidConfig(format!("role '{}' is invalid: {reason}", role.name))
    };
    if role.name.trim().is_empty() {
        return Err(RiqError::InvalidConfig("role name must not be empty".to_string()));
    }
    let overlap = role
        .visible_columns
        .iter()
        .filter(|c| role.masked_columns.contains_key(*c))
        .cloned()
        .collect::<Vec<_>>();
    if !overlap.is_empty() {
        return Err(invalid(format!(
            "columns [{}] are both visible and masked",
            overlap.join(", ")
        )));
    }
    if role.access_level == AccessLevel::ReadFiltered && role.row_filter.is_none() {
        return Err(invalid("READ_FILTERED requires a row_filter".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use riq_storage::{ColumnDef, ColumnType};

    use super::*;

    fn fact_sales() -> TableDescriptor {
        TableDescriptor::new(
            "fact_sales",
            vec![
                ColumnDef::new("order_year", ColumnType::Int64, Sensitivity::Low),
                ColumnDef::new("location_key", ColumnType::Int64, Sensitivity::Low),
                ColumnDef::new("customer_name", ColumnType::Utf8, Sensitivity::High),
                ColumnDef::new("email", ColumnType::Utf8, Sensitivity::High),
                ColumnDef::new("customer_id", ColumnType::Utf8, Sensitivity::High),
                ColumnDef::new("sales", ColumnType::Float64, Sensitivity::Medium),
                ColumnDef::new("quantity", ColumnType::Int64, Sensitivity::Medium),
                ColumnDef::new("profit", ColumnType::Float64, Sensitivity::Medium),
                ColumnDef::new("discount", ColumnType::Float64, Sensitivity::Medium),
            ],
            &["order_year"],
        )
    }

    #[test]
    fn loads_json_and_toml() {
        let json = r#"{"roles": [
            {"name": "admin", "access_level": "FULL"},
            {"name": "store_manager", "access_level": "READ_FILTERED",
             "visible_columns": ["sales"],
             "row_filter": {"column": "location_key", "attribute": "store_location_key"}}
        ]}"#;
        let from_json = RoleRegistry::from_json_str(json).expect("json");
        assert_eq!(from_json.role_names(), vec!["admin", "store_manager"]);

        let toml = r#"
            [[roles]]
            name = "admin"
            access_level = "FULL"

            [[roles]]
            name = "store_manager"
            access_level = "READ_FILTERED"
            visible_columns = ["sales"]
            row_filter = { column = "location_key", attribute = "store_location_key" }
        "#;
        let from_toml = RoleRegistry::from_toml_str(toml).expect("toml");
        assert_eq!(from_toml, from_json);
    }

    #[test]
    fn rejects_overlap_and_unfiltered_filtered_roles() {
        let overlap = RoleDefinition::new("analyst", AccessLevel::ReadMasked)
            .with_visible(&["email"])
            .with_mask("email", MaskingRuleId::Email);
        assert!(matches!(
            RoleRegistry::from_roles([overlap]),
            Err(RiqError::InvalidConfig(_))
        ));
        let unfiltered = RoleDefinition::new("store_manager", AccessLevel::ReadFiltered);
        assert!(RoleRegistry::from_roles([unfiltered]).is_err());
    }

    #[test]
    fn aggregated_roles_may_not_name_high_columns() {
        let registry = RoleRegistry::from_roles([RoleDefinition::new(
            "executive",
            AccessLevel::ReadAggregated,
        )
        .with_visible(&["sales", "customer_name"])])
        .expect("table-independent checks pass");
        assert!(matches!(
            registry.validate_against(&fact_sales()),
            Err(RiqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn defaults_validate_and_unknown_columns_are_reported() {
        let defaults = RoleRegistry::retail_defaults();
        defaults
            .validate_tables(&[&fact_sales()])
            .expect("defaults fit fact_sales");
        assert!(matches!(defaults.role("intern"), Err(RiqError::UnknownRole(_))));

        let typo = RoleRegistry::from_roles([RoleDefinition::new("analyst", AccessLevel::ReadMasked)
            .with_visible(&["sales", "salez"])])
        .expect("registry");
        typo.validate_against(&fact_sales())
            .expect("per-table check ignores columns of other tables");
        assert!(matches!(
            typo.validate_tables(&[&fact_sales()]),
            Err(RiqError::MissingColumn { .. })
        ));
        typo.validate_tables(&[]).expect("nothing to check yet");
    }

    #[test]
    fn json_encoding_round_trips() {
        let defaults = RoleRegistry::retail_defaults();
        let json = defaults.to_json_string().expect("encode");
        assert_eq!(RoleRegistry::from_json_str(&json).expect("decode"), defaults);
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use arrow::datatypes::{Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use riq_common::{global_metrics, Result, RiqError, SchemaVersion};
use riq_planner::Expr;
use riq_storage::{BatchPolicy, ColumnDef, MetadataStore, Sensitivity, TableDescriptor};
use tracing::{debug, warn};

use crate::masking::{apply_mask, MaskingRuleId};
use crate::principal::Principal;
use crate::registry::RoleRegistry;
use crate::role::{AccessLevel, RoleDefinition};

/// How one column reaches a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAccess {
    Visible,
    Masked(MaskingRuleId),
    Denied,
}

/// Classifies `column` for `role`.
///
/// LOW columns and FULL roles see raw values. READ_AGGREGATED never sees a
/// HIGH column, whatever the role lists.
pub fn column_access(role: &RoleDefinition, column: &ColumnDef) -> ColumnAccess {
    if role.access_level == AccessLevel::Full || column.sensitivity == Sensitivity::Low {
        return ColumnAccess::Visible;
    }
    if role.access_level == AccessLevel::ReadAggregated && column.sensitivity == Sensitivity::High {
        return ColumnAccess::Denied;
    }
    if role.visible_columns.contains(&column.name) {
        ColumnAccess::Visible
    } else if let Some(rule) = role.masked_columns.get(&column.name) {
        ColumnAccess::Masked(*rule)
    } else {
        ColumnAccess::Denied
    }
}

/// Outcome of authorizing one read: what may be returned, in which form,
/// and which rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyBundle {
    pub table: String,
    pub role: String,
    pub schema_version: SchemaVersion,
    /// Requested columns that survive, in request order.
    pub permitted_columns: Vec<String>,
    /// Requested columns removed by the policy, in request order.
    pub denied_columns: Vec<String>,
    /// Masking rule per masked table column, requested or not.
    pub masks: BTreeMap<String, MaskingRuleId>,
    access: BTreeMap<String, ColumnAccess>,
    pub row_filter: Expr,
}

impl PolicyBundle {
    pub fn access(&self, column: &str) -> Option<ColumnAccess> {
        self.access.get(column).copied()
    }

    /// Rejects user filters that reference columns the role may not see.
    pub fn check_filter_columns<'a>(
        &self,
        columns: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        let denied = columns
            .into_iter()
            .filter(|c| self.access(c) == Some(ColumnAccess::Denied))
            .cloned()
            .collect::<BTreeSet<_>>();
        if denied.is_empty() {
            return Ok(());
        }
        Err(RiqError::ColumnDenied {
            table: self.table.clone(),
            role: self.role.clone(),
            columns: denied.into_iter().collect(),
        })
    }
}

impl BatchPolicy for PolicyBundle {
    fn row_filter(&self) -> &Expr {
        &self.row_filter
    }

    fn masked_columns(&self) -> BTreeSet<String> {
        self.masks.keys().cloned().collect()
    }

    fn mask_batch(&self, batch: RecordBatch) -> Result<(RecordBatch, u64)> {
        if self.masks.is_empty() {
            return Ok((batch, 0));
        }
        let schema = batch.schema();
        let mut fields = Vec::with_capacity(schema.fields().len());
        let mut columns = Vec::with_capacity(batch.num_columns());
        let mut masked = 0;
        for (field, column) in schema.fields().iter().zip(batch.columns()) {
            match self.masks.get(field.name()) {
                Some(rule) => {
                    let (out, n) = apply_mask(*rule, column)?;
                    masked += n;
                    // NullOut may introduce nulls into a non-nullable field
                    fields.push(Arc::new(Field::clone(field).with_nullable(true)));
                    columns.push(out);
                }
                None => {
                    fields.push(Arc::clone(field));
                    columns.push(Arc::clone(column));
                }
            }
        }
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        let out = RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            columns,
            &options,
        )
        .map_err(|e| RiqError::Execution(format!("masked batch rebuild failed: {e}")))?;
        Ok((out, masked))
    }

    fn label(&self) -> &str {
        &self.role
    }
}

/// Resolves principals to column and row restrictions.
///
/// The registry can be swapped at runtime; bundles already handed out keep
/// the role definition they were built from.
#[derive(Debug)]
pub struct AccessPolicyEngine {
    store: Arc<MetadataStore>,
    registry: RwLock<RoleRegistry>,
}

impl AccessPolicyEngine {
    pub fn new(store: Arc<MetadataStore>, registry: RoleRegistry) -> Self {
        Self {
            store,
            registry: RwLock::new(registry),
        }
    }

    /// Validates `registry` against the registered tables, then installs it.
    pub fn replace_registry(&self, registry: RoleRegistry) -> Result<()> {
        let descriptors = self
            .store
            .tables()?
            .iter()
            .map(|t| self.store.descriptor(t))
            .collect::<Result<Vec<_>>>()?;
        registry.validate_tables(&descriptors.iter().map(|d| d.as_ref()).collect::<Vec<_>>())?;
        let mut guard = self
            .registry
            .write()
            .map_err(|_| RiqError::Execution("role registry lock poisoned".to_string()))?;
        *guard = registry;
        Ok(())
    }

    /// Checks the installed roles against a table about to be registered.
    pub fn validate_table(&self, descriptor: &TableDescriptor) -> Result<()> {
        self.registry
            .read()
            .map_err(|_| RiqError::Execution("role registry lock poisoned".to_string()))?
            .validate_against(descriptor)
    }

    pub fn role(&self, name: &str) -> Result<RoleDefinition> {
        let guard = self
            .registry
            .read()
            .map_err(|_| RiqError::Execution("role registry lock poisoned".to_string()))?;
        guard.role(name).cloned()
    }

    /// Decides which of `requested` columns `principal` may read from
    /// `table`, how they are masked and which rows they may see.
    ///
    /// With `strict`, any removed column fails the call with `ColumnDenied`;
    /// otherwise the request is narrowed and the removals are reported.
    pub fn authorize(
        &self,
        table: &str,
        requested: &[String],
        principal: &Principal,
        strict: bool,
    ) -> Result<PolicyBundle> {
        let role = self.role(&principal.role_name)?;
        let descriptor = self.store.descriptor(table)?;
        let bundle = build_bundle(&descriptor, &role, requested, principal)?;

        if !bundle.denied_columns.is_empty() {
            global_metrics().record_columns_denied(
                table,
                &role.name,
                bundle.denied_columns.len() as u64,
            );
            if strict {
                return Err(RiqError::ColumnDenied {
                    table: table.to_string(),
                    role: role.name,
                    columns: bundle.denied_columns,
                });
            }
            warn!(
                table = %table,
                operator = "AccessPolicyEngine",
                role = %role.name,
                denied = ?bundle.denied_columns,
                "columns removed from request"
            );
        }
        debug!(
            table = %table,
            operator = "AccessPolicyEngine",
            role = %role.name,
            permitted = bundle.permitted_columns.len(),
            masked = bundle.masks.len(),
            row_filter = !bundle.row_filter.is_always_true(),
            "request authorized"
        );
        Ok(bundle)
    }
}

fn build_bundle(
    descriptor: &TableDescriptor,
    role: &RoleDefinition,
    requested: &[String],
    principal: &Principal,
) -> Result<PolicyBundle> {
    let access = descriptor
        .columns
        .iter()
        .map(|c| (c.name.clone(), column_access(role, c)))
        .collect::<BTreeMap<_, _>>();
    let masks = access
        .iter()
        .filter_map(|(name, a)| match a {
            ColumnAccess::Masked(rule) => Some((name.clone(), *rule)),
            _ => None,
        })
        .collect();

    let mut permitted = Vec::with_capacity(requested.len());
    let mut denied = Vec::new();
    for column in requested {
        let def = descriptor.require_column(column)?;
        if permitted.contains(&def.name) || denied.contains(&def.name) {
            continue;
        }
        match access.get(&def.name) {
            Some(ColumnAccess::Denied) | None => denied.push(def.name.clone()),
            Some(_) => permitted.push(def.name.clone()),
        }
    }

    let row_filter = match &role.row_filter {
        Some(template) => template.expand(principal, descriptor)?,
        None => Expr::always_true(),
    };

    Ok(PolicyBundle {
        table: descriptor.name.clone(),
        role: role.name.clone(),
        schema_version: descriptor.schema_version,
        permitted_columns: permitted,
        denied_columns: denied,
        masks,
        access,
        row_filter,
    })
}

//! Role-based column and row access for warehouse reads.
//!
//! - [`registry`]: role definitions loaded from JSON or TOML
//! - [`engine`]: `authorize` turning a principal into a [`PolicyBundle`]
//! - [`masking`]: value masking rules
//! - [`audit`]: per-query audit events and sinks

pub mod audit;
pub mod engine;
pub mod masking;
pub mod principal;
pub mod registry;
pub mod role;

pub use audit::{
    AuditEvent, AuditOutcome, AuditSink, JsonLinesAuditSink, MemoryAuditSink, NullAuditSink,
};
pub use engine::{column_access, AccessPolicyEngine, ColumnAccess, PolicyBundle};
pub use masking::{apply_mask, MaskingRuleId};
pub use principal::{Principal, USER_ID_ATTRIBUTE};
pub use registry::RoleRegistry;
pub use role::{AccessLevel, RoleDefinition, RowFilterTemplate};

//! Predicate layer shared by pruning, pushdown and row policies.
//!
//! - [`expr`]: the `Expr` tree and builders
//! - [`static_eval`]: three-valued evaluation against known key values
//! - [`sql_frontend`]: `SELECT ... FROM t WHERE ...` parsing via `sqlparser`

pub mod expr;
pub mod sql_frontend;
pub mod static_eval;

pub use expr::*;
pub use sql_frontend::{parse_predicate, parse_select, SelectRequest};
pub use static_eval::{evaluate, is_statically_evaluable, Truth};

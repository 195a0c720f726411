//! Vectorised predicate evaluation over Arrow record batches.
//!
//! Key modules:
//! - [`expressions`]: compile an `Expr` against a schema and evaluate it per batch
//! - [`rows`]: typed row view used by result consumers and tests

/// Expression compilation and evaluation.
pub mod expressions;
/// Typed rows.
pub mod rows;

pub use expressions::{
    compile_expr, constant_column, filter_batch, literal_to_array, ColumnarValue, PhysicalExpr,
};
pub use rows::{batches_to_rows, Row};

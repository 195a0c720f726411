mod session;

pub mod query;
pub mod warehouse;

pub use query::{
    CancelHandle, PartitionOutput, QueryExecution, QueryOutcome, QueryRequest, QueryResult,
    QueryState,
};
pub use warehouse::Warehouse;

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::WarehouseConfig;
pub use error::{Result, RiqError};
pub use ids::{QueryId, SchemaVersion};
pub use metrics::{global_metrics, MetricsRegistry};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::util::pretty::pretty_format_batches;
use clap::{Parser, Subcommand};
use riq_client::{QueryOutcome, QueryRequest, Warehouse};
use riq_common::WarehouseConfig;
use riq_policy::{AuditSink, JsonLinesAuditSink, NullAuditSink, Principal, RoleRegistry};
use riq_storage::TableDescriptor;
use tracing_subscriber::EnvFilter;

/// Query and administer a RetailIQ warehouse root.
#[derive(Parser, Debug)]
#[command(name = "riq", version)]
struct Cli {
    /// Warehouse root: a local directory or an object-store URI
    #[arg(long, env = "RIQ_ROOT")]
    root: String,
    /// JSON warehouse config; `RIQ_*` variables override it
    #[arg(long, env = "RIQ_CONFIG")]
    config: Option<PathBuf>,
    /// Role registry (.json or .toml); built-in retail roles when absent
    #[arg(long, env = "RIQ_ROLES")]
    roles: Option<PathBuf>,
    /// Append query audit events to this JSON lines file
    #[arg(long, env = "RIQ_AUDIT_LOG")]
    audit_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered tables
    Tables,
    /// List the manifest entries of a table
    Partitions {
        #[arg(long)]
        table: String,
    },
    /// Run `SELECT cols|* FROM table [WHERE ...]` as a role
    Query {
        #[arg(long)]
        sql: String,
        #[arg(long)]
        role: String,
        /// Principal attribute (repeatable)
        #[arg(long = "attr", value_name = "KEY=VALUE")]
        attributes: Vec<String>,
        /// Fail instead of dropping columns the role may not read
        #[arg(long)]
        strict: bool,
        /// Print Prometheus metrics to stderr afterwards
        #[arg(long)]
        metrics: bool,
    },
    /// Rebuild a table manifest from its data files
    Rebuild {
        #[arg(long)]
        table: String,
        /// Table descriptor JSON, for a table whose manifest is gone
        #[arg(long)]
        descriptor: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => WarehouseConfig::load(path)?,
        None => WarehouseConfig::from_env()?,
    };
    let registry = match &cli.roles {
        Some(path) => RoleRegistry::load(path)?,
        None => RoleRegistry::retail_defaults(),
    };
    let audit: Arc<dyn AuditSink> = match &cli.audit_log {
        Some(path) => Arc::new(JsonLinesAuditSink::new(path)?),
        None => Arc::new(NullAuditSink),
    };
    let backend = Warehouse::backend_for(&cli.root, &HashMap::new())?;
    let warehouse = Warehouse::open_with_audit(config, backend, registry, audit)?;

    match cli.command {
        Command::Tables => {
            for table in warehouse.list_tables()? {
                println!("{table}");
            }
        }
        Command::Partitions { table } => {
            for entry in warehouse.show_partitions(&table)? {
                println!(
                    "{}\trows={}\tschema={}",
                    entry.location, entry.row_count, entry.schema_version
                );
            }
        }
        Command::Query {
            sql,
            role,
            attributes,
            strict,
            metrics,
        } => {
            let mut principal = Principal::new(&role);
            for attr in &attributes {
                let (key, value) = attr
                    .split_once('=')
                    .ok_or_else(|| format!("attribute '{attr}' is not KEY=VALUE"))?;
                principal = principal.with_attribute(key.trim(), value.trim());
            }
            let mut request = QueryRequest::from_sql(&sql, principal)?;
            request.strict_columns = strict;
            let result = warehouse.query(request).collect().await?;
            if result.batches.is_empty() {
                println!("OK: 0 rows");
            } else {
                println!("{}", pretty_format_batches(&result.batches)?);
            }
            if !result.denied_columns.is_empty() {
                eprintln!("denied columns: {}", result.denied_columns.join(", "));
            }
            if !result.skipped.is_empty() {
                eprintln!("skipped corrupt partitions: {}", result.skipped.join(", "));
            }
            if result.status == QueryOutcome::Partial {
                eprintln!(
                    "partial result: {} partitions read, unread: {}",
                    result.completed.len(),
                    result.unread.join(", ")
                );
            }
            if metrics {
                eprint!("{}", warehouse.prometheus_metrics());
            }
        }
        Command::Rebuild { table, descriptor } => {
            let count = match descriptor {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)?;
                    let mut descriptor: TableDescriptor = serde_json::from_str(&raw)?;
                    descriptor.name = table.clone();
                    warehouse.recover_table(descriptor)?
                }
                None => warehouse.rebuild_manifest(&table)?,
            };
            println!("{table}: {count} partitions");
        }
    }
    Ok(())
}

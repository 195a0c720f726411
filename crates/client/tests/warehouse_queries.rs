mod support;

use std::sync::Arc;

use bytes::Bytes;
use riq_client::{QueryOutcome, QueryRequest, QueryState, Warehouse};
use riq_common::{RiqError, WarehouseConfig};
use riq_planner::{and, col, eq, lit_i64, lit_str};
use riq_policy::{AuditOutcome, MemoryAuditSink, Principal, RoleRegistry};
use riq_storage::{
    ColumnDef, ColumnType, MemoryBackend, Sensitivity, StorageBackend, TableDescriptor,
};

use support::{
    all_months, column_names, fact_sales, floats, ints, memory_warehouse, strings, warehouse_with,
    NAMES,
};

fn manager(location: &str) -> Principal {
    Principal::new("store_manager").with_attribute("store_location_key", location)
}

#[tokio::test]
async fn admin_round_trip_returns_rows_unchanged() {
    let warehouse = memory_warehouse(&[(2017, 1), (2017, 2)]);
    let result = warehouse
        .query(QueryRequest::new("fact_sales", Principal::new("admin")))
        .collect()
        .await
        .expect("collect");

    assert_eq!(result.status, QueryOutcome::Complete);
    assert_eq!(result.num_rows(), 6);
    assert!(result.denied_columns.is_empty());
    assert_eq!(column_names(&result.batches), fact_sales().column_names());
    let expected_names = NAMES
        .iter()
        .chain(NAMES.iter())
        .map(|n| Some(n.to_string()))
        .collect::<Vec<_>>();
    assert_eq!(strings(&result.batches, "customer_name"), expected_names);
    assert_eq!(ints(&result.batches, "order_month"), vec![1, 1, 1, 2, 2, 2]);
    assert_eq!(
        floats(&result.batches, "sales"),
        vec![10.0, 11.0, 12.0, 20.0, 21.0, 22.0]
    );
    assert_eq!(
        strings(&result.batches, "email")[..3],
        [
            Some("john.smith@example.com".to_string()),
            Some("ann.lee@example.com".to_string()),
            None
        ]
    );
}

#[tokio::test]
async fn analyst_sees_masked_customers_and_loses_unlisted_columns() {
    let warehouse = memory_warehouse(&[(2017, 1)]);
    let result = warehouse
        .query(
            QueryRequest::new("fact_sales", Principal::new("analyst"))
                .with_columns(&["customer_name", "email", "phone", "sales"]),
        )
        .collect()
        .await
        .expect("collect");

    assert_eq!(result.denied_columns, vec!["phone".to_string()]);
    assert_eq!(
        column_names(&result.batches),
        vec!["customer_name", "email", "sales"]
    );
    assert_eq!(
        strings(&result.batches, "customer_name"),
        vec![
            Some("J***".to_string()),
            Some("A***".to_string()),
            Some("É***".to_string())
        ]
    );
    assert_eq!(
        strings(&result.batches, "email"),
        vec![
            Some("j***@example.com".to_string()),
            Some("a***@example.com".to_string()),
            None
        ]
    );
    assert_eq!(floats(&result.batches, "sales"), vec![10.0, 11.0, 12.0]);
}

#[tokio::test]
async fn store_manager_sees_only_their_location() {
    let warehouse = memory_warehouse(&all_months(2016..2018));
    let result = warehouse
        .query(
            QueryRequest::new("fact_sales", manager("12"))
                .with_columns(&["location_key", "customer_name", "sales"]),
        )
        .collect()
        .await
        .expect("collect");

    let locations = ints(&result.batches, "location_key");
    assert_eq!(locations.len(), 24 * 2);
    assert!(locations.iter().all(|l| *l == 12));
    assert!(strings(&result.batches, "customer_name")
        .iter()
        .all(|n| matches!(n.as_deref(), Some("J***") | Some("É***"))));

    let nobody = warehouse
        .query(
            QueryRequest::new("fact_sales", Principal::new("store_manager"))
                .with_columns(&["location_key", "sales"]),
        )
        .collect()
        .await
        .expect("collect");
    assert_eq!(nobody.num_rows(), 0);
    assert_eq!(nobody.completed.len(), 24);
}

#[tokio::test]
async fn year_and_month_filter_reads_one_of_48_partitions() {
    let warehouse = memory_warehouse(&all_months(2014..2018));
    assert_eq!(warehouse.show_partitions("fact_sales").expect("list").len(), 48);

    let result = warehouse
        .query(
            QueryRequest::new("fact_sales", Principal::new("admin")).with_filter(and(
                eq(col("order_year"), lit_i64(2017)),
                eq(col("order_month"), lit_i64(1)),
            )),
        )
        .collect()
        .await
        .expect("collect");

    assert_eq!(
        result.completed,
        vec!["fact_sales/order_year=2017/order_month=01/".to_string()]
    );
    assert_eq!(result.num_rows(), 3);
    assert_eq!(ints(&result.batches, "order_year"), vec![2017; 3]);
}

#[tokio::test]
async fn strict_requests_and_denied_filters_fail_with_column_denied() {
    let warehouse = memory_warehouse(&[(2017, 1)]);
    let strict = warehouse
        .query(
            QueryRequest::new("fact_sales", Principal::new("analyst"))
                .with_columns(&["customer_name", "phone"])
                .strict(),
        )
        .collect()
        .await;
    match strict {
        Err(RiqError::ColumnDenied { table, role, columns }) => {
            assert_eq!(table, "fact_sales");
            assert_eq!(role, "analyst");
            assert_eq!(columns, vec!["phone".to_string()]);
        }
        other => panic!("expected ColumnDenied, got {other:?}"),
    }

    let by_filter = warehouse
        .query(
            QueryRequest::new("fact_sales", Principal::new("analyst"))
                .with_columns(&["sales"])
                .with_filter(eq(col("phone"), lit_str("555-0100"))),
        )
        .collect()
        .await;
    assert!(matches!(by_filter, Err(RiqError::ColumnDenied { .. })));

    let executive = warehouse
        .query(
            QueryRequest::new("fact_sales", Principal::new("executive"))
                .with_columns(&["sales", "customer_name"])
                .strict(),
        )
        .collect()
        .await;
    assert!(matches!(executive, Err(RiqError::ColumnDenied { .. })));
}

#[tokio::test]
async fn filters_on_masked_columns_compare_masked_values() {
    let warehouse = memory_warehouse(&[(2017, 1), (2017, 2)]);
    let analyst = || QueryRequest::new("fact_sales", Principal::new("analyst"));

    let masked = warehouse
        .query(
            analyst()
                .with_columns(&["customer_name", "sales"])
                .with_filter(eq(col("customer_name"), lit_str("J***"))),
        )
        .collect()
        .await
        .expect("collect");
    assert_eq!(floats(&masked.batches, "sales"), vec![10.0, 20.0]);

    let raw = warehouse
        .query(
            analyst()
                .with_columns(&["sales"])
                .with_filter(eq(col("customer_name"), lit_str("John Smith"))),
        )
        .collect()
        .await
        .expect("collect");
    assert_eq!(raw.num_rows(), 0);
}

#[tokio::test]
async fn sql_entry_point_applies_the_same_policy() {
    let warehouse = memory_warehouse(&all_months(2017..2018));
    let result = warehouse
        .sql(
            "SELECT customer_name, sales FROM fact_sales WHERE order_year = 2017 AND order_month = 2",
            Principal::new("analyst"),
        )
        .expect("parse")
        .collect()
        .await
        .expect("collect");
    assert_eq!(result.completed.len(), 1);
    assert_eq!(
        strings(&result.batches, "customer_name"),
        vec![
            Some("J***".to_string()),
            Some("A***".to_string()),
            Some("É***".to_string())
        ]
    );

    let everything = warehouse
        .sql("SELECT * FROM fact_sales", manager("13"))
        .expect("parse")
        .collect()
        .await
        .expect("collect");
    assert_eq!(everything.num_rows(), 12);
    assert_eq!(
        everything.denied_columns,
        vec!["customer_id".to_string(), "phone".to_string()]
    );

    assert!(matches!(
        warehouse.sql("DELETE FROM fact_sales", Principal::new("admin")),
        Err(RiqError::Unsupported(_))
    ));
}

#[tokio::test]
async fn corrupt_partitions_fail_or_are_skipped_by_config() {
    let backend = Arc::new(MemoryBackend::new());
    let strict = warehouse_with(
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        WarehouseConfig::default(),
        &[(2017, 1), (2017, 2), (2017, 3)],
    );
    let broken = "fact_sales/order_year=2017/order_month=02/";
    backend
        .put(&format!("{broken}data.parquet"), Bytes::from_static(b"not parquet"))
        .expect("corrupt");

    let failed = strict
        .query(QueryRequest::new("fact_sales", Principal::new("admin")))
        .collect()
        .await;
    match failed {
        Err(RiqError::CorruptPartition { partition, .. }) => assert_eq!(partition, broken),
        other => panic!("expected CorruptPartition, got {other:?}"),
    }

    let lenient = Warehouse::open(
        WarehouseConfig {
            skip_corrupt_partitions: true,
            ..WarehouseConfig::default()
        },
        backend,
        RoleRegistry::retail_defaults(),
    )
    .expect("reopen");
    let result = lenient
        .query(QueryRequest::new("fact_sales", Principal::new("admin")))
        .collect()
        .await
        .expect("collect");
    assert_eq!(result.skipped, vec![broken.to_string()]);
    assert_eq!(result.completed.len(), 2);
    assert_eq!(result.num_rows(), 6);
    assert_eq!(result.status, QueryOutcome::Complete);
}

#[tokio::test]
async fn unknown_roles_and_tables_are_reported() {
    let warehouse = memory_warehouse(&[(2017, 1)]);
    let intern = warehouse
        .query(QueryRequest::new("fact_sales", Principal::new("intern")))
        .collect()
        .await;
    assert!(matches!(intern, Err(RiqError::UnknownRole(_))));

    let missing = warehouse
        .query(QueryRequest::new("fact_returns", Principal::new("admin")))
        .collect()
        .await;
    assert!(matches!(missing, Err(RiqError::UnknownTable(_))));

    let typo = warehouse
        .query(QueryRequest::new("fact_sales", Principal::new("admin")).with_columns(&["salez"]))
        .collect()
        .await;
    assert!(matches!(typo, Err(RiqError::MissingColumn { .. })));
}

#[tokio::test]
async fn execution_moves_through_states_and_is_audited() {
    let audit = Arc::new(MemoryAuditSink::new());
    let warehouse = Warehouse::open_with_audit(
        WarehouseConfig::default(),
        Arc::new(MemoryBackend::new()),
        RoleRegistry::retail_defaults(),
        Arc::clone(&audit) as Arc<dyn riq_policy::AuditSink>,
    )
    .expect("open");
    warehouse.register_table(fact_sales()).expect("register");
    warehouse
        .write_partitioned("fact_sales", &support::sales_batch(&[(2017, 1), (2017, 2)]))
        .expect("write");

    let analyst = Principal::new("analyst").with_attribute("user_id", "u-42");
    let mut execution = warehouse.query(
        QueryRequest::new("fact_sales", analyst.clone()).with_columns(&["customer_name"]),
    );
    assert_eq!(execution.state(), QueryState::Pending);
    let first = execution
        .next_partition()
        .await
        .expect("read")
        .expect("first partition");
    assert_eq!(execution.state(), QueryState::Emitting);
    assert_eq!(first.location, "fact_sales/order_year=2017/order_month=01/");
    assert_eq!(first.rows_emitted, 3);
    assert_eq!(first.values_masked, 3);
    assert!(execution.next_partition().await.expect("read").is_some());
    assert!(execution.next_partition().await.expect("read").is_none());
    assert_eq!(execution.state(), QueryState::Done);

    let mut denied = warehouse.query(
        QueryRequest::new("fact_sales", analyst)
            .with_columns(&["phone"])
            .strict(),
    );
    assert!(denied.next_partition().await.is_err());
    assert_eq!(denied.state(), QueryState::Failed);

    let events = audit.events();
    assert_eq!(
        events.iter().map(|e| e.outcome).collect::<Vec<_>>(),
        vec![AuditOutcome::Success, AuditOutcome::Denied]
    );
    assert_eq!(events[0].user_id.as_deref(), Some("u-42"));
    assert_eq!(events[0].rows_returned, 6);
    assert_eq!(events[0].partitions_read, 2);
    assert!(warehouse.prometheus_metrics().contains("fact_sales"));
}

#[tokio::test]
async fn tables_cannot_be_partitioned_by_sensitive_columns() {
    let warehouse = memory_warehouse(&[]);
    let orders = TableDescriptor::new(
        "orders",
        vec![
            ColumnDef::new("customer_name", ColumnType::Utf8, Sensitivity::High),
            ColumnDef::new("sales", ColumnType::Float64, Sensitivity::Medium),
        ],
        &["customer_name"],
    );
    assert!(matches!(
        warehouse.register_table(orders.clone()),
        Err(RiqError::SchemaConflict { .. })
    ));
    assert!(matches!(
        warehouse.recover_table(orders),
        Err(RiqError::SchemaConflict { .. })
    ));
    assert_eq!(warehouse.list_tables().expect("tables"), vec!["fact_sales"]);
}

#[tokio::test]
async fn abandoned_and_cancelled_queries_are_audited() {
    let audit = Arc::new(MemoryAuditSink::new());
    let warehouse = Warehouse::open_with_audit(
        WarehouseConfig::default(),
        Arc::new(MemoryBackend::new()),
        RoleRegistry::retail_defaults(),
        Arc::clone(&audit) as Arc<dyn riq_policy::AuditSink>,
    )
    .expect("open");
    warehouse.register_table(fact_sales()).expect("register");
    warehouse
        .write_partitioned("fact_sales", &support::sales_batch(&[(2017, 1), (2017, 2)]))
        .expect("write");

    let analyst = Principal::new("analyst").with_attribute("user_id", "u-7");
    let mut abandoned = warehouse.query(QueryRequest::new("fact_sales", analyst.clone()));
    assert!(abandoned.next_partition().await.expect("read").is_some());
    drop(abandoned);

    let mut cancelled = warehouse.query(QueryRequest::new("fact_sales", analyst));
    cancelled.cancel_handle().cancel();
    assert!(matches!(
        cancelled.next_partition().await,
        Err(RiqError::Cancelled(_))
    ));
    drop(cancelled);

    let events = audit.events();
    assert_eq!(
        events.iter().map(|e| e.outcome).collect::<Vec<_>>(),
        vec![AuditOutcome::Cancelled, AuditOutcome::Cancelled]
    );
    assert_eq!(events[0].user_id.as_deref(), Some("u-7"));
    assert_eq!(events[0].partitions_read, 1);
    assert_eq!(events[0].rows_returned, 3);
    assert_eq!(events[1].partitions_read, 0);
}

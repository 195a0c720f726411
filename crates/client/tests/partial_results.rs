mod support;

use std::sync::Arc;
use std::time::Duration;

use riq_client::{QueryOutcome, QueryRequest, QueryState, Warehouse};
use riq_common::{RiqError, WarehouseConfig};
use riq_policy::Principal;

use support::{ints, strings, warehouse_with, SlowBackend};

fn ten_months() -> Vec<(i64, i64)> {
    (1..=10).map(|m| (2017, m)).collect()
}

fn location(month: i64) -> String {
    format!("fact_sales/order_year=2017/order_month={month:02}/")
}

/// Reads of months 7 to 10 stall for `delay`.
fn slow_warehouse(config: WarehouseConfig, delay: Duration) -> Warehouse {
    let backend = SlowBackend::new((7..=10).map(location).collect(), delay);
    warehouse_with(Arc::new(backend), config, &ten_months())
}

fn store_manager() -> Principal {
    Principal::new("store_manager").with_attribute("store_location_key", "12")
}

#[tokio::test]
async fn partition_timeout_returns_completed_partitions_and_lists_the_rest() {
    let warehouse = slow_warehouse(
        WarehouseConfig {
            partition_timeout_ms: Some(150),
            ..WarehouseConfig::default()
        },
        Duration::from_millis(600),
    );
    let result = warehouse
        .query(
            QueryRequest::new("fact_sales", store_manager())
                .with_columns(&["order_month", "location_key", "customer_name"]),
        )
        .collect()
        .await
        .expect("partial results are not errors");

    assert_eq!(result.status, QueryOutcome::Partial);
    assert_eq!(result.completed, (1..=6).map(location).collect::<Vec<_>>());
    assert_eq!(result.unread, (7..=10).map(location).collect::<Vec<_>>());

    // completed partitions are already filtered and masked
    let months = ints(&result.batches, "order_month");
    assert_eq!(months, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6]);
    assert!(ints(&result.batches, "location_key").iter().all(|l| *l == 12));
    assert!(strings(&result.batches, "customer_name")
        .iter()
        .all(|n| matches!(n.as_deref(), Some("J***") | Some("É***"))));

    match result.into_result() {
        Err(RiqError::PartialResult {
            table,
            completed,
            unread,
        }) => {
            assert_eq!(table, "fact_sales");
            assert_eq!(completed, 6);
            assert_eq!(unread.len(), 4);
        }
        other => panic!("expected PartialResult, got {other:?}"),
    }
}

#[tokio::test]
async fn query_timeout_stops_at_the_first_stalled_partition() {
    let warehouse = slow_warehouse(
        WarehouseConfig {
            query_timeout_ms: Some(400),
            max_concurrent_partitions: 2,
            ..WarehouseConfig::default()
        },
        Duration::from_millis(1200),
    );
    let result = warehouse
        .query(QueryRequest::new("fact_sales", Principal::new("admin")))
        .collect()
        .await
        .expect("collect");
    assert!(result.is_partial());
    assert_eq!(result.completed.len(), 6);
    assert_eq!(result.unread, (7..=10).map(location).collect::<Vec<_>>());
    assert_eq!(result.num_rows(), 18);
}

#[tokio::test]
async fn without_timeouts_slow_partitions_are_awaited() {
    let warehouse = slow_warehouse(WarehouseConfig::default(), Duration::from_millis(20));
    let result = warehouse
        .query(QueryRequest::new("fact_sales", Principal::new("admin")))
        .collect()
        .await
        .expect("collect")
        .into_result()
        .expect("complete");
    assert_eq!(result.completed.len(), 10);
    assert!(result.unread.is_empty());
}

#[tokio::test]
async fn cancelled_queries_stop_at_the_next_partition() {
    let warehouse = slow_warehouse(WarehouseConfig::default(), Duration::from_millis(1));
    let mut execution = warehouse.query(QueryRequest::new("fact_sales", Principal::new("admin")));
    let cancel = execution.cancel_handle();
    assert!(execution.next_partition().await.expect("read").is_some());

    cancel.cancel();
    assert!(matches!(
        execution.next_partition().await,
        Err(RiqError::Cancelled(_))
    ));
    assert_eq!(execution.state(), QueryState::Failed);
    assert!(execution.next_partition().await.expect("finished").is_none());
}

// ABOUTME: Integration tests for the transactional write executor
// ABOUTME: Atomicity, cascade delete and the monetary rule against the in-memory primary

use std::time::Duration;

use replica_router::memory::{MemoryCluster, MemoryConnector};
use replica_router::{
    NewSalesItem, NewTransaction, Role, RouterConfig, RouterError, SalesStore, StoreError,
    TransactionPatch,
};
use rust_decimal::Decimal;

fn store(cluster: &MemoryCluster) -> SalesStore<MemoryConnector> {
    store_with_timeout(cluster, RouterConfig::default().write.statement_timeout_ms)
}

fn store_with_timeout(
    cluster: &MemoryCluster,
    statement_timeout_ms: u64,
) -> SalesStore<MemoryConnector> {
    let mut config = RouterConfig::default();
    config.write.statement_timeout_ms = statement_timeout_ms;
    config.primary.pool.min_size = 0;
    config.primary.pool.connect_backoff_ms = 1;
    config.replica.pool.min_size = 0;
    SalesStore::with_connectors(
        cluster.connector(Role::Primary),
        cluster.connector(Role::Replica),
        config,
    )
}

fn ts() -> chrono::NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(2024, 3, 15)
        .unwrap()
        .and_hms_opt(13, 45, 0)
        .unwrap()
}

/// Two lines and a header discount: 18000 + 32000 - 5000 = 45000.
fn grocery_run() -> (NewTransaction, Vec<NewSalesItem>) {
    let items = vec![
        NewSalesItem::new("P100", "Potato Chips", 2, Decimal::from(10000))
            .with_discount(Decimal::from(2000))
            .with_category("Snacks"),
        NewSalesItem::new("P200", "Soda", 4, Decimal::from(8000)).with_category("Drinks"),
    ];
    let header = NewTransaction::new(ts(), 101, 1, "Cash")
        .with_customer(555)
        .with_discount(Decimal::from(5000))
        .totals_from(&items);
    (header, items)
}

#[tokio::test]
async fn test_create_commits_header_and_items_together() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();

    let id = store.create_transaction(&header, &items).await.unwrap();

    let txn = cluster.transaction(Role::Primary, id).unwrap();
    assert_eq!(txn.total_amount, Decimal::from(45000));
    assert_eq!(txn.customer_id, Some(555));

    let stored = cluster.items(Role::Primary, id);
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].total_price, Decimal::from(18000));
    assert_eq!(stored[1].total_price, Decimal::from(32000));

    // Committed on the primary, nothing on the replica until the sink runs.
    assert!(cluster.transaction(Role::Replica, id).is_none());
    assert_eq!(cluster.pending_changes().len(), 3);
}

#[tokio::test]
async fn test_failure_between_items_leaves_nothing_behind() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();

    cluster.fail_item_insert(1, StoreError::Query("value too long".to_string()));
    let err = store.create_transaction(&header, &items).await.unwrap_err();

    assert!(matches!(err, RouterError::PartialWriteAttempt { .. }));
    assert_eq!(cluster.transaction_count(Role::Primary), 0);
    assert_eq!(cluster.item_count(Role::Primary), 0);
    assert!(cluster.pending_changes().is_empty());
    // The connection was rolled back and is reusable.
    assert_eq!(store.pool_stats()[0].idle, 1);
}

#[tokio::test]
async fn test_store_constraint_violation_is_not_retried() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();

    cluster.fail_item_insert(
        0,
        StoreError::Constraint {
            constraint: "sales_item_unit_price_check".to_string(),
            message: "new row violates check constraint".to_string(),
        },
    );
    match store.create_transaction(&header, &items).await {
        Err(RouterError::ConstraintViolation { constraint, .. }) => {
            assert_eq!(constraint, "sales_item_unit_price_check")
        }
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
    assert_eq!(store.pool_stats()[0].acquired, 1);
    assert_eq!(cluster.transaction_count(Role::Primary), 0);
}

#[tokio::test]
async fn test_mismatched_total_rejected_before_any_statement() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();
    let header = header.with_total(Decimal::from(50000));

    match store.create_transaction(&header, &items).await {
        Err(RouterError::ConstraintViolation { constraint, .. }) => {
            assert_eq!(constraint, "sales_transaction_total_matches_items")
        }
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
    assert_eq!(store.pool_stats()[0].acquired, 0);
    assert_eq!(cluster.transaction_count(Role::Primary), 0);
}

#[tokio::test]
async fn test_committed_totals_always_match_items() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);

    let baskets: Vec<(Vec<NewSalesItem>, Decimal)> = vec![
        (
            vec![NewSalesItem::new("P1", "Tea", 3, "1.10".parse().unwrap())],
            Decimal::ZERO,
        ),
        (
            vec![
                NewSalesItem::new("P2", "Bread", 1, "3.49".parse().unwrap()),
                NewSalesItem::new("P3", "Milk", 2, "0.99".parse().unwrap())
                    .with_discount("0.10".parse().unwrap()),
            ],
            "0.50".parse().unwrap(),
        ),
        (
            vec![NewSalesItem::new("P4", "Rice", 10, "12.00".parse().unwrap())],
            "20.00".parse().unwrap(),
        ),
    ];

    for (items, discount) in baskets {
        let header = NewTransaction::new(ts(), 1, 1, "Debit Card")
            .with_discount(discount)
            .totals_from(&items);
        let id = store.create_transaction(&header, &items).await.unwrap();

        let txn = cluster.transaction(Role::Primary, id).unwrap();
        let item_sum: Decimal = cluster
            .items(Role::Primary, id)
            .iter()
            .map(|i| i.total_price)
            .sum();
        assert_eq!(txn.total_amount, item_sum - txn.total_discount, "transaction {id}");
    }
}

#[tokio::test]
async fn test_update_rechecks_totals_against_items() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();
    let id = store.create_transaction(&header, &items).await.unwrap();

    let bad = TransactionPatch {
        total_amount: Some(Decimal::from(1)),
        ..Default::default()
    };
    assert!(matches!(
        store.update_transaction(id, &bad).await,
        Err(RouterError::ConstraintViolation { .. })
    ));
    assert_eq!(
        cluster.transaction(Role::Primary, id).unwrap().total_amount,
        Decimal::from(45000)
    );

    let good = TransactionPatch {
        total_discount: Some(Decimal::from(10000)),
        total_amount: Some(Decimal::from(40000)),
        ..Default::default()
    };
    let updated = store.update_transaction(id, &good).await.unwrap();
    assert_eq!(updated.total_amount, Decimal::from(40000));
    assert_eq!(
        cluster.transaction(Role::Primary, id).unwrap().total_discount,
        Decimal::from(10000)
    );
}

#[tokio::test]
async fn test_update_missing_transaction() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let patch = TransactionPatch {
        cashier_id: Some(9),
        ..Default::default()
    };
    assert!(matches!(
        store.update_transaction(404, &patch).await,
        Err(RouterError::NotFound {
            transaction_id: 404
        })
    ));
}

#[tokio::test]
async fn test_delete_removes_items_with_header() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();
    let keep = store.create_transaction(&header, &items).await.unwrap();
    let doomed = store.create_transaction(&header, &items).await.unwrap();

    store.delete_transaction(doomed).await.unwrap();

    assert!(cluster.transaction(Role::Primary, doomed).is_none());
    assert!(cluster.items(Role::Primary, doomed).is_empty());
    assert!(cluster.orphaned_items(Role::Primary).is_empty());
    assert_eq!(cluster.items(Role::Primary, keep).len(), 2);

    assert!(matches!(
        store.delete_transaction(doomed).await,
        Err(RouterError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_ids_are_never_reused() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();

    let first = store.create_transaction(&header, &items).await.unwrap();
    store.delete_transaction(first).await.unwrap();
    let second = store.create_transaction(&header, &items).await.unwrap();
    assert!(second > first);
}

#[tokio::test]
async fn test_sub_cent_prices_rejected_before_any_statement() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let half_cent: Decimal = "0.005".parse().unwrap();
    let items = vec![
        NewSalesItem::new("P1", "Gum", 1, half_cent),
        NewSalesItem::new("P2", "Mint", 1, half_cent),
    ];
    let header = NewTransaction::new(ts(), 1, 1, "Cash").totals_from(&items);

    match store.create_transaction(&header, &items).await {
        Err(RouterError::ConstraintViolation { constraint, .. }) => {
            assert_eq!(constraint, "sales_item_unit_price_range")
        }
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
    assert_eq!(cluster.transaction_count(Role::Primary), 0);
    assert_eq!(store.pool_stats()[0].acquired, 0);
}

#[tokio::test]
async fn test_overflowing_line_total_rejected_without_panic() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let items = vec![NewSalesItem::new("P1", "Gold", 100, Decimal::MAX)];
    let header = NewTransaction::new(ts(), 1, 1, "Cash").totals_from(&items);

    assert!(matches!(
        store.create_transaction(&header, &items).await,
        Err(RouterError::ConstraintViolation { .. })
    ));
    assert_eq!(cluster.transaction_count(Role::Primary), 0);
}

#[tokio::test]
async fn test_update_with_sub_cent_total_rejected() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();
    let id = store.create_transaction(&header, &items).await.unwrap();

    let patch = TransactionPatch {
        total_amount: Some("45000.001".parse().unwrap()),
        ..Default::default()
    };
    match store.update_transaction(id, &patch).await {
        Err(RouterError::ConstraintViolation { constraint, .. }) => {
            assert_eq!(constraint, "sales_transaction_total_amount_range")
        }
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
    assert_eq!(store.pool_stats()[0].acquired, 1);
}

#[tokio::test]
async fn test_statement_timeout_before_commit_leaves_nothing() {
    let cluster = MemoryCluster::new();
    let store = store_with_timeout(&cluster, 50);
    let (header, items) = grocery_run();

    cluster.delay_next_item_insert(Duration::from_secs(5));
    let err = store.create_transaction(&header, &items).await.unwrap_err();

    assert!(matches!(err, RouterError::PartialWriteAttempt { .. }), "got {err:?}");
    assert_eq!(cluster.transaction_count(Role::Primary), 0);
    assert_eq!(cluster.item_count(Role::Primary), 0);
    assert!(cluster.pending_changes().is_empty());
    // Timed out mid-statement: never retried, connection not reused.
    let [primary, _] = store.pool_stats();
    assert_eq!(primary.acquired, 1);
    assert_eq!(primary.discarded, 1);
    assert_eq!(primary.in_use, 0);
}

#[tokio::test]
async fn test_statement_timeout_during_commit_is_outcome_unknown() {
    let cluster = MemoryCluster::new();
    let store = store_with_timeout(&cluster, 50);
    let (header, items) = grocery_run();

    cluster.delay_next_commit_ack(Duration::from_secs(5));
    let err = store.create_transaction(&header, &items).await.unwrap_err();

    assert!(matches!(err, RouterError::CommitOutcomeUnknown { .. }), "got {err:?}");
    // The commit did land; the caller just could not learn that.
    assert_eq!(cluster.transaction_count(Role::Primary), 1);
    assert_eq!(cluster.pending_changes().len(), 3);
    assert_eq!(store.pool_stats()[0].acquired, 1);
    assert_eq!(store.pool_stats()[0].discarded, 1);
}

#[tokio::test]
async fn test_cancelled_create_leaves_primary_untouched() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster);
    let (header, items) = grocery_run();

    cluster.delay_next_item_insert(Duration::from_secs(5));
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        store.create_transaction(&header, &items),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(cluster.transaction_count(Role::Primary), 0);
    assert_eq!(cluster.item_count(Role::Primary), 0);
    assert!(cluster.pending_changes().is_empty());
    let [primary, _] = store.pool_stats();
    assert_eq!(primary.in_use, 0);
    assert_eq!(primary.idle, 0);
    assert_eq!(primary.discarded, 1);

    // The pool recovers for the next caller.
    let id = store.create_transaction(&header, &items).await.unwrap();
    assert_eq!(cluster.items(Role::Primary, id).len(), 2);
}

// ABOUTME: Integration tests for operation routing across the two pools
// ABOUTME: Pool counters show which endpoint each operation actually touched

use replica_router::memory::{MemoryCluster, MemoryConnector};
use replica_router::{
    DateRange, NewSalesItem, NewTransaction, Operation, OperationKind, PageRequest, Role,
    RouterConfig, RouterError, SalesStore, TransactionFilter, TransactionPatch,
};
use rust_decimal::Decimal;

fn config() -> RouterConfig {
    let mut config = RouterConfig::default();
    config.primary.pool.min_size = 0;
    config.primary.pool.max_size = 2;
    config.primary.pool.connect_backoff_ms = 1;
    config.replica.pool.min_size = 0;
    config.replica.pool.connect_backoff_ms = 1;
    config
}

fn store(cluster: &MemoryCluster, config: RouterConfig) -> SalesStore<MemoryConnector> {
    SalesStore::with_connectors(
        cluster.connector(Role::Primary),
        cluster.connector(Role::Replica),
        config,
    )
}

fn sale() -> (NewTransaction, Vec<NewSalesItem>) {
    let ts = chrono::NaiveDate::from_ymd_opt(2024, 7, 1)
        .unwrap()
        .and_hms_opt(8, 15, 0)
        .unwrap();
    let items = vec![NewSalesItem::new("P1", "Coffee", 1, Decimal::from(25))];
    let header = NewTransaction::new(ts, 7, 2, "E-Wallet").totals_from(&items);
    (header, items)
}

#[tokio::test]
async fn test_writes_use_primary_and_reads_use_replica() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster, config());
    let (header, items) = sale();

    let id = store.create_transaction(&header, &items).await.unwrap();
    let patch = TransactionPatch {
        payment_method: Some("Cash".to_string()),
        ..Default::default()
    };
    store.update_transaction(id, &patch).await.unwrap();

    let [primary, replica] = store.pool_stats();
    assert_eq!(primary.acquired, 2);
    assert_eq!(replica.acquired, 0);
    assert_eq!(cluster.connect_attempts(Role::Replica), 0);

    store
        .list_transactions(&TransactionFilter::default(), PageRequest::default())
        .await
        .unwrap();
    store.get_transaction(id).await.unwrap();
    store.items_for_transaction(id).await.unwrap();
    store.get_analytics(&DateRange::all()).await.unwrap();
    store.is_visible(id).await.unwrap();

    let [primary, replica] = store.pool_stats();
    assert_eq!(primary.acquired, 2, "reads must not touch the primary");
    assert_eq!(replica.acquired, 5);

    store.delete_transaction(id).await.unwrap();
    let [primary, replica] = store.pool_stats();
    assert_eq!(primary.acquired, 3);
    assert_eq!(replica.acquired, 5);
}

#[tokio::test]
async fn test_every_operation_rejected_by_the_other_pool() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster, config());

    for operation in Operation::ALL {
        let (right, wrong) = match operation.kind() {
            OperationKind::Write => (Role::Primary, Role::Replica),
            OperationKind::Read => (Role::Replica, Role::Primary),
        };

        match store.pools().pool(wrong).acquire_for(operation).await {
            Err(RouterError::MisroutedOperation { role, kind, .. }) => {
                assert_eq!(role, wrong);
                assert_eq!(kind, operation.kind());
            }
            other => panic!("{operation} on {wrong}: expected MisroutedOperation, got {:?}", other.err()),
        }

        let conn = store.pools().pool(right).acquire_for(operation).await.unwrap();
        assert_eq!(conn.role(), right);
    }
}

#[tokio::test]
async fn test_reads_continue_when_primary_pool_is_gone() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster, config());
    store.pools().pool(Role::Primary).close();

    let (header, items) = sale();
    assert!(matches!(
        store.create_transaction(&header, &items).await,
        Err(RouterError::PoolClosed {
            role: Role::Primary
        })
    ));

    let page = store
        .list_transactions(&TransactionFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_primary_exhaustion_does_not_block_reads() {
    let cluster = MemoryCluster::new();
    let mut config = config();
    config.primary.pool.acquire_timeout_ms = 20;
    let store = store(&cluster, config);

    let _a = store
        .pools()
        .acquire_for(Operation::CreateTransaction)
        .await
        .unwrap();
    let _b = store
        .pools()
        .acquire_for(Operation::CreateTransaction)
        .await
        .unwrap();

    let (header, items) = sale();
    let err = store.create_transaction(&header, &items).await.unwrap_err();
    assert!(matches!(err, RouterError::PoolExhausted { role: Role::Primary, .. }));
    assert!(err.is_transient());

    assert!(store.sales_stats(&DateRange::all()).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_writers_share_a_small_primary_pool() {
    let cluster = MemoryCluster::new();
    let store = store(&cluster, config());
    let (header, items) = sale();

    let (a, b, c, d, e) = tokio::join!(
        store.create_transaction(&header, &items),
        store.create_transaction(&header, &items),
        store.create_transaction(&header, &items),
        store.create_transaction(&header, &items),
        store.create_transaction(&header, &items),
    );
    let mut ids: Vec<i64> = [a, b, c, d, e].into_iter().map(Result::unwrap).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    let [primary, _] = store.pool_stats();
    assert!(primary.created <= 2);
    assert_eq!(primary.in_use, 0);
    assert_eq!(cluster.transaction_count(Role::Primary), 5);
}

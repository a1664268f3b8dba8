// ABOUTME: SalesStore facade owning both pools, with an explicit open/close lifecycle
// ABOUTME: Hands out the write executor, read executor and lag observer over shared pools

use anyhow::Result;

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::lag::{Expectation, LagObserver, PollPolicy, VisibilityReport};
use crate::models::{
    AnalyticsSummary, DailySales, DateRange, EndpointInfo, EndpointStatus, NewSalesItem,
    NewTransaction, Page, PageRequest, ProductSales, SalesItem, SalesStats, Transaction,
    TransactionDetail, TransactionFilter, TransactionPatch,
};
use crate::pool::{ping, PoolStats};
use crate::postgres::PgConnector;
use crate::reader::TransactionReader;
use crate::routing::{DualPool, Operation, Role};
use crate::schema::REPLICA_DDL;
use crate::store::{Connector, StoreConnection};
use crate::writer::TransactionWriter;

/// The routed dual-store access layer.
///
/// Configuration is consumed at construction and never changes. Pools
/// connect lazily on first use; [`SalesStore::close`] drains them.
pub struct SalesStore<C: Connector = PgConnector> {
    pools: DualPool<C>,
    config: RouterConfig,
}

impl SalesStore<PgConnector> {
    /// Validate `config` and set up PostgreSQL pools for both endpoints.
    /// No connection is made until the first operation.
    pub fn open(config: RouterConfig) -> Result<Self> {
        config.validate()?;
        config.log_config();
        let primary = PgConnector::new(Role::Primary, config.primary.clone());
        let replica = PgConnector::new(Role::Replica, config.replica.clone());
        Ok(Self::with_connectors(primary, replica, config))
    }
}

impl<C: Connector> SalesStore<C> {
    pub fn with_connectors(primary: C, replica: C, config: RouterConfig) -> Self {
        let pools = DualPool::new(primary, replica, &config);
        Self { pools, config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn pools(&self) -> &DualPool<C> {
        &self.pools
    }

    pub fn writer(&self) -> TransactionWriter<'_, C> {
        TransactionWriter::new(&self.pools, &self.config.write)
    }

    pub fn reader(&self) -> TransactionReader<'_, C> {
        TransactionReader::new(&self.pools, &self.config.read)
    }

    pub fn lag(&self) -> LagObserver<'_, C> {
        LagObserver::new(&self.pools, &self.config.read)
    }

    pub async fn create_transaction(
        &self,
        header: &NewTransaction,
        items: &[NewSalesItem],
    ) -> Result<i64, RouterError> {
        self.writer().create_transaction(header, items).await
    }

    pub async fn update_transaction(
        &self,
        transaction_id: i64,
        patch: &TransactionPatch,
    ) -> Result<Transaction, RouterError> {
        self.writer().update_transaction(transaction_id, patch).await
    }

    pub async fn delete_transaction(&self, transaction_id: i64) -> Result<(), RouterError> {
        self.writer().delete_transaction(transaction_id).await
    }

    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        page: PageRequest,
    ) -> Result<Page<Transaction>, RouterError> {
        self.reader().list_transactions(filter, page).await
    }

    pub async fn get_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Option<TransactionDetail>, RouterError> {
        self.reader().get_transaction(transaction_id).await
    }

    pub async fn items_for_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Vec<SalesItem>, RouterError> {
        self.reader().items_for_transaction(transaction_id).await
    }

    pub async fn sales_stats(&self, range: &DateRange) -> Result<SalesStats, RouterError> {
        self.reader().sales_stats(range).await
    }

    pub async fn top_products(
        &self,
        range: &DateRange,
        limit: u32,
    ) -> Result<Vec<ProductSales>, RouterError> {
        self.reader().top_products(range, limit).await
    }

    pub async fn sales_trend(&self, range: &DateRange) -> Result<Vec<DailySales>, RouterError> {
        self.reader().sales_trend(range).await
    }

    pub async fn get_analytics(&self, range: &DateRange) -> Result<AnalyticsSummary, RouterError> {
        self.reader().get_analytics(range).await
    }

    pub async fn is_visible(&self, transaction_id: i64) -> Result<bool, RouterError> {
        self.lag().is_visible(transaction_id).await
    }

    pub async fn wait_until(
        &self,
        transaction_id: i64,
        expectation: Expectation,
        policy: PollPolicy,
    ) -> Result<VisibilityReport, RouterError> {
        self.lag()
            .wait_until(transaction_id, expectation, policy)
            .await
    }

    /// Ping both endpoints. Failures are logged and reported as `false`.
    pub async fn check_connection(&self) -> EndpointStatus {
        EndpointStatus {
            primary: self.probe(Operation::CheckPrimary).await,
            replica: self.probe(Operation::CheckReplica).await,
        }
    }

    async fn probe(&self, operation: Operation) -> bool {
        let result = match self.pools.acquire_for(operation).await {
            Ok(mut conn) => ping(&mut conn)
                .await
                .map_err(|e| RouterError::from_read(operation, e)),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{} endpoint unreachable: {}", operation.role(), e);
                false
            }
        }
    }

    /// Server version, read-only state, table presence and missing
    /// privileges of one endpoint.
    pub async fn describe(&self, role: Role) -> Result<EndpointInfo, RouterError> {
        let operation = match role {
            Role::Primary => Operation::CheckPrimary,
            Role::Replica => Operation::CheckReplica,
        };
        let mut conn = self.pools.acquire_for(operation).await?;
        let result = conn.describe().await;
        conn.observe(result)
            .map_err(|e| RouterError::from_read(operation, e))
    }

    /// Create the sales tables on the primary if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), RouterError> {
        let operation = Operation::ApplySchema;
        let mut conn = self.pools.acquire_for(operation).await?;
        let result = conn.ensure_schema().await;
        conn.observe(result)
            .map_err(|e| RouterError::from_write(operation, e))?;
        tracing::info!("Sales schema present on primary");
        Ok(())
    }

    /// DDL the sink operator applies on the replica.
    pub fn replica_ddl(&self) -> &'static str {
        REPLICA_DDL
    }

    pub fn pool_stats(&self) -> [PoolStats; 2] {
        [self.pools.stats(Role::Primary), self.pools.stats(Role::Replica)]
    }

    /// Stop handing out connections on both pools and drop idle ones.
    pub fn close(&self) {
        self.pools.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCluster, MemoryConnector};

    fn store(cluster: &MemoryCluster) -> SalesStore<MemoryConnector> {
        SalesStore::with_connectors(
            cluster.connector(Role::Primary),
            cluster.connector(Role::Replica),
            RouterConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_check_connection_reports_both_endpoints() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        assert_eq!(
            store.check_connection().await,
            EndpointStatus {
                primary: true,
                replica: true
            }
        );
    }

    #[tokio::test]
    async fn test_check_connection_after_close() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        store.close();
        assert_eq!(store.check_connection().await, EndpointStatus::default());
    }

    #[tokio::test]
    async fn test_describe_replica_is_read_only() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        assert!(store.describe(Role::Replica).await.unwrap().read_only);
        assert!(!store.describe(Role::Primary).await.unwrap().read_only);
    }

    #[tokio::test]
    async fn test_ensure_schema_uses_primary() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster);
        store.ensure_schema().await.unwrap();
        let [primary, replica] = store.pool_stats();
        assert_eq!(primary.acquired, 1);
        assert_eq!(replica.acquired, 0);
    }
}

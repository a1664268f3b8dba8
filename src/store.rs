// ABOUTME: Storage boundary traits shared by the PostgreSQL and in-memory backends
// ABOUTME: Connector opens physical connections; StoreConnection runs statements on one

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    money, DailySales, DateRange, EndpointInfo, NewSalesItem, NewTransaction, PageRequest, ProductSales,
    SalesItem, SalesStats, Transaction, TransactionFilter, TransactionPatch,
};

/// Storage-level failure. Converted into [`crate::RouterError`] by the
/// executors and never returned to callers as-is.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Could not open a physical connection (network, auth, TLS).
    #[error("connect failed: {0}")]
    Connect(String),
    /// An open connection broke while in use.
    #[error("connection lost: {0}")]
    Connection(String),
    /// Integrity constraint (FK, unique, check) rejected a statement.
    #[error("constraint {constraint} violated: {message}")]
    Constraint { constraint: String, message: String },
    /// A write was attempted on a read-only session.
    #[error("session is read-only")]
    ReadOnly,
    /// Any other statement failure.
    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Connection-level errors poison the connection: it must be discarded
    /// instead of returned to its pool.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StoreError::Connect(_) | StoreError::Connection(_))
    }
}

/// Line total of an item as stored: `quantity × unit_price − discount` over
/// the amounts rounded to storage scale, so a stored row always satisfies
/// its own price rule.
pub fn line_total(item: &NewSalesItem) -> Result<rust_decimal::Decimal, StoreError> {
    rust_decimal::Decimal::from(item.quantity)
        .checked_mul(money(item.unit_price))
        .and_then(|value| value.checked_sub(money(item.discount)))
        .ok_or_else(|| StoreError::Constraint {
            constraint: "sales_item_total_price_check".to_string(),
            message: format!("line total of {} overflows", item.product_code),
        })
}

/// Opens physical connections to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: StoreConnection;

    /// Human-readable endpoint label for logs (never includes credentials).
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;
}

/// A single physical connection.
///
/// Write statements are only issued between `begin` and `commit`/`rollback`
/// and only on connections borrowed from the primary pool. Read statements
/// run in autocommit mode on replica connections.
#[async_trait]
pub trait StoreConnection: Send + 'static {
    /// Cheap liveness probe (`SELECT 1`).
    async fn ping(&mut self) -> Result<(), StoreError>;

    /// Server version, read-only flag and table presence.
    async fn describe(&mut self) -> Result<EndpointInfo, StoreError>;

    /// Create the sales tables if they do not exist.
    async fn ensure_schema(&mut self) -> Result<(), StoreError>;

    async fn begin(&mut self) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Insert a header; the store assigns `transaction_id` and `created_at`.
    async fn insert_transaction(
        &mut self,
        header: &NewTransaction,
    ) -> Result<Transaction, StoreError>;

    async fn insert_item(
        &mut self,
        transaction_id: i64,
        item: &NewSalesItem,
    ) -> Result<SalesItem, StoreError>;

    /// Returns `None` when no row matched.
    async fn update_transaction(
        &mut self,
        transaction_id: i64,
        patch: &TransactionPatch,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Returns the number of item rows deleted.
    async fn delete_items(&mut self, transaction_id: i64) -> Result<u64, StoreError>;

    /// Returns the number of header rows deleted (0 or 1).
    async fn delete_transaction(&mut self, transaction_id: i64) -> Result<u64, StoreError>;

    /// Sum of `total_price` over the items of one transaction, as seen by
    /// this connection (including its own uncommitted writes).
    async fn sum_item_totals(
        &mut self,
        transaction_id: i64,
    ) -> Result<rust_decimal::Decimal, StoreError>;

    /// Keyset page ordered by `transaction_id` descending. Returns up to
    /// `page.limit + 1` rows so the caller can tell whether more exist.
    async fn fetch_transactions(
        &mut self,
        filter: &TransactionFilter,
        page: &PageRequest,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn fetch_transaction(
        &mut self,
        transaction_id: i64,
    ) -> Result<Option<Transaction>, StoreError>;

    async fn fetch_items(&mut self, transaction_id: i64) -> Result<Vec<SalesItem>, StoreError>;

    async fn fetch_stats(&mut self, range: &DateRange) -> Result<SalesStats, StoreError>;

    async fn fetch_top_products(
        &mut self,
        range: &DateRange,
        limit: u32,
    ) -> Result<Vec<ProductSales>, StoreError>;

    async fn fetch_daily_trend(&mut self, range: &DateRange) -> Result<Vec<DailySales>, StoreError>;

    async fn transaction_exists(&mut self, transaction_id: i64) -> Result<bool, StoreError>;
}

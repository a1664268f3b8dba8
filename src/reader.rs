// ABOUTME: Read executor: every query runs on a replica connection in autocommit mode
// ABOUTME: Results may be stale; staleness is never an error

use crate::config::ReadConfig;
use crate::error::RouterError;
use crate::models::{
    AnalyticsSummary, DailySales, DateRange, Page, PageRequest, ProductSales, SalesItem,
    SalesStats, Transaction, TransactionDetail, TransactionFilter,
};
use crate::pool::PooledConnection;
use crate::routing::{DualPool, Operation};
use crate::store::{Connector, StoreConnection, StoreError};

/// Number of products in a top-products ranking unless the caller asks for
/// another size.
pub const DEFAULT_TOP_PRODUCTS: u32 = 10;

/// Borrow a replica connection for `$op`, evaluate `$body` with it bound to
/// `$conn`, and retry once more per `transient_retries` if the connection
/// broke. Other failures become `ReadFailed`.
macro_rules! on_replica {
    ($this:expr, $op:expr, |$conn:ident| $body:expr) => {{
        let operation = $op;
        let mut attempt = 0;
        loop {
            let mut $conn = $this.pools.acquire_for(operation).await?;
            let result = $body;
            match $conn.observe(result) {
                Ok(value) => break Ok::<_, RouterError>(value),
                Err(err)
                    if err.is_connection_error() && attempt < $this.config.transient_retries =>
                {
                    tracing::warn!(
                        "{} lost its replica connection ({}); retrying on a fresh connection",
                        operation,
                        err
                    );
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!("{} failed on replica: {}", operation, err);
                    break Err(RouterError::from_read(operation, err));
                }
            }
        }
    }};
}

pub(crate) use on_replica;

/// Runs READ-tagged operations against the replica pool.
///
/// The replica trails the primary by an unbounded interval and the sink
/// applies the header and item tables independently. A read can therefore
/// miss a just-committed transaction, still return a just-deleted one, or
/// see a header before all of its items. All of that is returned as data.
pub struct TransactionReader<'a, C: Connector> {
    pools: &'a DualPool<C>,
    config: &'a ReadConfig,
}

impl<'a, C: Connector> TransactionReader<'a, C> {
    pub fn new(pools: &'a DualPool<C>, config: &'a ReadConfig) -> Self {
        Self { pools, config }
    }

    /// One keyset page of transactions, newest first.
    ///
    /// The cursor is the last `transaction_id` returned, so rows inserted
    /// while a caller pages are never duplicated or skipped on later pages;
    /// they only show up when paging restarts from the top.
    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        page: PageRequest,
    ) -> Result<Page<Transaction>, RouterError> {
        let page = page.normalized();
        let mut rows = on_replica!(self, Operation::ListTransactions, |conn| {
            conn.fetch_transactions(filter, &page).await
        })?;

        let limit = page.limit as usize;
        let next_cursor = if rows.len() > limit {
            rows.truncate(limit);
            rows.last().map(|t| t.transaction_id)
        } else {
            None
        };
        tracing::debug!(
            "Listed {} transaction(s) before {:?} (more: {})",
            rows.len(),
            page.before,
            next_cursor.is_some()
        );
        Ok(Page {
            items: rows,
            next_cursor,
        })
    }

    /// Header and currently visible items, or `None` if the replica has not
    /// seen the header (yet, or any more).
    pub async fn get_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Option<TransactionDetail>, RouterError> {
        let detail = on_replica!(self, Operation::GetTransaction, |conn| {
            fetch_detail(&mut conn, transaction_id).await
        })?;
        if let Some(detail) = &detail {
            if !detail.is_consistent() {
                tracing::debug!(
                    "Transaction {} is only partly replicated ({} item(s) visible)",
                    transaction_id,
                    detail.items.len()
                );
            }
        }
        Ok(detail)
    }

    pub async fn items_for_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Vec<SalesItem>, RouterError> {
        on_replica!(self, Operation::ListItems, |conn| {
            conn.fetch_items(transaction_id).await
        })
    }

    pub async fn sales_stats(&self, range: &DateRange) -> Result<SalesStats, RouterError> {
        on_replica!(self, Operation::SalesStats, |conn| {
            conn.fetch_stats(range).await
        })
    }

    /// Products ranked by quantity sold, then by name.
    pub async fn top_products(
        &self,
        range: &DateRange,
        limit: u32,
    ) -> Result<Vec<ProductSales>, RouterError> {
        let limit = limit.max(1);
        on_replica!(self, Operation::TopProducts, |conn| {
            conn.fetch_top_products(range, limit).await
        })
    }

    /// Daily revenue and transaction counts, oldest day first.
    pub async fn sales_trend(&self, range: &DateRange) -> Result<Vec<DailySales>, RouterError> {
        on_replica!(self, Operation::SalesTrend, |conn| {
            conn.fetch_daily_trend(range).await
        })
    }

    /// Stats, top products and daily trend for one range, read over a
    /// single replica connection.
    pub async fn get_analytics(&self, range: &DateRange) -> Result<AnalyticsSummary, RouterError> {
        on_replica!(self, Operation::Analytics, |conn| {
            fetch_analytics(&mut conn, range).await
        })
    }
}

async fn fetch_detail<C: Connector>(
    conn: &mut PooledConnection<C>,
    transaction_id: i64,
) -> Result<Option<TransactionDetail>, StoreError> {
    let Some(transaction) = conn.fetch_transaction(transaction_id).await? else {
        return Ok(None);
    };
    let items = conn.fetch_items(transaction_id).await?;
    Ok(Some(TransactionDetail { transaction, items }))
}

async fn fetch_analytics<C: Connector>(
    conn: &mut PooledConnection<C>,
    range: &DateRange,
) -> Result<AnalyticsSummary, StoreError> {
    let stats = conn.fetch_stats(range).await?;
    let top_products = conn.fetch_top_products(range, DEFAULT_TOP_PRODUCTS).await?;
    let daily_trend = conn.fetch_daily_trend(range).await?;
    Ok(AnalyticsSummary {
        range: *range,
        stats,
        top_products,
        daily_trend,
    })
}

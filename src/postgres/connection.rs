// ABOUTME: StoreConnection over a tokio-postgres client for the sales tables
// ABOUTME: Builds parameterized SQL; all money travels as NUMERIC via rust_decimal

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use super::privileges::describe_endpoint;
use crate::models::{
    money, DailySales, DateRange, EndpointInfo, NewSalesItem, NewTransaction, PageRequest,
    ProductSales, SalesItem, SalesStats, Transaction, TransactionFilter, TransactionPatch,
};
use crate::routing::Role;
use crate::schema::PRIMARY_DDL;
use crate::store::{line_total, StoreConnection, StoreError};

type Params = Vec<Box<dyn ToSql + Sync + Send>>;

const TRANSACTION_COLUMNS: &str = "transaction_id, transaction_time, cashier_id, store_id, \
     payment_method, total_amount, total_discount, customer_id, created_at";

const ITEM_COLUMNS: &str = "item_id, transaction_id, product_code, product_name, category, \
     quantity, unit_price, discount, total_price";

/// `[from, to)` on `transaction_time`; `$1`/`$2` may be NULL for an open bound.
const RANGE_PREDICATE: &str = "($1::TIMESTAMP IS NULL OR t.transaction_time >= $1) \
     AND ($2::TIMESTAMP IS NULL OR t.transaction_time < $2)";

pub struct PgConnection {
    client: Client,
    role: Role,
}

impl PgConnection {
    pub fn new(client: Client, role: Role) -> Self {
        Self { client, role }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn refs(params: &Params) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|v| v.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn transaction_from_row(row: &Row) -> Result<Transaction, tokio_postgres::Error> {
    Ok(Transaction {
        transaction_id: row.try_get("transaction_id")?,
        transaction_time: row.try_get("transaction_time")?,
        cashier_id: row.try_get("cashier_id")?,
        store_id: row.try_get("store_id")?,
        payment_method: row.try_get("payment_method")?,
        total_amount: row.try_get("total_amount")?,
        total_discount: row.try_get("total_discount")?,
        customer_id: row.try_get("customer_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn item_from_row(row: &Row) -> Result<SalesItem, tokio_postgres::Error> {
    Ok(SalesItem {
        item_id: row.try_get("item_id")?,
        transaction_id: row.try_get("transaction_id")?,
        product_code: row.try_get("product_code")?,
        product_name: row.try_get("product_name")?,
        category: row.try_get("category")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        discount: row.try_get("discount")?,
        total_price: row.try_get("total_price")?,
    })
}

/// Build an UPDATE for the columns a patch sets.
///
/// ```sql
/// UPDATE sales_transaction SET "payment_method" = $1, "customer_id" = $2
/// WHERE transaction_id = $3 RETURNING ...
/// ```
fn build_update_query(transaction_id: i64, patch: &TransactionPatch) -> (String, Params) {
    let mut sets: Vec<String> = Vec::new();
    let mut params: Params = Vec::new();
    let mut push = |column: &str, value: Box<dyn ToSql + Sync + Send>| {
        params.push(value);
        sets.push(format!("\"{}\" = ${}", column, params.len()));
    };

    if let Some(ts) = patch.transaction_time {
        push("transaction_time", Box::new(ts));
    }
    if let Some(cashier) = patch.cashier_id {
        push("cashier_id", Box::new(cashier));
    }
    if let Some(store) = patch.store_id {
        push("store_id", Box::new(store));
    }
    if let Some(method) = &patch.payment_method {
        push("payment_method", Box::new(method.clone()));
    }
    if let Some(amount) = patch.total_amount {
        push("total_amount", Box::new(money(amount)));
    }
    if let Some(discount) = patch.total_discount {
        push("total_discount", Box::new(money(discount)));
    }
    if let Some(customer) = patch.customer_id {
        push("customer_id", Box::new(customer));
    }

    params.push(Box::new(transaction_id));
    let query = format!(
        "UPDATE sales_transaction SET {} WHERE transaction_id = ${} RETURNING {}",
        sets.join(", "),
        params.len(),
        TRANSACTION_COLUMNS
    );
    (query, params)
}

/// Build a keyset page query, newest first, fetching one row past the limit.
fn build_list_query(filter: &TransactionFilter, page: &PageRequest) -> (String, Params) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Params = Vec::new();
    let mut push = |condition: &str, value: Box<dyn ToSql + Sync + Send>| {
        params.push(value);
        conditions.push(format!("{} ${}", condition, params.len()));
    };

    if let Some(before) = page.before {
        push("transaction_id <", Box::new(before));
    }
    if let Some(store) = filter.store_id {
        push("store_id =", Box::new(store));
    }
    if let Some(cashier) = filter.cashier_id {
        push("cashier_id =", Box::new(cashier));
    }
    if let Some(method) = &filter.payment_method {
        push("payment_method =", Box::new(method.clone()));
    }
    if let Some(from) = filter.range.from {
        push("transaction_time >=", Box::new(from));
    }
    if let Some(to) = filter.range.to {
        push("transaction_time <", Box::new(to));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    params.push(Box::new(i64::from(page.limit) + 1));
    let query = format!(
        "SELECT {} FROM sales_transaction{} ORDER BY transaction_id DESC LIMIT ${}",
        TRANSACTION_COLUMNS,
        where_clause,
        params.len()
    );
    (query, params)
}

fn range_params(range: &DateRange) -> [Option<NaiveDateTime>; 2] {
    [range.from, range.to]
}

#[async_trait]
impl StoreConnection for PgConnection {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn describe(&mut self) -> Result<EndpointInfo, StoreError> {
        Ok(describe_endpoint(&self.client, self.role).await?)
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        if self.role == Role::Replica {
            return Err(StoreError::ReadOnly);
        }
        self.client.batch_execute(PRIMARY_DDL).await?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        header: &NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let query = format!(
            "INSERT INTO sales_transaction \
             (transaction_time, cashier_id, store_id, payment_method, total_amount, total_discount, customer_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
            TRANSACTION_COLUMNS
        );
        let row = self
            .client
            .query_one(
                &query,
                &[
                    &header.transaction_time,
                    &header.cashier_id,
                    &header.store_id,
                    &header.payment_method,
                    &money(header.total_amount),
                    &money(header.total_discount),
                    &header.customer_id,
                ],
            )
            .await?;
        Ok(transaction_from_row(&row)?)
    }

    async fn insert_item(
        &mut self,
        transaction_id: i64,
        item: &NewSalesItem,
    ) -> Result<SalesItem, StoreError> {
        let total_price = line_total(item)?;
        let query = format!(
            "INSERT INTO sales_item \
             (transaction_id, product_code, product_name, category, quantity, unit_price, discount, total_price) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
            ITEM_COLUMNS
        );
        let row = self
            .client
            .query_one(
                &query,
                &[
                    &transaction_id,
                    &item.product_code,
                    &item.product_name,
                    &item.category,
                    &item.quantity,
                    &money(item.unit_price),
                    &money(item.discount),
                    &money(total_price),
                ],
            )
            .await?;
        Ok(item_from_row(&row)?)
    }

    async fn update_transaction(
        &mut self,
        transaction_id: i64,
        patch: &TransactionPatch,
    ) -> Result<Option<Transaction>, StoreError> {
        let (query, params) = build_update_query(transaction_id, patch);
        let row = self.client.query_opt(&query, &refs(&params)).await?;
        match row {
            Some(row) => Ok(Some(transaction_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_items(&mut self, transaction_id: i64) -> Result<u64, StoreError> {
        Ok(self
            .client
            .execute(
                "DELETE FROM sales_item WHERE transaction_id = $1",
                &[&transaction_id],
            )
            .await?)
    }

    async fn delete_transaction(&mut self, transaction_id: i64) -> Result<u64, StoreError> {
        Ok(self
            .client
            .execute(
                "DELETE FROM sales_transaction WHERE transaction_id = $1",
                &[&transaction_id],
            )
            .await?)
    }

    async fn sum_item_totals(&mut self, transaction_id: i64) -> Result<Decimal, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT COALESCE(SUM(total_price), 0) FROM sales_item WHERE transaction_id = $1",
                &[&transaction_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn fetch_transactions(
        &mut self,
        filter: &TransactionFilter,
        page: &PageRequest,
    ) -> Result<Vec<Transaction>, StoreError> {
        let (query, params) = build_list_query(filter, page);
        let rows = self.client.query(&query, &refs(&params)).await?;
        Ok(rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<_, _>>()?)
    }

    async fn fetch_transaction(
        &mut self,
        transaction_id: i64,
    ) -> Result<Option<Transaction>, StoreError> {
        let query = format!(
            "SELECT {} FROM sales_transaction WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        );
        let row = self.client.query_opt(&query, &[&transaction_id]).await?;
        match row {
            Some(row) => Ok(Some(transaction_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn fetch_items(&mut self, transaction_id: i64) -> Result<Vec<SalesItem>, StoreError> {
        let query = format!(
            "SELECT {} FROM sales_item WHERE transaction_id = $1 ORDER BY item_id",
            ITEM_COLUMNS
        );
        let rows = self.client.query(&query, &[&transaction_id]).await?;
        Ok(rows.iter().map(item_from_row).collect::<Result<_, _>>()?)
    }

    async fn fetch_stats(&mut self, range: &DateRange) -> Result<SalesStats, StoreError> {
        // Header sums come from the headers alone; joining items first would
        // count each header once per item.
        let query = format!(
            "WITH t AS (SELECT transaction_id, total_amount FROM sales_transaction t WHERE {range}) \
             SELECT \
               (SELECT COUNT(*) FROM t)::BIGINT, \
               (SELECT COALESCE(SUM(total_amount), 0) FROM t), \
               (SELECT COALESCE(SUM(i.quantity), 0) FROM sales_item i JOIN t ON t.transaction_id = i.transaction_id)::BIGINT, \
               (SELECT COALESCE(ROUND(AVG(total_amount), 2), 0) FROM t)",
            range = RANGE_PREDICATE
        );
        let [from, to] = range_params(range);
        let row = self.client.query_one(&query, &[&from, &to]).await?;
        Ok(SalesStats {
            total_transactions: row.try_get(0)?,
            total_revenue: row.try_get(1)?,
            total_items_sold: row.try_get(2)?,
            average_transaction_value: row.try_get(3)?,
        })
    }

    async fn fetch_top_products(
        &mut self,
        range: &DateRange,
        limit: u32,
    ) -> Result<Vec<ProductSales>, StoreError> {
        let query = format!(
            "SELECT i.product_name, SUM(i.quantity)::BIGINT AS total_quantity, SUM(i.total_price) AS total_revenue \
             FROM sales_item i JOIN sales_transaction t ON t.transaction_id = i.transaction_id \
             WHERE {} \
             GROUP BY i.product_name \
             ORDER BY total_quantity DESC, i.product_name \
             LIMIT $3",
            RANGE_PREDICATE
        );
        let [from, to] = range_params(range);
        let rows = self
            .client
            .query(&query, &[&from, &to, &i64::from(limit)])
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ProductSales {
                    product_name: row.try_get(0)?,
                    total_quantity: row.try_get(1)?,
                    total_revenue: row.try_get(2)?,
                })
            })
            .collect()
    }

    async fn fetch_daily_trend(&mut self, range: &DateRange) -> Result<Vec<DailySales>, StoreError> {
        let query = format!(
            "SELECT DATE(t.transaction_time) AS day, SUM(t.total_amount), COUNT(*)::BIGINT \
             FROM sales_transaction t WHERE {} \
             GROUP BY day ORDER BY day",
            RANGE_PREDICATE
        );
        let [from, to] = range_params(range);
        let rows = self.client.query(&query, &[&from, &to]).await?;
        rows.iter()
            .map(|row| {
                Ok(DailySales {
                    date: row.try_get(0)?,
                    total_amount: row.try_get(1)?,
                    transaction_count: row.try_get(2)?,
                })
            })
            .collect()
    }

    async fn transaction_exists(&mut self, transaction_id: i64) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM sales_transaction WHERE transaction_id = $1)",
                &[&transaction_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }
}

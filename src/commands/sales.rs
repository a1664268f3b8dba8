// ABOUTME: create, list, show, update and delete commands for sales transactions
// ABOUTME: Writes go through the primary; list and show read the replica and may be stale

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use clap::Args;
use rust_decimal::Decimal;
use serde_json::json;

use super::{parse_timestamp, print_json};
use crate::models::{
    DateRange, NewSalesItem, NewTransaction, PageRequest, TransactionFilter, TransactionPatch,
    DEFAULT_PAGE_SIZE,
};
use crate::service::SalesStore;
use crate::store::Connector;

/// One `--item` value: `CODE:NAME:QTY:UNIT_PRICE[:DISCOUNT[:CATEGORY]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemArg(pub NewSalesItem);

impl FromStr for ItemArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(':').collect();
        if !(4..=6).contains(&parts.len()) {
            return Err(format!(
                "invalid item '{}': expected CODE:NAME:QTY:UNIT_PRICE[:DISCOUNT[:CATEGORY]]",
                value
            ));
        }
        let quantity: i32 = parts[2]
            .parse()
            .map_err(|_| format!("invalid quantity '{}'", parts[2]))?;
        let unit_price = parse_money(parts[3])?;
        let mut item = NewSalesItem::new(parts[0], parts[1], quantity, unit_price);
        if let Some(discount) = parts.get(4).filter(|d| !d.is_empty()) {
            item = item.with_discount(parse_money(discount)?);
        }
        if let Some(category) = parts.get(5).filter(|c| !c.is_empty()) {
            item = item.with_category(*category);
        }
        Ok(ItemArg(item))
    }
}

fn parse_money(value: &str) -> Result<Decimal, String> {
    value
        .parse::<Decimal>()
        .map_err(|_| format!("invalid amount '{}'", value))
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long)]
    pub cashier: i32,
    #[arg(long)]
    pub store: i32,
    /// Payment method (e.g. Cash, Credit Card, E-Wallet)
    #[arg(long)]
    pub payment: String,
    #[arg(long)]
    pub customer: Option<i32>,
    /// Header-level discount
    #[arg(long, value_parser = parse_money, default_value = "0")]
    pub discount: Decimal,
    /// Transaction time; defaults to now (UTC)
    #[arg(long, value_parser = parse_timestamp)]
    pub time: Option<NaiveDateTime>,
    /// Line item CODE:NAME:QTY:UNIT_PRICE[:DISCOUNT[:CATEGORY]] (repeatable)
    #[arg(long = "item", required = true)]
    pub items: Vec<ItemArg>,
    /// Explicit total; by default derived from the items and discount
    #[arg(long, value_parser = parse_money)]
    pub total: Option<Decimal>,
}

impl CreateArgs {
    fn into_parts(self) -> (NewTransaction, Vec<NewSalesItem>) {
        let items: Vec<NewSalesItem> = self.items.into_iter().map(|ItemArg(item)| item).collect();
        let time = self.time.unwrap_or_else(|| Utc::now().naive_utc());
        let mut header = NewTransaction::new(time, self.cashier, self.store, self.payment)
            .with_discount(self.discount)
            .totals_from(&items);
        if let Some(customer) = self.customer {
            header = header.with_customer(customer);
        }
        if let Some(total) = self.total {
            header = header.with_total(total);
        }
        (header, items)
    }
}

pub async fn create<C: Connector>(store: &SalesStore<C>, args: CreateArgs) -> Result<()> {
    let (header, items) = args.into_parts();
    let transaction_id = store
        .create_transaction(&header, &items)
        .await
        .context("Failed to create transaction")?;
    print_json(&json!({
        "transaction_id": transaction_id,
        "total_amount": header.total_amount,
        "items": items.len(),
    }))
}

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Only transactions with a lower id (cursor from the previous page)
    #[arg(long)]
    pub before: Option<i64>,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub limit: u32,
    #[arg(long = "store")]
    pub store_id: Option<i32>,
    #[arg(long = "cashier")]
    pub cashier_id: Option<i32>,
    #[arg(long)]
    pub payment: Option<String>,
    #[arg(long, value_parser = parse_timestamp)]
    pub from: Option<NaiveDateTime>,
    #[arg(long, value_parser = parse_timestamp)]
    pub to: Option<NaiveDateTime>,
}

impl ListArgs {
    fn filter(&self) -> TransactionFilter {
        TransactionFilter {
            store_id: self.store_id,
            cashier_id: self.cashier_id,
            payment_method: self.payment.clone(),
            range: DateRange {
                from: self.from,
                to: self.to,
            },
        }
    }

    fn page(&self) -> PageRequest {
        match self.before {
            Some(cursor) => PageRequest::after_cursor(cursor, self.limit),
            None => PageRequest::first(self.limit),
        }
    }
}

pub async fn list<C: Connector>(store: &SalesStore<C>, args: ListArgs) -> Result<()> {
    let page = store
        .list_transactions(&args.filter(), args.page())
        .await
        .context("Failed to list transactions")?;
    print_json(&page)
}

pub async fn show<C: Connector>(store: &SalesStore<C>, transaction_id: i64) -> Result<()> {
    let detail = store
        .get_transaction(transaction_id)
        .await
        .context("Failed to read transaction")?;
    match detail {
        Some(detail) => print_json(&json!({
            "transaction": detail.transaction,
            "items": detail.items,
            "consistent": detail.is_consistent(),
        })),
        None => {
            tracing::info!(
                "Transaction {} is not on the replica (not replicated yet, deleted, or never existed)",
                transaction_id
            );
            print_json(&json!({ "transaction_id": transaction_id, "found": false }))
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct UpdateArgs {
    pub transaction_id: i64,
    #[arg(long, value_parser = parse_timestamp)]
    pub time: Option<NaiveDateTime>,
    #[arg(long)]
    pub cashier: Option<i32>,
    #[arg(long)]
    pub store: Option<i32>,
    #[arg(long)]
    pub payment: Option<String>,
    #[arg(long, value_parser = parse_money)]
    pub total: Option<Decimal>,
    #[arg(long, value_parser = parse_money)]
    pub discount: Option<Decimal>,
    #[arg(long, conflicts_with = "clear_customer")]
    pub customer: Option<i32>,
    #[arg(long)]
    pub clear_customer: bool,
}

impl UpdateArgs {
    fn patch(&self) -> TransactionPatch {
        let customer_id = if self.clear_customer {
            Some(None)
        } else {
            self.customer.map(Some)
        };
        TransactionPatch {
            transaction_time: self.time,
            cashier_id: self.cashier,
            store_id: self.store,
            payment_method: self.payment.clone(),
            total_amount: self.total,
            total_discount: self.discount,
            customer_id,
        }
    }
}

pub async fn update<C: Connector>(store: &SalesStore<C>, args: UpdateArgs) -> Result<()> {
    let updated = store
        .update_transaction(args.transaction_id, &args.patch())
        .await
        .with_context(|| format!("Failed to update transaction {}", args.transaction_id))?;
    print_json(&updated)
}

pub async fn delete<C: Connector>(store: &SalesStore<C>, transaction_id: i64) -> Result<()> {
    store
        .delete_transaction(transaction_id)
        .await
        .with_context(|| format!("Failed to delete transaction {}", transaction_id))?;
    print_json(&json!({ "transaction_id": transaction_id, "deleted": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_arg_full_form() {
        let ItemArg(item) = "P100:Potato Chips:2:10000:2000:Snacks".parse().unwrap();
        assert_eq!(item.product_code, "P100");
        assert_eq!(item.product_name, "Potato Chips");
        assert_eq!(item.quantity, 2);
        assert_eq!(item.discount, Decimal::from(2000));
        assert_eq!(item.category.as_deref(), Some("Snacks"));
        assert_eq!(item.total_price(), Some(Decimal::from(18000)));
    }

    #[test]
    fn test_item_arg_rejects_bad_input() {
        assert!("P1:Tea".parse::<ItemArg>().is_err());
        assert!("P1:Tea:two:5".parse::<ItemArg>().is_err());
        assert!("P1:Tea:2:five".parse::<ItemArg>().is_err());
    }

    #[test]
    fn test_create_args_derive_total() {
        let args = CreateArgs {
            cashier: 101,
            store: 1,
            payment: "Cash".to_string(),
            customer: None,
            discount: Decimal::from(5000),
            time: None,
            items: vec![
                "P100:Potato Chips:2:10000:2000".parse().unwrap(),
                "P200:Soda:4:8000".parse().unwrap(),
            ],
            total: None,
        };
        let (header, items) = args.into_parts();
        assert_eq!(items.len(), 2);
        assert_eq!(header.total_amount, Decimal::from(45000));
    }

    #[test]
    fn test_update_args_clear_customer() {
        let args = UpdateArgs {
            transaction_id: 7,
            clear_customer: true,
            ..Default::default()
        };
        assert_eq!(args.patch().customer_id, Some(None));
        assert!(!args.patch().touches_totals());
    }

    #[test]
    fn test_list_args_page() {
        let args = ListArgs {
            before: Some(50),
            limit: 10,
            ..Default::default()
        };
        assert_eq!(args.page(), PageRequest::after_cursor(50, 10));
    }
}

// ABOUTME: Sales transaction and line-item aggregates plus read-side projections
// ABOUTME: Holds the monetary business rules checked before any write commits

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::RouterError;

/// Scale of every monetary column (`NUMERIC(12, 2)`).
pub const MONEY_SCALE: u32 = 2;

/// Precision of `unit_price` and `discount` (`NUMERIC(10, 2)`).
pub const ITEM_MONEY_PRECISION: u32 = 10;

/// Precision of line and header totals (`NUMERIC(12, 2)`).
pub const TOTAL_MONEY_PRECISION: u32 = 12;

/// Default page size for transaction listings.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: u32 = 500;

/// A committed transaction header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Assigned by the primary on insert; increasing, never reused.
    pub transaction_id: i64,
    pub transaction_time: NaiveDateTime,
    pub cashier_id: i32,
    pub store_id: i32,
    pub payment_method: String,
    pub total_amount: Decimal,
    pub total_discount: Decimal,
    pub customer_id: Option<i32>,
    pub created_at: NaiveDateTime,
}

/// A committed line item. Owned by its transaction (cascade delete).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesItem {
    pub item_id: i64,
    pub transaction_id: i64,
    pub product_code: String,
    pub product_name: String,
    pub category: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount: Decimal,
    pub total_price: Decimal,
}

/// Header of a transaction that has not been written yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub transaction_time: NaiveDateTime,
    pub cashier_id: i32,
    pub store_id: i32,
    pub payment_method: String,
    pub total_amount: Decimal,
    pub total_discount: Decimal,
    pub customer_id: Option<i32>,
}

impl NewTransaction {
    /// Header with zero totals; set them with [`Self::with_total`] or
    /// derive them with [`Self::totals_from`].
    pub fn new(
        transaction_time: NaiveDateTime,
        cashier_id: i32,
        store_id: i32,
        payment_method: impl Into<String>,
    ) -> Self {
        Self {
            transaction_time,
            cashier_id,
            store_id,
            payment_method: payment_method.into(),
            total_amount: Decimal::ZERO,
            total_discount: Decimal::ZERO,
            customer_id: None,
        }
    }

    pub fn with_customer(mut self, customer_id: i32) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn with_discount(mut self, total_discount: Decimal) -> Self {
        self.total_discount = total_discount;
        self
    }

    pub fn with_total(mut self, total_amount: Decimal) -> Self {
        self.total_amount = total_amount;
        self
    }

    /// Set `total_amount` to the sum of the item totals minus the header
    /// discount, so the header satisfies the monetary rule by construction.
    /// Left unchanged if the sum overflows; validation rejects those items.
    pub fn totals_from(mut self, items: &[NewSalesItem]) -> Self {
        if let Some(total) = expected_total(items, self.total_discount) {
            self.total_amount = total;
        }
        self
    }
}

/// A line item that has not been written yet. `total_price` is always
/// derived, never supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSalesItem {
    pub product_code: String,
    pub product_name: String,
    pub category: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount: Decimal,
}

impl NewSalesItem {
    pub fn new(
        product_code: impl Into<String>,
        product_name: impl Into<String>,
        quantity: i32,
        unit_price: Decimal,
    ) -> Self {
        Self {
            product_code: product_code.into(),
            product_name: product_name.into(),
            category: None,
            quantity,
            unit_price,
            discount: Decimal::ZERO,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_discount(mut self, discount: Decimal) -> Self {
        self.discount = discount;
        self
    }

    /// `quantity × unit_price − discount`, or `None` on decimal overflow.
    pub fn total_price(&self) -> Option<Decimal> {
        Decimal::from(self.quantity)
            .checked_mul(self.unit_price)?
            .checked_sub(self.discount)
    }

    fn validate(&self, position: usize) -> Result<(), RouterError> {
        if self.product_code.trim().is_empty() || self.product_name.trim().is_empty() {
            return Err(RouterError::constraint(
                "sales_item_product_required",
                format!("item {position}: product code and name are required"),
            ));
        }
        if self.quantity <= 0 {
            return Err(RouterError::constraint(
                "sales_item_quantity_positive",
                format!("item {position}: quantity must be > 0, got {}", self.quantity),
            ));
        }
        if self.unit_price.is_sign_negative() {
            return Err(RouterError::constraint(
                "sales_item_unit_price_non_negative",
                format!("item {position}: unit price must be >= 0, got {}", self.unit_price),
            ));
        }
        if self.discount.is_sign_negative() {
            return Err(RouterError::constraint(
                "sales_item_discount_non_negative",
                format!("item {position}: discount must be >= 0, got {}", self.discount),
            ));
        }
        check_money(
            self.unit_price,
            ITEM_MONEY_PRECISION,
            "sales_item_unit_price_range",
            &format!("item {position}: unit price"),
        )?;
        check_money(
            self.discount,
            ITEM_MONEY_PRECISION,
            "sales_item_discount_range",
            &format!("item {position}: discount"),
        )?;
        let total_price = self.total_price().ok_or_else(|| {
            RouterError::constraint(
                "sales_item_total_price_range",
                format!(
                    "item {position}: {} x {} overflows",
                    self.quantity, self.unit_price
                ),
            )
        })?;
        if total_price.is_sign_negative() {
            return Err(RouterError::constraint(
                "sales_item_total_price_non_negative",
                format!(
                    "item {position}: discount {} exceeds {} x {}",
                    self.discount, self.quantity, self.unit_price
                ),
            ));
        }
        check_money(
            total_price,
            TOTAL_MONEY_PRECISION,
            "sales_item_total_price_range",
            &format!("item {position}: total price"),
        )
    }
}

/// Partial update of a transaction header. `None` leaves a column as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionPatch {
    pub transaction_time: Option<NaiveDateTime>,
    pub cashier_id: Option<i32>,
    pub store_id: Option<i32>,
    pub payment_method: Option<String>,
    pub total_amount: Option<Decimal>,
    pub total_discount: Option<Decimal>,
    /// `Some(None)` clears the customer.
    pub customer_id: Option<Option<i32>>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        self.transaction_time.is_none()
            && self.cashier_id.is_none()
            && self.store_id.is_none()
            && self.payment_method.is_none()
            && self.total_amount.is_none()
            && self.total_discount.is_none()
            && self.customer_id.is_none()
    }

    /// Sign, scale and range of the money columns the patch sets. The
    /// monetary rule itself needs the items and is checked by the writer.
    pub fn check_money(&self) -> Result<(), RouterError> {
        if let Some(discount) = self.total_discount {
            check_header_discount(discount)?;
        }
        if let Some(amount) = self.total_amount {
            check_header_amount(amount)?;
        }
        Ok(())
    }

    /// Whether applying the patch can change the monetary rule's outcome.
    pub fn touches_totals(&self) -> bool {
        self.total_amount.is_some() || self.total_discount.is_some()
    }

    pub fn apply_to(&self, current: &Transaction) -> Transaction {
        let mut next = current.clone();
        if let Some(ts) = self.transaction_time {
            next.transaction_time = ts;
        }
        if let Some(cashier) = self.cashier_id {
            next.cashier_id = cashier;
        }
        if let Some(store) = self.store_id {
            next.store_id = store;
        }
        if let Some(method) = &self.payment_method {
            next.payment_method = method.clone();
        }
        if let Some(amount) = self.total_amount {
            next.total_amount = amount;
        }
        if let Some(discount) = self.total_discount {
            next.total_discount = discount;
        }
        if let Some(customer) = self.customer_id {
            next.customer_id = customer;
        }
        next
    }
}

/// Half-open time window `[from, to)` over `transaction_time`.
/// Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    /// The `days` days up to `now`.
    pub fn last_days(days: u32, now: NaiveDateTime) -> Self {
        Self {
            from: Some(now - Duration::days(i64::from(days))),
            to: None,
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts < to)
    }
}

/// Listing filter. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub store_id: Option<i32>,
    pub cashier_id: Option<i32>,
    pub payment_method: Option<String>,
    pub range: DateRange,
}

impl TransactionFilter {
    pub fn matches(&self, txn: &Transaction) -> bool {
        self.store_id.map_or(true, |s| s == txn.store_id)
            && self.cashier_id.map_or(true, |c| c == txn.cashier_id)
            && self
                .payment_method
                .as_deref()
                .map_or(true, |m| m == txn.payment_method)
            && self.range.contains(txn.transaction_time)
    }
}

/// Keyset page request. `before` is the exclusive cursor: only ids lower
/// than it are returned, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub before: Option<i64>,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            before: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self {
            before: None,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn after_cursor(cursor: i64, limit: u32) -> Self {
        Self {
            before: Some(cursor),
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub(crate) fn normalized(self) -> Self {
        Self {
            before: self.before,
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass to [`PageRequest::after_cursor`] for the next page; `None` on
    /// the last page.
    pub next_cursor: Option<i64>,
}

/// Header plus the items currently visible alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetail {
    pub transaction: Transaction,
    pub items: Vec<SalesItem>,
}

impl TransactionDetail {
    /// On the replica, header and items are applied by the sink
    /// independently, so a detail read can see the header before all of its
    /// items (or stale items after a header update). Returns whether the
    /// visible rows satisfy the monetary rule.
    pub fn is_consistent(&self) -> bool {
        self.items
            .iter()
            .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.total_price))
            .and_then(|sum| sum.checked_sub(self.transaction.total_discount))
            .map_or(false, |expected| expected == self.transaction.total_amount)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesStats {
    pub total_transactions: i64,
    pub total_revenue: Decimal,
    pub total_items_sold: i64,
    pub average_transaction_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSales {
    pub product_name: String,
    pub total_quantity: i64,
    pub total_revenue: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySales {
    pub date: NaiveDate,
    pub total_amount: Decimal,
    pub transaction_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub range: DateRange,
    pub stats: SalesStats,
    pub top_products: Vec<ProductSales>,
    pub daily_trend: Vec<DailySales>,
}

/// What a connection reports about its endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub server_version: String,
    pub read_only: bool,
    pub tables_present: bool,
    /// `table:PRIVILEGE` pairs the connected user lacks for this role.
    pub missing_privileges: Vec<String>,
}

/// Result of pinging both endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub primary: bool,
    pub replica: bool,
}

/// Round to the storage scale.
pub fn money(value: Decimal) -> Decimal {
    value.round_dp(MONEY_SCALE)
}

/// Whether `value` is stored by `NUMERIC(precision, 2)` exactly: no
/// digits past the cents and no numeric field overflow.
pub fn fits_money_column(value: Decimal, precision: u32) -> bool {
    let bound = Decimal::from(10i64.pow(precision - MONEY_SCALE));
    value.normalize().scale() <= MONEY_SCALE && value.abs() < bound
}

fn check_money(
    value: Decimal,
    precision: u32,
    constraint: &str,
    what: &str,
) -> Result<(), RouterError> {
    if fits_money_column(value, precision) {
        return Ok(());
    }
    Err(RouterError::constraint(
        constraint,
        format!("{what} {value} does not fit NUMERIC({precision}, {MONEY_SCALE})"),
    ))
}

fn check_header_discount(total_discount: Decimal) -> Result<(), RouterError> {
    if total_discount.is_sign_negative() {
        return Err(RouterError::constraint(
            "sales_transaction_discount_non_negative",
            format!("total discount must be >= 0, got {total_discount}"),
        ));
    }
    check_money(
        total_discount,
        TOTAL_MONEY_PRECISION,
        "sales_transaction_total_discount_range",
        "total discount",
    )
}

fn check_header_amount(total_amount: Decimal) -> Result<(), RouterError> {
    check_money(
        total_amount,
        TOTAL_MONEY_PRECISION,
        "sales_transaction_total_amount_range",
        "total amount",
    )
}

/// Sum of the line totals, checked for overflow.
pub fn sum_item_totals(items: &[NewSalesItem]) -> Option<Decimal> {
    items.iter().try_fold(Decimal::ZERO, |sum, item| {
        sum.checked_add(item.total_price()?)
    })
}

fn expected_total(items: &[NewSalesItem], total_discount: Decimal) -> Option<Decimal> {
    sum_item_totals(items)?.checked_sub(total_discount)
}

/// Domain checks for a create: items are well formed and
/// `total_amount == Σ item.total_price − total_discount`.
pub fn validate_new_transaction(
    header: &NewTransaction,
    items: &[NewSalesItem],
) -> Result<(), RouterError> {
    if header.payment_method.trim().is_empty() {
        return Err(RouterError::constraint(
            "sales_transaction_payment_method_required",
            "payment method is required",
        ));
    }
    if items.is_empty() {
        return Err(RouterError::constraint(
            "sales_transaction_has_items",
            "a transaction needs at least one item",
        ));
    }
    for (position, item) in items.iter().enumerate() {
        item.validate(position)?;
    }
    check_header_totals(header.total_amount, header.total_discount, || {
        sum_item_totals(items)
    })
}

/// Monetary rule for a header against the sum of its item totals. Both
/// header amounts must already be at storage scale, so the comparison is
/// exact. `item_sum` yields `None` when the sum overflowed.
pub fn check_header_totals(
    total_amount: Decimal,
    total_discount: Decimal,
    item_sum: impl FnOnce() -> Option<Decimal>,
) -> Result<(), RouterError> {
    check_header_discount(total_discount)?;
    check_header_amount(total_amount)?;
    let overflow = || {
        RouterError::constraint(
            "sales_transaction_total_matches_items",
            "sum of item totals overflows",
        )
    };
    let item_sum = item_sum().ok_or_else(overflow)?;
    let expected = item_sum.checked_sub(total_discount).ok_or_else(overflow)?;
    if total_amount != expected {
        return Err(RouterError::constraint(
            "sales_transaction_total_matches_items",
            format!(
                "total_amount {total_amount} != items {item_sum} - discount {total_discount} = {expected}"
            ),
        ));
    }
    Ok(())
}

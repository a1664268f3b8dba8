// ABOUTME: In-memory primary/replica pair with a manually driven change-data-capture sink
// ABOUTME: Replication lag is whatever the caller makes it: nothing reaches the replica until replicate()

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::models::{
    money, DailySales, DateRange, EndpointInfo, NewSalesItem, NewTransaction, PageRequest,
    ProductSales, SalesItem, SalesStats, Transaction, TransactionFilter, TransactionPatch,
};
use crate::routing::Role;
use crate::store::{line_total, Connector, StoreConnection, StoreError};

/// A row-level change captured from the primary, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    UpsertTransaction(Transaction),
    UpsertItem(SalesItem),
    DeleteItem { item_id: i64 },
    DeleteTransaction { transaction_id: i64 },
}

#[derive(Debug, Clone, Default)]
struct Tables {
    transactions: BTreeMap<i64, Transaction>,
    items: BTreeMap<i64, SalesItem>,
}

impl Tables {
    fn item_ids_of(&self, transaction_id: i64) -> Vec<i64> {
        self.items
            .values()
            .filter(|i| i.transaction_id == transaction_id)
            .map(|i| i.item_id)
            .collect()
    }

    fn remove_items_of(&mut self, transaction_id: i64, changes: &mut Vec<Change>) -> u64 {
        let ids = self.item_ids_of(transaction_id);
        for item_id in &ids {
            self.items.remove(item_id);
            changes.push(Change::DeleteItem { item_id: *item_id });
        }
        ids.len() as u64
    }

    /// Sink semantics: upsert or delete by primary key, one table at a time.
    /// The replica has no foreign key, so items may arrive before or
    /// outlive their header.
    fn apply(&mut self, change: Change) {
        match change {
            Change::UpsertTransaction(txn) => {
                self.transactions.insert(txn.transaction_id, txn);
            }
            Change::UpsertItem(item) => {
                self.items.insert(item.item_id, item);
            }
            Change::DeleteItem { item_id } => {
                self.items.remove(&item_id);
            }
            Change::DeleteTransaction { transaction_id } => {
                self.transactions.remove(&transaction_id);
            }
        }
    }

    fn transactions_in(&self, range: &DateRange) -> Vec<&Transaction> {
        self.transactions
            .values()
            .filter(|t| range.contains(t.transaction_time))
            .collect()
    }
}

#[derive(Debug)]
enum StagedOp {
    Insert(Transaction),
    InsertItem(SalesItem),
    Update {
        transaction_id: i64,
        patch: TransactionPatch,
    },
    DeleteItems(i64),
    Delete(i64),
}

#[derive(Default)]
struct Faults {
    item_insert: Option<(usize, StoreError)>,
    item_insert_delay: Option<Duration>,
    commit: Option<StoreError>,
    commit_ack_delay: Option<Duration>,
    reads: VecDeque<StoreError>,
}

struct ClusterState {
    primary: Mutex<Tables>,
    replica: Mutex<Tables>,
    changelog: Mutex<VecDeque<Change>>,
    next_transaction_id: AtomicI64,
    next_item_id: AtomicI64,
    connect_failures: AtomicU32,
    connect_attempts: [AtomicU64; 2],
    faults: Mutex<Faults>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn role_index(role: Role) -> usize {
    match role {
        Role::Primary => 0,
        Role::Replica => 1,
    }
}

impl ClusterState {
    fn tables(&self, role: Role) -> MutexGuard<'_, Tables> {
        match role {
            Role::Primary => lock(&self.primary),
            Role::Replica => lock(&self.replica),
        }
    }
}

/// A primary and a replica that share nothing but the change log.
///
/// Commits on the primary append row-level changes to the log. Nothing is
/// visible on the replica until [`MemoryCluster::replicate`] applies them,
/// so tests decide exactly how far the replica lags.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterState>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterState {
                primary: Mutex::new(Tables::default()),
                replica: Mutex::new(Tables::default()),
                changelog: Mutex::new(VecDeque::new()),
                next_transaction_id: AtomicI64::new(1),
                next_item_id: AtomicI64::new(1),
                connect_failures: AtomicU32::new(0),
                connect_attempts: [AtomicU64::new(0), AtomicU64::new(0)],
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    pub fn connector(&self, role: Role) -> MemoryConnector {
        MemoryConnector {
            cluster: Arc::clone(&self.inner),
            role,
        }
    }

    /// Apply up to `max` pending changes to the replica, oldest first.
    /// Returns how many were applied.
    pub fn replicate(&self, max: usize) -> usize {
        let mut log = lock(&self.inner.changelog);
        let mut replica = lock(&self.inner.replica);
        let mut applied = 0;
        while applied < max {
            match log.pop_front() {
                Some(change) => {
                    replica.apply(change);
                    applied += 1;
                }
                None => break,
            }
        }
        applied
    }

    /// Let the replica catch up completely.
    pub fn replicate_all(&self) -> usize {
        self.replicate(usize::MAX)
    }

    pub fn pending_changes(&self) -> Vec<Change> {
        lock(&self.inner.changelog).iter().cloned().collect()
    }

    /// The next `count` connect attempts (either role) fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.connect_failures.store(count, Ordering::SeqCst);
    }

    /// After `skip` successful item inserts, the next one fails with `error`.
    pub fn fail_item_insert(&self, skip: usize, error: StoreError) {
        lock(&self.inner.faults).item_insert = Some((skip, error));
    }

    /// The next item insert stalls for `delay` before doing anything, like a
    /// statement stuck on a lock.
    pub fn delay_next_item_insert(&self, delay: Duration) {
        lock(&self.inner.faults).item_insert_delay = Some(delay);
    }

    /// The next commit is applied but its acknowledgement stalls for
    /// `delay`, so the caller cannot tell whether it landed.
    pub fn delay_next_commit_ack(&self, delay: Duration) {
        lock(&self.inner.faults).commit_ack_delay = Some(delay);
    }

    /// The next read statement (either role) fails with `error`. Queued
    /// faults fire in order, one per statement.
    pub fn fail_next_read(&self, error: StoreError) {
        lock(&self.inner.faults).reads.push_back(error);
    }

    /// The next commit fails with `error` and applies nothing.
    pub fn fail_next_commit(&self, error: StoreError) {
        lock(&self.inner.faults).commit = Some(error);
    }

    /// Connect calls made by connectors of `role`, including failed ones.
    pub fn connect_attempts(&self, role: Role) -> u64 {
        self.inner.connect_attempts[role_index(role)].load(Ordering::SeqCst)
    }

    pub fn transaction(&self, role: Role, transaction_id: i64) -> Option<Transaction> {
        self.inner
            .tables(role)
            .transactions
            .get(&transaction_id)
            .cloned()
    }

    pub fn items(&self, role: Role, transaction_id: i64) -> Vec<SalesItem> {
        self.inner
            .tables(role)
            .items
            .values()
            .filter(|i| i.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    pub fn transaction_count(&self, role: Role) -> usize {
        self.inner.tables(role).transactions.len()
    }

    pub fn item_count(&self, role: Role) -> usize {
        self.inner.tables(role).items.len()
    }

    /// Items whose header does not exist on `role`.
    pub fn orphaned_items(&self, role: Role) -> Vec<SalesItem> {
        let tables = self.inner.tables(role);
        tables
            .items
            .values()
            .filter(|i| !tables.transactions.contains_key(&i.transaction_id))
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    cluster: Arc<ClusterState>,
    role: Role,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn endpoint(&self) -> String {
        format!("memory://{}", self.role)
    }

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        self.cluster.connect_attempts[role_index(self.role)].fetch_add(1, Ordering::SeqCst);
        let failed = self
            .cluster
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Connect(format!(
                "injected connect failure for {}",
                self.endpoint()
            )));
        }
        Ok(MemoryConnection {
            cluster: Arc::clone(&self.cluster),
            role: self.role,
            unit: None,
            broken: false,
        })
    }
}

fn patched(current: &Transaction, patch: &TransactionPatch) -> Transaction {
    let mut next = patch.apply_to(current);
    next.total_amount = money(next.total_amount);
    next.total_discount = money(next.total_discount);
    next
}

struct Unit {
    view: Tables,
    ops: Vec<StagedOp>,
}

/// One session against the in-memory cluster. Writes are staged and become
/// visible on the primary, atomically, at commit.
///
/// A unit reads from a snapshot taken at BEGIN, not read committed like
/// the real primary. Updates keep their patch and re-apply it to the row
/// as committed at COMMIT, so concurrent units that set different columns
/// both land. An update whose header a concurrent unit deleted first
/// applies nothing, as a blocked UPDATE on the primary would.
pub struct MemoryConnection {
    cluster: Arc<ClusterState>,
    role: Role,
    unit: Option<Unit>,
    broken: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.broken {
            return Err(StoreError::Connection("connection closed".to_string()));
        }
        Ok(())
    }

    fn unit_mut(&mut self) -> Result<&mut Unit, StoreError> {
        self.check_open()?;
        if self.role == Role::Replica {
            return Err(StoreError::ReadOnly);
        }
        self.unit
            .as_mut()
            .ok_or_else(|| StoreError::Query("no transaction in progress".to_string()))
    }

    fn read<T>(&mut self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        self.check_open()?;
        let injected = lock(&self.cluster.faults).reads.pop_front();
        if let Some(err) = injected {
            return Err(self.fail(err));
        }
        match &self.unit {
            Some(unit) => Ok(f(&unit.view)),
            None => Ok(f(&*self.cluster.tables(self.role))),
        }
    }

    fn fail(&mut self, err: StoreError) -> StoreError {
        if err.is_connection_error() {
            self.broken = true;
            self.unit = None;
        }
        err
    }

    fn take_item_fault(&self) -> Option<StoreError> {
        let mut faults = lock(&self.cluster.faults);
        let fire = match faults.item_insert.as_mut() {
            Some((remaining, _)) if *remaining > 0 => {
                *remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if fire {
            faults.item_insert.take().map(|(_, err)| err)
        } else {
            None
        }
    }

    fn apply_commit(&self, ops: Vec<StagedOp>) -> Result<(), StoreError> {
        let mut primary = lock(&self.cluster.primary);
        let mut next = primary.clone();
        let mut changes = Vec::new();

        for op in ops {
            match op {
                StagedOp::Insert(txn) => {
                    changes.push(Change::UpsertTransaction(txn.clone()));
                    next.transactions.insert(txn.transaction_id, txn);
                }
                StagedOp::InsertItem(item) => {
                    if !next.transactions.contains_key(&item.transaction_id) {
                        return Err(fk_violation(item.transaction_id));
                    }
                    changes.push(Change::UpsertItem(item.clone()));
                    next.items.insert(item.item_id, item);
                }
                StagedOp::Update {
                    transaction_id,
                    patch,
                } => {
                    if let Some(current) = next.transactions.get(&transaction_id) {
                        let txn = patched(current, &patch);
                        changes.push(Change::UpsertTransaction(txn.clone()));
                        next.transactions.insert(transaction_id, txn);
                    }
                }
                StagedOp::DeleteItems(transaction_id) => {
                    next.remove_items_of(transaction_id, &mut changes);
                }
                StagedOp::Delete(transaction_id) => {
                    next.remove_items_of(transaction_id, &mut changes);
                    if next.transactions.remove(&transaction_id).is_some() {
                        changes.push(Change::DeleteTransaction { transaction_id });
                    }
                }
            }
        }

        *primary = next;
        lock(&self.cluster.changelog).extend(changes);
        Ok(())
    }
}

fn fk_violation(transaction_id: i64) -> StoreError {
    StoreError::Constraint {
        constraint: "sales_item_transaction_id_fkey".to_string(),
        message: format!("transaction {} does not exist", transaction_id),
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.check_open()
    }

    async fn describe(&mut self) -> Result<EndpointInfo, StoreError> {
        self.check_open()?;
        Ok(EndpointInfo {
            server_version: "memory".to_string(),
            read_only: self.role == Role::Replica,
            tables_present: true,
            missing_privileges: Vec::new(),
        })
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.role == Role::Replica {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.unit.is_some() {
            return Err(StoreError::Query("transaction already in progress".to_string()));
        }
        let view = self.cluster.tables(self.role).clone();
        self.unit = Some(Unit {
            view,
            ops: Vec::new(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        let unit = self
            .unit
            .take()
            .ok_or_else(|| StoreError::Query("no transaction in progress".to_string()))?;

        let injected = lock(&self.cluster.faults).commit.take();
        if let Some(err) = injected {
            return Err(self.fail(err));
        }
        if !unit.ops.is_empty() {
            self.apply_commit(unit.ops)?;
        }
        let ack_delay = lock(&self.cluster.faults).commit_ack_delay.take();
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        self.unit = None;
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        header: &NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let cluster = Arc::clone(&self.cluster);
        let unit = self.unit_mut()?;
        let txn = Transaction {
            transaction_id: cluster.next_transaction_id.fetch_add(1, Ordering::SeqCst),
            transaction_time: header.transaction_time,
            cashier_id: header.cashier_id,
            store_id: header.store_id,
            payment_method: header.payment_method.clone(),
            total_amount: money(header.total_amount),
            total_discount: money(header.total_discount),
            customer_id: header.customer_id,
            created_at: Utc::now().naive_utc(),
        };
        unit.view.transactions.insert(txn.transaction_id, txn.clone());
        unit.ops.push(StagedOp::Insert(txn.clone()));
        Ok(txn)
    }

    async fn insert_item(
        &mut self,
        transaction_id: i64,
        item: &NewSalesItem,
    ) -> Result<SalesItem, StoreError> {
        self.unit_mut()?;
        let delay = lock(&self.cluster.faults).item_insert_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.take_item_fault() {
            return Err(self.fail(err));
        }
        if item.quantity <= 0 {
            return Err(StoreError::Constraint {
                constraint: "sales_item_quantity_check".to_string(),
                message: format!("quantity {} is not positive", item.quantity),
            });
        }

        let total_price = line_total(item)?;
        let cluster = Arc::clone(&self.cluster);
        let unit = self.unit_mut()?;
        if !unit.view.transactions.contains_key(&transaction_id) {
            return Err(fk_violation(transaction_id));
        }
        let row = SalesItem {
            item_id: cluster.next_item_id.fetch_add(1, Ordering::SeqCst),
            transaction_id,
            product_code: item.product_code.clone(),
            product_name: item.product_name.clone(),
            category: item.category.clone(),
            quantity: item.quantity,
            unit_price: money(item.unit_price),
            discount: money(item.discount),
            total_price: money(total_price),
        };
        unit.view.items.insert(row.item_id, row.clone());
        unit.ops.push(StagedOp::InsertItem(row.clone()));
        Ok(row)
    }

    async fn update_transaction(
        &mut self,
        transaction_id: i64,
        patch: &TransactionPatch,
    ) -> Result<Option<Transaction>, StoreError> {
        let unit = self.unit_mut()?;
        let Some(current) = unit.view.transactions.get(&transaction_id) else {
            return Ok(None);
        };
        let next = patched(current, patch);
        unit.view.transactions.insert(transaction_id, next.clone());
        unit.ops.push(StagedOp::Update {
            transaction_id,
            patch: patch.clone(),
        });
        Ok(Some(next))
    }

    async fn delete_items(&mut self, transaction_id: i64) -> Result<u64, StoreError> {
        let unit = self.unit_mut()?;
        let deleted = unit.view.remove_items_of(transaction_id, &mut Vec::new());
        unit.ops.push(StagedOp::DeleteItems(transaction_id));
        Ok(deleted)
    }

    async fn delete_transaction(&mut self, transaction_id: i64) -> Result<u64, StoreError> {
        let unit = self.unit_mut()?;
        unit.view.remove_items_of(transaction_id, &mut Vec::new());
        let deleted = unit.view.transactions.remove(&transaction_id).is_some();
        unit.ops.push(StagedOp::Delete(transaction_id));
        Ok(u64::from(deleted))
    }

    async fn sum_item_totals(&mut self, transaction_id: i64) -> Result<Decimal, StoreError> {
        self.read(|t| {
            t.items
                .values()
                .filter(|i| i.transaction_id == transaction_id)
                .map(|i| i.total_price)
                .sum()
        })
    }

    async fn fetch_transactions(
        &mut self,
        filter: &TransactionFilter,
        page: &PageRequest,
    ) -> Result<Vec<Transaction>, StoreError> {
        let take = page.limit as usize + 1;
        self.read(|t| {
            t.transactions
                .values()
                .rev()
                .filter(|txn| page.before.map_or(true, |b| txn.transaction_id < b))
                .filter(|txn| filter.matches(txn))
                .take(take)
                .cloned()
                .collect()
        })
    }

    async fn fetch_transaction(
        &mut self,
        transaction_id: i64,
    ) -> Result<Option<Transaction>, StoreError> {
        self.read(|t| t.transactions.get(&transaction_id).cloned())
    }

    async fn fetch_items(&mut self, transaction_id: i64) -> Result<Vec<SalesItem>, StoreError> {
        self.read(|t| {
            t.items
                .values()
                .filter(|i| i.transaction_id == transaction_id)
                .cloned()
                .collect()
        })
    }

    async fn fetch_stats(&mut self, range: &DateRange) -> Result<SalesStats, StoreError> {
        self.read(|t| {
            let txns = t.transactions_in(range);
            let ids: HashSet<i64> = txns.iter().map(|x| x.transaction_id).collect();
            let total_revenue: Decimal = txns.iter().map(|x| x.total_amount).sum();
            let total_items_sold = t
                .items
                .values()
                .filter(|i| ids.contains(&i.transaction_id))
                .map(|i| i64::from(i.quantity))
                .sum();
            let count = txns.len() as i64;
            let average_transaction_value = if count > 0 {
                money(total_revenue / Decimal::from(count))
            } else {
                Decimal::ZERO
            };
            SalesStats {
                total_transactions: count,
                total_revenue,
                total_items_sold,
                average_transaction_value,
            }
        })
    }

    async fn fetch_top_products(
        &mut self,
        range: &DateRange,
        limit: u32,
    ) -> Result<Vec<ProductSales>, StoreError> {
        self.read(|t| {
            let ids: HashSet<i64> = t
                .transactions_in(range)
                .iter()
                .map(|x| x.transaction_id)
                .collect();
            let mut totals: HashMap<&str, (i64, Decimal)> = HashMap::new();
            for item in t.items.values().filter(|i| ids.contains(&i.transaction_id)) {
                let entry = totals
                    .entry(item.product_name.as_str())
                    .or_insert((0, Decimal::ZERO));
                entry.0 += i64::from(item.quantity);
                entry.1 += item.total_price;
            }
            let mut products: Vec<ProductSales> = totals
                .into_iter()
                .map(|(name, (qty, revenue))| ProductSales {
                    product_name: name.to_string(),
                    total_quantity: qty,
                    total_revenue: revenue,
                })
                .collect();
            products.sort_by(|a, b| {
                b.total_quantity
                    .cmp(&a.total_quantity)
                    .then_with(|| a.product_name.cmp(&b.product_name))
            });
            products.truncate(limit as usize);
            products
        })
    }

    async fn fetch_daily_trend(&mut self, range: &DateRange) -> Result<Vec<DailySales>, StoreError> {
        self.read(|t| {
            let mut days: BTreeMap<NaiveDate, (Decimal, i64)> = BTreeMap::new();
            for txn in t.transactions_in(range) {
                let entry = days
                    .entry(txn.transaction_time.date())
                    .or_insert((Decimal::ZERO, 0));
                entry.0 += txn.total_amount;
                entry.1 += 1;
            }
            days.into_iter()
                .map(|(date, (total_amount, transaction_count))| DailySales {
                    date,
                    total_amount,
                    transaction_count,
                })
                .collect()
        })
    }

    async fn transaction_exists(&mut self, transaction_id: i64) -> Result<bool, StoreError> {
        self.read(|t| t.transactions.contains_key(&transaction_id))
    }
}

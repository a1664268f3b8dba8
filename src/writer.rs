// ABOUTME: Transactional write executor: every mutation is one unit of work on the primary
// ABOUTME: Begin, header, items, commit; any failure rolls the whole unit back

use tokio::time::error::Elapsed;

use crate::config::WriteConfig;
use crate::error::RouterError;
use crate::models::{
    check_header_totals, validate_new_transaction, NewSalesItem, NewTransaction, Transaction,
    TransactionPatch,
};
use crate::pool::PooledConnection;
use crate::routing::{DualPool, Operation};
use crate::store::{Connector, StoreConnection, StoreError};

/// How far a unit of work got before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Begin,
    Statements,
    Commit,
}

/// Why a unit of work stopped early.
enum UnitError {
    /// The store rejected a statement.
    Store(StoreError),
    /// A domain check failed inside the unit.
    Rejected(RouterError),
}

impl From<StoreError> for UnitError {
    fn from(err: StoreError) -> Self {
        UnitError::Store(err)
    }
}

enum Settled<T> {
    Done(T),
    Retry(StoreError),
    Failed(RouterError),
}

/// Runs WRITE-tagged operations against the primary pool.
///
/// Each operation holds one primary connection for exactly one database
/// transaction at the primary's default (read committed) isolation. No
/// application-level locking is added; concurrent writers serialize on row
/// locks. A connection lost before COMMIT is retried up to
/// `transient_retries` times on a fresh connection. Constraint violations
/// and anything that happens during COMMIT are never retried.
pub struct TransactionWriter<'a, C: Connector> {
    pools: &'a DualPool<C>,
    config: &'a WriteConfig,
}

impl<'a, C: Connector> TransactionWriter<'a, C> {
    pub fn new(pools: &'a DualPool<C>, config: &'a WriteConfig) -> Self {
        Self { pools, config }
    }

    /// Insert a header and all of its items atomically. Returns the id the
    /// primary assigned.
    ///
    /// The monetary rule and item rules are checked before a connection is
    /// borrowed; a violation never reaches the database.
    pub async fn create_transaction(
        &self,
        header: &NewTransaction,
        items: &[NewSalesItem],
    ) -> Result<i64, RouterError> {
        let operation = Operation::CreateTransaction;
        validate_new_transaction(header, items)?;

        let mut attempt = 0;
        loop {
            let mut conn = self.pools.acquire_for(operation).await?;
            let mut stage = Stage::Begin;
            let outcome = tokio::time::timeout(
                self.config.statement_timeout(),
                create_unit(&mut conn, &mut stage, header, items),
            )
            .await;

            match self.settle(operation, &mut conn, stage, outcome, attempt).await {
                Settled::Done(transaction_id) => {
                    tracing::info!(
                        "Created transaction {} with {} item(s) on primary",
                        transaction_id,
                        items.len()
                    );
                    return Ok(transaction_id);
                }
                Settled::Retry(err) => attempt = self.next_attempt(operation, attempt, &err),
                Settled::Failed(err) => return Err(err),
            }
        }
    }

    /// Apply `patch` to the header of `transaction_id`.
    ///
    /// When the patch changes `total_amount` or `total_discount`, the
    /// monetary rule is re-checked against the committed items inside the
    /// same unit before COMMIT.
    pub async fn update_transaction(
        &self,
        transaction_id: i64,
        patch: &TransactionPatch,
    ) -> Result<Transaction, RouterError> {
        let operation = Operation::UpdateTransaction;
        if patch.is_empty() {
            return Err(RouterError::constraint(
                "sales_transaction_patch_not_empty",
                format!("update of transaction {transaction_id} sets no columns"),
            ));
        }
        patch.check_money()?;

        let mut attempt = 0;
        loop {
            let mut conn = self.pools.acquire_for(operation).await?;
            let mut stage = Stage::Begin;
            let outcome = tokio::time::timeout(
                self.config.statement_timeout(),
                update_unit(&mut conn, &mut stage, transaction_id, patch),
            )
            .await;

            match self.settle(operation, &mut conn, stage, outcome, attempt).await {
                Settled::Done(updated) => {
                    tracing::info!("Updated transaction {} on primary", transaction_id);
                    return Ok(updated);
                }
                Settled::Retry(err) => attempt = self.next_attempt(operation, attempt, &err),
                Settled::Failed(err) => return Err(err),
            }
        }
    }

    /// Delete a transaction and its items in one unit. Items are deleted
    /// explicitly before the header, so no orphan can remain even where the
    /// foreign key has no cascade.
    pub async fn delete_transaction(&self, transaction_id: i64) -> Result<(), RouterError> {
        let operation = Operation::DeleteTransaction;

        let mut attempt = 0;
        loop {
            let mut conn = self.pools.acquire_for(operation).await?;
            let mut stage = Stage::Begin;
            let outcome = tokio::time::timeout(
                self.config.statement_timeout(),
                delete_unit(&mut conn, &mut stage, transaction_id),
            )
            .await;

            match self.settle(operation, &mut conn, stage, outcome, attempt).await {
                Settled::Done(items) => {
                    tracing::info!(
                        "Deleted transaction {} and {} item(s) on primary",
                        transaction_id,
                        items
                    );
                    return Ok(());
                }
                Settled::Retry(err) => attempt = self.next_attempt(operation, attempt, &err),
                Settled::Failed(err) => return Err(err),
            }
        }
    }

    fn next_attempt(&self, operation: Operation, attempt: u32, err: &StoreError) -> u32 {
        tracing::warn!(
            "{} lost its primary connection before commit ({}); retrying on a fresh connection ({}/{})",
            operation,
            err,
            attempt + 1,
            self.config.transient_retries
        );
        attempt + 1
    }

    /// Decide what a finished (or abandoned) unit means for the caller.
    async fn settle<T>(
        &self,
        operation: Operation,
        conn: &mut PooledConnection<C>,
        stage: Stage,
        outcome: Result<Result<T, UnitError>, Elapsed>,
        attempt: u32,
    ) -> Settled<T> {
        match outcome {
            Ok(Ok(value)) => Settled::Done(value),
            Err(_) => {
                // The unit future was dropped mid-statement; the connection
                // state is unknown and closing it aborts the transaction.
                conn.mark_broken();
                let reason = format!(
                    "unit of work exceeded {:?}",
                    self.config.statement_timeout()
                );
                if stage == Stage::Commit {
                    tracing::error!("{} timed out during commit; outcome unknown", operation);
                    Settled::Failed(RouterError::CommitOutcomeUnknown { operation, reason })
                } else {
                    tracing::warn!("{} timed out before commit; rolled back", operation);
                    Settled::Failed(RouterError::PartialWriteAttempt { operation, reason })
                }
            }
            Ok(Err(UnitError::Store(err))) if err.is_connection_error() => {
                conn.mark_broken();
                if stage == Stage::Commit {
                    tracing::error!(
                        "{} lost its connection during commit; outcome unknown: {}",
                        operation,
                        err
                    );
                    Settled::Failed(RouterError::CommitOutcomeUnknown {
                        operation,
                        reason: err.to_string(),
                    })
                } else if attempt < self.config.transient_retries {
                    Settled::Retry(err)
                } else {
                    Settled::Failed(RouterError::from_write(operation, err))
                }
            }
            Ok(Err(err)) => {
                if conn.in_transaction() {
                    if let Err(rollback_err) = conn.rollback().await {
                        tracing::warn!(
                            "{}: rollback failed, connection discarded: {}",
                            operation,
                            rollback_err
                        );
                    }
                }
                let err = match err {
                    UnitError::Store(err) => RouterError::from_write(operation, err),
                    UnitError::Rejected(err) => err,
                };
                tracing::warn!("{} rolled back: {}", operation, err);
                Settled::Failed(err)
            }
        }
    }
}

async fn create_unit<C: Connector>(
    conn: &mut PooledConnection<C>,
    stage: &mut Stage,
    header: &NewTransaction,
    items: &[NewSalesItem],
) -> Result<i64, UnitError> {
    *stage = Stage::Begin;
    conn.begin().await?;

    *stage = Stage::Statements;
    let result = conn.insert_transaction(header).await;
    let txn = conn.observe(result)?;
    for item in items {
        let result = conn.insert_item(txn.transaction_id, item).await;
        conn.observe(result)?;
    }

    *stage = Stage::Commit;
    conn.commit().await?;
    Ok(txn.transaction_id)
}

async fn update_unit<C: Connector>(
    conn: &mut PooledConnection<C>,
    stage: &mut Stage,
    transaction_id: i64,
    patch: &TransactionPatch,
) -> Result<Transaction, UnitError> {
    *stage = Stage::Begin;
    conn.begin().await?;

    *stage = Stage::Statements;
    let result = conn.update_transaction(transaction_id, patch).await;
    let updated = conn
        .observe(result)?
        .ok_or(UnitError::Rejected(RouterError::NotFound { transaction_id }))?;

    if patch.touches_totals() {
        let result = conn.sum_item_totals(transaction_id).await;
        let item_sum = conn.observe(result)?;
        check_header_totals(updated.total_amount, updated.total_discount, || Some(item_sum))
            .map_err(UnitError::Rejected)?;
    }

    *stage = Stage::Commit;
    conn.commit().await?;
    Ok(updated)
}

async fn delete_unit<C: Connector>(
    conn: &mut PooledConnection<C>,
    stage: &mut Stage,
    transaction_id: i64,
) -> Result<u64, UnitError> {
    *stage = Stage::Begin;
    conn.begin().await?;

    *stage = Stage::Statements;
    let result = conn.delete_items(transaction_id).await;
    let items = conn.observe(result)?;
    let result = conn.delete_transaction(transaction_id).await;
    if conn.observe(result)? == 0 {
        return Err(UnitError::Rejected(RouterError::NotFound { transaction_id }));
    }

    *stage = Stage::Commit;
    conn.commit().await?;
    Ok(items)
}

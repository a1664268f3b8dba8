// ABOUTME: Connection pool for a single endpoint role with scoped, guaranteed-release handles
// ABOUTME: Lazy warm-up, bounded acquire wait, connect backoff and discard of poisoned connections

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::error::RouterError;
use crate::routing::{Operation, Role};
use crate::store::{Connector, StoreConnection, StoreError};
use crate::utils::retry_with_backoff;

const DEREF_ERR: &str = "PooledConnection used after release";

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub role: Role,
    pub max_size: u32,
    pub idle: usize,
    pub in_use: usize,
    /// Successful acquires since the pool was opened.
    pub acquired: u64,
    /// Physical connections opened.
    pub created: u64,
    /// Connections dropped instead of being returned.
    pub discarded: u64,
}

struct PoolInner<C: Connector> {
    role: Role,
    connector: C,
    config: PoolConfig,
    idle: Mutex<Vec<C::Connection>>,
    permits: Arc<Semaphore>,
    warmed: OnceCell<()>,
    closed: AtomicBool,
    acquired: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn idle(&self) -> MutexGuard<'_, Vec<C::Connection>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open_connection(&self) -> Result<C::Connection, RouterError> {
        let attempts = self.config.connect_attempts.max(1);
        let conn = retry_with_backoff(
            || self.connector.connect(),
            attempts - 1,
            self.config.connect_backoff(),
        )
        .await
        .map_err(|e| {
            tracing::error!(
                "Failed to connect to {} endpoint {} after {} attempt(s): {}",
                self.role,
                self.connector.endpoint(),
                attempts,
                e
            );
            RouterError::ConnectFailed {
                role: self.role,
                attempts,
                reason: e.to_string(),
            }
        })?;
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Opened {} connection to {}", self.role, self.connector.endpoint());
        Ok(conn)
    }

    /// Establish `min_size` idle connections. Fails only when none could be
    /// opened, leaving the pool cold so the next acquire warms it again. A
    /// partial warm-up is logged and counts as done.
    async fn warm_up(&self) -> Result<(), RouterError> {
        let wanted = self.config.min_size as usize;
        let mut opened = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            match self.open_connection().await {
                Ok(conn) => opened.push(conn),
                Err(e) if opened.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!("{} pool warm-up stopped early: {}", self.role, e);
                    break;
                }
            }
        }
        tracing::info!(
            "{} pool warmed with {}/{} connection(s) to {}",
            self.role,
            opened.len(),
            wanted,
            self.connector.endpoint()
        );
        self.idle().extend(opened);
        Ok(())
    }

    fn release(&self, conn: C::Connection, discard: bool) {
        if discard || self.closed.load(Ordering::Acquire) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            drop(conn);
        } else {
            self.idle().push(conn);
        }
    }
}

/// Pool of physical connections to one endpoint.
///
/// At most `max_size` handles are out at once; further acquires wait up to
/// `acquire_timeout` and then fail with `PoolExhausted`. Handles return their
/// connection on drop, on every exit path. A handle that saw a connection
/// error, or that is dropped with a transaction still open, discards its
/// connection instead.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Pool<C> {
    pub fn new(role: Role, connector: C, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size as usize));
        Self {
            inner: Arc::new(PoolInner {
                role,
                connector,
                config,
                idle: Mutex::new(Vec::new()),
                permits,
                warmed: OnceCell::new(),
                closed: AtomicBool::new(false),
                acquired: AtomicU64::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Borrow a connection for `operation`.
    ///
    /// Rejects operations whose tag maps to the other role with
    /// `MisroutedOperation`; that is a programming error and is logged as one.
    pub async fn acquire_for(&self, operation: Operation) -> Result<PooledConnection<C>, RouterError> {
        if operation.role() != self.inner.role {
            tracing::error!(
                "BUG: {} operation {} reached the {} pool",
                operation.kind(),
                operation,
                self.inner.role
            );
            return Err(RouterError::MisroutedOperation {
                operation,
                kind: operation.kind(),
                role: self.inner.role,
            });
        }
        self.acquire(operation).await
    }

    async fn acquire(&self, operation: Operation) -> Result<PooledConnection<C>, RouterError> {
        let inner = &self.inner;
        let role = inner.role;
        if inner.closed.load(Ordering::Acquire) {
            return Err(RouterError::PoolClosed { role });
        }

        let timeout = inner.config.acquire_timeout();
        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, Arc::clone(&inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RouterError::PoolClosed { role }),
            Err(_) => {
                tracing::warn!(
                    "{} pool exhausted: {} waited {:?} with {} connection(s) in use",
                    role,
                    operation,
                    timeout,
                    inner.config.max_size
                );
                return Err(RouterError::PoolExhausted { role, timeout });
            }
        };

        inner.warmed.get_or_try_init(|| inner.warm_up()).await?;

        let reused = inner.idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => inner.open_connection().await?,
        };

        inner.acquired.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "{} acquired {} connection in {:?}",
            operation,
            role,
            started.elapsed()
        );

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(inner),
            _permit: permit,
            broken: false,
            in_transaction: false,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let max = inner.config.max_size as usize;
        let in_use = if inner.closed.load(Ordering::Acquire) {
            0
        } else {
            max.saturating_sub(inner.permits.available_permits())
        };
        PoolStats {
            role: inner.role,
            max_size: inner.config.max_size,
            idle: inner.idle().len(),
            in_use,
            acquired: inner.acquired.load(Ordering::Relaxed),
            created: inner.created.load(Ordering::Relaxed),
            discarded: inner.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop handing out connections and drop every idle one. Handles still
    /// out are discarded when they are released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.idle().drain(..).collect();
        tracing::info!(
            "Closed {} pool ({} idle connection(s) dropped)",
            self.inner.role,
            drained.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Scoped, non-shareable connection borrowed from a [`Pool`].
///
/// Derefs to the underlying connection. `begin`/`commit`/`rollback` go
/// through the handle so it knows whether a transaction is open when it is
/// dropped.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
    broken: bool,
    in_transaction: bool,
}

impl<C: Connector> PooledConnection<C> {
    pub fn role(&self) -> Role {
        self.pool.role
    }

    /// Do not return this connection to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Record the outcome of a statement: connection-level errors poison
    /// the handle.
    pub fn observe<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            if e.is_connection_error() {
                self.broken = true;
            }
        }
        result
    }

    pub async fn begin(&mut self) -> Result<(), StoreError> {
        let result = self.conn_mut().begin().await;
        let result = self.observe(result);
        if result.is_ok() {
            self.in_transaction = true;
        }
        result
    }

    pub async fn commit(&mut self) -> Result<(), StoreError> {
        let result = self.conn_mut().commit().await;
        // Whatever the outcome, the server no longer has this transaction open
        // unless the connection itself broke, which discards it anyway.
        self.in_transaction = false;
        self.observe(result)
    }

    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        let result = self.conn_mut().rollback().await;
        match result {
            Ok(()) => {
                self.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Rollback failed on {} connection, discarding it: {}", self.pool.role, e);
                self.broken = true;
                Err(e)
            }
        }
    }

    fn conn_mut(&mut self) -> &mut C::Connection {
        self.conn.as_mut().expect(DEREF_ERR)
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(DEREF_ERR)
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn_mut()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_transaction {
            // Dropped mid-unit (cancellation or timeout). Closing the
            // connection makes the server abort the transaction.
            tracing::warn!(
                "{} connection released with an open transaction; discarding so it is rolled back",
                self.pool.role
            );
        } else if self.broken {
            tracing::warn!("Discarding broken {} connection", self.pool.role);
        }
        self.pool.release(conn, self.broken || self.in_transaction);
    }
}

/// Trivial liveness helper used by health checks.
pub(crate) async fn ping<C: Connector>(conn: &mut PooledConnection<C>) -> Result<(), StoreError> {
    let result = conn.ping().await;
    conn.observe(result)
}

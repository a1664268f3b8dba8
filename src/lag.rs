// ABOUTME: Replication lag observer: probes the replica for a transaction id
// ABOUTME: Non-blocking by default; callers pick the polling interval and give-up policy

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ReadConfig;
use crate::error::RouterError;
use crate::reader::on_replica;
use crate::routing::{DualPool, Operation};
use crate::store::{Connector, StoreConnection};

/// What the caller is waiting for on the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    /// A created transaction has arrived.
    Present,
    /// A deleted transaction is gone.
    Absent,
}

impl Expectation {
    fn is_met(self, visible: bool) -> bool {
        match self {
            Expectation::Present => visible,
            Expectation::Absent => !visible,
        }
    }
}

/// How often and how long [`LagObserver::wait_until`] probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Probes before giving up. At least one probe is always made.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            max_attempts: 40,
        }
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisibilityReport {
    pub transaction_id: i64,
    pub expectation: Expectation,
    pub reached: bool,
    pub attempts: u32,
    pub waited_ms: u128,
}

/// Tells callers whether the replica has caught up with a write.
pub struct LagObserver<'a, C: Connector> {
    pools: &'a DualPool<C>,
    config: &'a ReadConfig,
}

impl<'a, C: Connector> LagObserver<'a, C> {
    pub fn new(pools: &'a DualPool<C>, config: &'a ReadConfig) -> Self {
        Self { pools, config }
    }

    /// One probe: does the replica currently have a header for
    /// `transaction_id`? Only the header is checked; its items may still be
    /// in flight.
    pub async fn is_visible(&self, transaction_id: i64) -> Result<bool, RouterError> {
        on_replica!(self, Operation::ProbeVisibility, |conn| {
            conn.transaction_exists(transaction_id).await
        })
    }

    /// Probe until `expectation` holds or `policy` is exhausted. Giving up is
    /// reported in the result, not as an error.
    pub async fn wait_until(
        &self,
        transaction_id: i64,
        expectation: Expectation,
        policy: PollPolicy,
    ) -> Result<VisibilityReport, RouterError> {
        let started = Instant::now();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0;
        let mut reached = false;

        while attempts < max_attempts {
            attempts += 1;
            if expectation.is_met(self.is_visible(transaction_id).await?) {
                reached = true;
                break;
            }
            if attempts < max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }

        let report = VisibilityReport {
            transaction_id,
            expectation,
            reached,
            attempts,
            waited_ms: started.elapsed().as_millis(),
        };
        if reached {
            tracing::debug!(
                "Transaction {} {:?} on replica after {} probe(s), {}ms",
                transaction_id,
                expectation,
                attempts,
                report.waited_ms
            );
        } else {
            tracing::warn!(
                "Gave up waiting for transaction {} to be {:?} on replica after {} probe(s)",
                transaction_id,
                expectation,
                attempts
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::memory::{MemoryCluster, MemoryConnector};
    use crate::routing::Role;

    fn pools(cluster: &MemoryCluster, config: &RouterConfig) -> DualPool<MemoryConnector> {
        DualPool::new(
            cluster.connector(Role::Primary),
            cluster.connector(Role::Replica),
            config,
        )
    }

    #[tokio::test]
    async fn test_gives_up_without_error() {
        let cluster = MemoryCluster::new();
        let config = RouterConfig::default();
        let pools = pools(&cluster, &config);
        let lag = LagObserver::new(&pools, &config.read);

        let report = lag
            .wait_until(
                99,
                Expectation::Present,
                PollPolicy {
                    interval: Duration::from_millis(1),
                    max_attempts: 3,
                },
            )
            .await
            .unwrap();
        assert!(!report.reached);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_absent_met_immediately_for_unknown_id() {
        let cluster = MemoryCluster::new();
        let config = RouterConfig::default();
        let pools = pools(&cluster, &config);
        let lag = LagObserver::new(&pools, &config.read);

        let report = lag
            .wait_until(5, Expectation::Absent, PollPolicy::default())
            .await
            .unwrap();
        assert!(report.reached);
        assert_eq!(report.attempts, 1);
        assert_eq!(pools.stats(Role::Primary).acquired, 0);
    }
}

// ABOUTME: Static operation tagging and the dual-pool router
// ABOUTME: Every operation is WRITE or READ at definition time; no SQL inspection

use serde::Serialize;
use std::fmt;

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::pool::{Pool, PoolStats, PooledConnection};
use crate::store::Connector;

/// Which physical endpoint a pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Write,
    Read,
}

impl OperationKind {
    /// Total mapping from tag to endpoint.
    pub const fn role(self) -> Role {
        match self {
            OperationKind::Write => Role::Primary,
            OperationKind::Read => Role::Replica,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Write => write!(f, "WRITE"),
            OperationKind::Read => write!(f, "READ"),
        }
    }
}

/// Every public operation of the access layer.
///
/// The endpoint is decided by the tag alone. Liveness probes carry the tag
/// of the endpoint they probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateTransaction,
    UpdateTransaction,
    DeleteTransaction,
    ApplySchema,
    CheckPrimary,
    ListTransactions,
    GetTransaction,
    ListItems,
    SalesStats,
    TopProducts,
    SalesTrend,
    Analytics,
    ProbeVisibility,
    CheckReplica,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Operation::CreateTransaction,
        Operation::UpdateTransaction,
        Operation::DeleteTransaction,
        Operation::ApplySchema,
        Operation::CheckPrimary,
        Operation::ListTransactions,
        Operation::GetTransaction,
        Operation::ListItems,
        Operation::SalesStats,
        Operation::TopProducts,
        Operation::SalesTrend,
        Operation::Analytics,
        Operation::ProbeVisibility,
        Operation::CheckReplica,
    ];

    pub const fn kind(self) -> OperationKind {
        match self {
            Operation::CreateTransaction
            | Operation::UpdateTransaction
            | Operation::DeleteTransaction
            | Operation::ApplySchema
            | Operation::CheckPrimary => OperationKind::Write,
            Operation::ListTransactions
            | Operation::GetTransaction
            | Operation::ListItems
            | Operation::SalesStats
            | Operation::TopProducts
            | Operation::SalesTrend
            | Operation::Analytics
            | Operation::ProbeVisibility
            | Operation::CheckReplica => OperationKind::Read,
        }
    }

    pub const fn role(self) -> Role {
        self.kind().role()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::CreateTransaction => "create_transaction",
            Operation::UpdateTransaction => "update_transaction",
            Operation::DeleteTransaction => "delete_transaction",
            Operation::ApplySchema => "apply_schema",
            Operation::CheckPrimary => "check_primary",
            Operation::ListTransactions => "list_transactions",
            Operation::GetTransaction => "get_transaction",
            Operation::ListItems => "list_items",
            Operation::SalesStats => "sales_stats",
            Operation::TopProducts => "top_products",
            Operation::SalesTrend => "sales_trend",
            Operation::Analytics => "analytics",
            Operation::ProbeVisibility => "probe_visibility",
            Operation::CheckReplica => "check_replica",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two independently sized pools, keyed by role.
pub struct DualPool<C: Connector> {
    primary: Pool<C>,
    replica: Pool<C>,
}

impl<C: Connector> DualPool<C> {
    pub fn new(primary_connector: C, replica_connector: C, config: &RouterConfig) -> Self {
        Self {
            primary: Pool::new(Role::Primary, primary_connector, config.primary.pool.clone()),
            replica: Pool::new(Role::Replica, replica_connector, config.replica.pool.clone()),
        }
    }

    pub fn pool(&self, role: Role) -> &Pool<C> {
        match role {
            Role::Primary => &self.primary,
            Role::Replica => &self.replica,
        }
    }

    /// Borrow a connection from the pool the operation's tag maps to.
    pub async fn acquire_for(&self, operation: Operation) -> Result<PooledConnection<C>, RouterError> {
        self.pool(operation.role()).acquire_for(operation).await
    }

    pub fn stats(&self, role: Role) -> PoolStats {
        self.pool(role).stats()
    }

    pub fn close(&self) {
        self.primary.close();
        self.replica.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_table_is_total_and_fixed() {
        let writes: Vec<_> = Operation::ALL
            .iter()
            .filter(|op| op.kind() == OperationKind::Write)
            .collect();
        assert_eq!(writes.len(), 5);

        for op in Operation::ALL {
            match op.kind() {
                OperationKind::Write => assert_eq!(op.role(), Role::Primary, "{op}"),
                OperationKind::Read => assert_eq!(op.role(), Role::Replica, "{op}"),
            }
        }
    }

    #[test]
    fn test_mutations_route_to_primary() {
        assert_eq!(Operation::CreateTransaction.role(), Role::Primary);
        assert_eq!(Operation::UpdateTransaction.role(), Role::Primary);
        assert_eq!(Operation::DeleteTransaction.role(), Role::Primary);
        assert_eq!(Operation::ListTransactions.role(), Role::Replica);
        assert_eq!(Operation::ProbeVisibility.role(), Role::Replica);
    }

    #[test]
    fn test_display() {
        assert_eq!(Role::Replica.to_string(), "replica");
        assert_eq!(OperationKind::Write.to_string(), "WRITE");
        assert_eq!(Operation::Analytics.to_string(), "analytics");
    }
}

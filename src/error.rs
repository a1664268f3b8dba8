// ABOUTME: Caller-facing error taxonomy for the routed dual-store layer
// ABOUTME: Storage errors are folded into these kinds at the executor boundary

use std::time::Duration;

use thiserror::Error;

use crate::routing::{Operation, OperationKind, Role};
use crate::store::StoreError;

/// Errors surfaced by the pool manager, router and executors.
///
/// Nothing below the executors (driver errors, SQLSTATE codes) is exposed
/// directly; it is wrapped into one of these kinds first.
///
/// A read that returns fewer or older rows than a just-committed write is
/// *not* an error. Replica visibility lags the primary by an unbounded
/// interval, so such a result is the expected stale-read window; use
/// [`crate::lag::LagObserver`] to find out when a write has become visible.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Transport or authentication failure while opening a physical
    /// connection, after the bounded backoff was exhausted.
    #[error("failed to connect to {role} endpoint after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        role: Role,
        attempts: u32,
        reason: String,
    },

    /// No connection became available within the acquire timeout.
    /// Never retried by the layer; callers should back off.
    #[error("{role} pool exhausted: no connection available within {timeout:?}")]
    PoolExhausted { role: Role, timeout: Duration },

    /// The pool was closed before or during the acquire.
    #[error("{role} pool is closed")]
    PoolClosed { role: Role },

    /// A WRITE-tagged operation reached the replica pool or a READ-tagged
    /// operation reached the primary pool. Indicates a programming error.
    #[error("misrouted operation: {operation} is tagged {kind} and cannot run on the {role} pool")]
    MisroutedOperation {
        operation: Operation,
        kind: OperationKind,
        role: Role,
    },

    /// A storage or domain constraint rejected the write. The unit of work
    /// was rolled back; not retried.
    #[error("constraint violation ({constraint}): {detail}")]
    ConstraintViolation { constraint: String, detail: String },

    /// A multi-statement write failed part way. The whole unit was rolled
    /// back, so nothing from it is visible.
    #[error("{operation} failed and was rolled back: {reason}")]
    PartialWriteAttempt { operation: Operation, reason: String },

    /// The connection was lost while COMMIT was in flight; the primary may or
    /// may not have applied the unit. Never retried.
    #[error("{operation}: connection lost during commit, outcome unknown: {reason}")]
    CommitOutcomeUnknown { operation: Operation, reason: String },

    /// The targeted transaction does not exist on the primary.
    #[error("transaction {transaction_id} not found on primary")]
    NotFound { transaction_id: i64 },

    /// A read-only query (replica read or endpoint probe) failed.
    #[error("{operation} query failed: {reason}")]
    ReadFailed { operation: Operation, reason: String },
}

impl RouterError {
    /// Build a domain-level constraint violation (checked before commit).
    pub fn constraint(constraint: impl Into<String>, detail: impl Into<String>) -> Self {
        RouterError::ConstraintViolation {
            constraint: constraint.into(),
            detail: detail.into(),
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouterError::ConnectFailed { .. }
                | RouterError::PoolExhausted { .. }
                | RouterError::ReadFailed { .. }
        )
    }

    /// Wrap a storage error raised while a write unit was open.
    ///
    /// Constraint errors keep their identity; everything else becomes a
    /// single logical `PartialWriteAttempt` for the whole unit.
    pub(crate) fn from_write(operation: Operation, err: StoreError) -> Self {
        match err {
            StoreError::Constraint {
                constraint,
                message,
            } => RouterError::ConstraintViolation {
                constraint,
                detail: message,
            },
            other => RouterError::PartialWriteAttempt {
                operation,
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn from_read(operation: Operation, err: StoreError) -> Self {
        RouterError::ReadFailed {
            operation,
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_store_error_keeps_identity() {
        let err = RouterError::from_write(
            Operation::CreateTransaction,
            StoreError::Constraint {
                constraint: "sales_item_transaction_id_fkey".to_string(),
                message: "violates foreign key".to_string(),
            },
        );
        match err {
            RouterError::ConstraintViolation { constraint, .. } => {
                assert_eq!(constraint, "sales_item_transaction_id_fkey")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_other_store_errors_become_single_partial_write() {
        let err = RouterError::from_write(
            Operation::CreateTransaction,
            StoreError::Query("syntax error".to_string()),
        );
        assert!(matches!(
            err,
            RouterError::PartialWriteAttempt {
                operation: Operation::CreateTransaction,
                ..
            }
        ));
        assert!(err.to_string().contains("rolled back"));
    }

    #[test]
    fn test_transient_classification() {
        let exhausted = RouterError::PoolExhausted {
            role: Role::Replica,
            timeout: Duration::from_millis(10),
        };
        assert!(exhausted.is_transient());
        assert!(!RouterError::constraint("x", "y").is_transient());
        assert!(!RouterError::NotFound { transaction_id: 7 }.is_transient());
    }
}

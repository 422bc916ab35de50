use std::time::Duration;

use thiserror::Error;

use stockledger_core::{VariantId, WarehouseId};
use stockledger_inventory::{ReservationId, StockError, StockId};

use crate::lock::LockError;
use crate::repository::RepositoryError;

/// Failure of a `StockLedger` operation.
///
/// Business-rule failures come through unchanged as `Stock(..)`. Concurrency
/// failures (`Conflict`, `LockTimeout`) are transient: the ledger has already
/// retried them with backoff, and the caller may retry the whole call again.
/// In every case nothing was committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(transparent)]
    Stock(#[from] StockError),

    #[error("stock {0} not found")]
    StockNotFound(StockId),

    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),

    #[error("stock {0} already exists")]
    StockExists(StockId),

    #[error("stock already exists for variant {variant_id} in warehouse {warehouse_id}")]
    AlreadyExists {
        variant_id: VariantId,
        warehouse_id: WarehouseId,
    },

    /// Another writer committed first (version mismatch on save).
    #[error("concurrent modification of stock {stock_id}")]
    Conflict { stock_id: StockId },

    #[error("timed out after {waited:?} waiting for stock {stock_id}")]
    LockTimeout { stock_id: StockId, waited: Duration },

    #[error("lock failure: {0}")]
    Lock(LockError),

    #[error("repository failure: {0}")]
    Repository(RepositoryError),
}

impl LedgerError {
    /// Transient concurrency failure; retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. } | LedgerError::LockTimeout { .. })
    }
}

impl From<RepositoryError> for LedgerError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Concurrency { stock_id, .. } => LedgerError::Conflict { stock_id },
            RepositoryError::Duplicate {
                variant_id,
                warehouse_id,
            } => LedgerError::AlreadyExists {
                variant_id,
                warehouse_id,
            },
            other => LedgerError::Repository(other),
        }
    }
}

impl From<LockError> for LedgerError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Timeout { stock_id, waited } => LedgerError::LockTimeout { stock_id, waited },
            other => LedgerError::Lock(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::ExpectedVersion;

    #[test]
    fn concurrency_failures_are_retryable() {
        let stock_id = StockId::generate();

        let conflict: LedgerError = RepositoryError::Concurrency {
            stock_id,
            expected: ExpectedVersion::Exact(3),
            actual: Some(4),
        }
        .into();
        assert_eq!(conflict, LedgerError::Conflict { stock_id });
        assert!(conflict.is_retryable());

        let timeout: LedgerError = LockError::Timeout {
            stock_id,
            waited: Duration::from_millis(5),
        }
        .into();
        assert!(timeout.is_retryable());
    }

    #[test]
    fn business_and_storage_failures_are_not_retryable() {
        let stock_error = StockError::InsufficientStock {
            stock_id: StockId::generate(),
            requested: 10,
            available: 5,
        };
        let insufficient = LedgerError::from(stock_error.clone());
        assert!(!insufficient.is_retryable());
        assert_eq!(insufficient.to_string(), stock_error.to_string());

        let storage: LedgerError = RepositoryError::Storage("disk full".into()).into();
        assert!(!storage.is_retryable());
        assert!(!LedgerError::ReservationNotFound(ReservationId::new()).is_retryable());
    }
}

//! Infrastructure layer: persistence, locking, the ledger service and its
//! background workers.

pub mod config;
pub mod ledger;
pub mod lock;
pub mod repository;
pub mod retry;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, LedgerConfig, SweeperConfig};
pub use ledger::{EXPIRED_REASON, LedgerError, StockLedger};
pub use lock::{LockError, StockLockGuard, StockLocks};
pub use repository::{InMemoryStockRepository, OutboxRecord, RepositoryError, StockRepository};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use workers::{ReservationSweeper, SweepReport, SweeperHandle};

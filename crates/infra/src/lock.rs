//! Per-stock exclusive locks with a bounded wait.
//!
//! One lock per stock id, created lazily. Holding a lock serializes the whole
//! load → mutate → save cycle for that stock inside this process; different
//! stock ids never contend.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use stockledger_inventory::StockId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock stayed held by someone else for the whole wait.
    #[error("timed out after {waited:?} waiting for lock on stock {stock_id}")]
    Timeout { stock_id: StockId, waited: Duration },

    #[error("lock state poisoned: {0}")]
    Poisoned(String),
}

/// A single lock backed by `Mutex<bool>` + `Condvar`.
#[derive(Debug, Default)]
struct StockLock {
    held: Mutex<bool>,
    wake: Condvar,
}

impl StockLock {
    fn acquire(&self, stock_id: StockId, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        let mut held = self
            .held
            .lock()
            .map_err(|e| LockError::Poisoned(e.to_string()))?;

        while *held {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    stock_id,
                    waited: timeout,
                });
            }
            let (guard, _) = self
                .wake
                .wait_timeout(held, deadline - now)
                .map_err(|e| LockError::Poisoned(e.to_string()))?;
            held = guard;
        }

        *held = true;
        Ok(())
    }

    fn release(&self) {
        // A poisoned mutex still carries the flag; clear it either way.
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *held = false;
        self.wake.notify_one();
    }
}

/// Registry of per-stock locks.
#[derive(Debug, Default)]
pub struct StockLocks {
    locks: Mutex<HashMap<StockId, Arc<StockLock>>>,
}

impl StockLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `stock_id`.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire(&self, stock_id: StockId, timeout: Duration) -> Result<StockLockGuard, LockError> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| LockError::Poisoned("lock registry poisoned".into()))?;
            locks.entry(stock_id).or_default().clone()
        };

        lock.acquire(stock_id, timeout)?;
        Ok(StockLockGuard { stock_id, lock })
    }
}

/// Exclusive access to one stock until dropped.
#[derive(Debug)]
pub struct StockLockGuard {
    stock_id: StockId,
    lock: Arc<StockLock>,
}

impl StockLockGuard {
    pub fn stock_id(&self) -> StockId {
        self.stock_id
    }
}

impl Drop for StockLockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

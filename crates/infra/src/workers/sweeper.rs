//! Reservation expiry sweeper.
//!
//! Periodically releases `PENDING` reservations whose `expires_at` has been
//! reached, returning their units to available stock. Each release goes through
//! the ledger (locks, version check, outbox), so the sweep can race with user
//! commands and with other sweeper instances: the release is idempotent and
//! only one of them takes effect.

use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use stockledger_events::{EventBus, EventEnvelope};
use stockledger_inventory::StockEvent;

use crate::config::SweeperConfig;
use crate::ledger::{EXPIRED_REASON, LedgerError, StockLedger};
use crate::repository::StockRepository;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired pending reservations returned by the repository.
    pub found: usize,
    /// Reservations this sweep moved to `EXPIRED`.
    pub expired: usize,
    /// Reservations someone else settled first (no-op release).
    pub already_settled: usize,
    /// Reservations whose release failed; retried on the next sweep.
    pub failed: usize,
}

/// Handle to stop and join a spawned sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request shutdown and wait for the current sweep (if any) to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

pub struct ReservationSweeper<R, B> {
    ledger: Arc<StockLedger<R, B>>,
    config: SweeperConfig,
}

impl<R, B> ReservationSweeper<R, B>
where
    R: StockRepository + 'static,
    B: EventBus<EventEnvelope<StockEvent>> + 'static,
{
    pub fn new(ledger: Arc<StockLedger<R, B>>, config: SweeperConfig) -> Self {
        Self { ledger, config }
    }

    /// Release up to `batch_size` reservations expired as of `now`.
    ///
    /// A failure on one reservation is logged and counted; the sweep moves on.
    /// Only failing to query the repository aborts the sweep.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, LedgerError> {
        let expired = self
            .ledger
            .repository()
            .find_expired_pending_reservations(now, self.config.batch_size)?;

        let mut report = SweepReport {
            found: expired.len(),
            ..SweepReport::default()
        };

        for item in expired {
            match self
                .ledger
                .release_on_stock(item.stock_id, item.reservation_id, EXPIRED_REASON, now)
            {
                Ok(true) => report.expired += 1,
                Ok(false) => report.already_settled += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        stock_id = %item.stock_id,
                        reservation_id = %item.reservation_id,
                        error = %err,
                        "failed to expire reservation"
                    );
                }
            }
        }

        if report.found > 0 {
            info!(
                found = report.found,
                expired = report.expired,
                already_settled = report.already_settled,
                failed = report.failed,
                "reservation sweep finished"
            );
        } else {
            debug!("reservation sweep found nothing to expire");
        }
        Ok(report)
    }

    /// Run `sweep_once` on a background thread every `interval` until shutdown.
    pub fn spawn(self, name: &str) -> io::Result<SweeperHandle>
    where
        R: Send + Sync,
        B: Send + Sync,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = name.to_string();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run(&worker, shutdown_rx))?;

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn run(&self, worker: &str, shutdown_rx: mpsc::Receiver<()>) {
        info!(worker, interval_secs = self.config.interval.as_secs(), "reservation sweeper started");
        loop {
            if let Err(err) = self.sweep_once(Utc::now()) {
                error!(worker, error = %err, "reservation sweep aborted");
            }

            match shutdown_rx.recv_timeout(self.config.interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(worker, "reservation sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    use stockledger_core::{AggregateRoot, CartId, Entity, ProductId, Quantity, VariantId, WarehouseId};
    use stockledger_events::InMemoryEventBus;
    use stockledger_inventory::{
        CreateStock, ReservationStatus, ReservationType, ReserveStock, StockId,
    };

    use crate::config::LedgerConfig;
    use crate::repository::InMemoryStockRepository;

    type Ledger =
        StockLedger<Arc<InMemoryStockRepository>, Arc<InMemoryEventBus<EventEnvelope<StockEvent>>>>;

    fn ledger() -> Arc<Ledger> {
        Arc::new(StockLedger::new(
            Arc::new(InMemoryStockRepository::new()),
            Arc::new(InMemoryEventBus::new()),
            LedgerConfig::default(),
        ))
    }

    fn stock_with_cart_holds(ledger: &Ledger, now: DateTime<Utc>, ttls_min: &[i64]) -> StockId {
        let stock = ledger
            .create_stock(CreateStock {
                stock_id: StockId::generate(),
                product_id: ProductId::new(),
                variant_id: VariantId::new(),
                warehouse_id: WarehouseId::new(),
                initial_quantity: 50,
                quantity_incoming: 0,
                low_stock_threshold: 0,
                reorder_point: 0,
                occurred_at: now,
            })
            .unwrap();
        for ttl in ttls_min {
            ledger
                .reserve_stock(ReserveStock {
                    stock_id: *stock.id(),
                    quantity: 5,
                    reservation_type: ReservationType::Cart,
                    cart_id: Some(CartId::new()),
                    order_id: None,
                    expires_at: Some(now + ChronoDuration::minutes(*ttl)),
                    occurred_at: now,
                })
                .unwrap();
        }
        *stock.id()
    }

    #[test]
    fn sweep_expires_only_reservations_past_deadline() {
        let ledger = ledger();
        let now = Utc::now();
        let stock_id = stock_with_cart_holds(&ledger, now, &[10, 20, 30]);
        let sweeper = ReservationSweeper::new(ledger.clone(), SweeperConfig::default());

        let report = sweeper.sweep_once(now + ChronoDuration::minutes(20)).unwrap();
        assert_eq!(
            report,
            SweepReport {
                found: 2,
                expired: 2,
                already_settled: 0,
                failed: 0,
            }
        );

        let stock = ledger.get_stock(stock_id).unwrap().unwrap();
        assert_eq!(stock.quantity_reserved(), Quantity::from_units(5));
        assert_eq!(stock.quantity_available(), Quantity::from_units(45));
        let expired = stock
            .reservations()
            .iter()
            .filter(|r| r.status() == ReservationStatus::Expired)
            .count();
        assert_eq!(expired, 2);

        let again = sweeper.sweep_once(now + ChronoDuration::minutes(20)).unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[test]
    fn sweep_respects_batch_size() {
        let ledger = ledger();
        let now = Utc::now();
        stock_with_cart_holds(&ledger, now, &[1, 2, 3, 4]);
        let sweeper = ReservationSweeper::new(ledger, SweeperConfig::default().with_batch_size(3));

        let later = now + ChronoDuration::hours(1);
        assert_eq!(sweeper.sweep_once(later).unwrap().expired, 3);
        assert_eq!(sweeper.sweep_once(later).unwrap().expired, 1);
    }

    #[test]
    fn released_reservation_is_not_touched() {
        let ledger = ledger();
        let now = Utc::now();
        let stock_id = stock_with_cart_holds(&ledger, now, &[5]);
        let stock = ledger.get_stock(stock_id).unwrap().unwrap();
        let reservation_id = *stock.reservations()[0].id();

        ledger
            .release_on_stock(stock_id, reservation_id, "customer removed item", now)
            .unwrap();

        let sweeper = ReservationSweeper::new(ledger.clone(), SweeperConfig::default());
        assert_eq!(sweeper.sweep_once(now + ChronoDuration::minutes(10)).unwrap().found, 0);

        let stock = ledger.get_stock(stock_id).unwrap().unwrap();
        assert_eq!(stock.reservations()[0].status(), ReservationStatus::Cancelled);
        assert_eq!(stock.quantity_available(), Quantity::from_units(50));
    }

    #[test]
    fn spawned_sweeper_runs_and_shuts_down() {
        let ledger = ledger();
        let past = Utc::now() - ChronoDuration::hours(2);
        let stock_id = stock_with_cart_holds(&ledger, past, &[60]);
        let sweeper = ReservationSweeper::new(
            ledger.clone(),
            SweeperConfig::default().with_interval(Duration::from_millis(20)),
        );

        let handle = sweeper.spawn("reservation-sweeper-test").unwrap();
        thread::sleep(Duration::from_millis(60));
        handle.shutdown();

        let stock = ledger.get_stock(stock_id).unwrap().unwrap();
        assert_eq!(stock.quantity_reserved(), Quantity::ZERO);
        assert_eq!(stock.reservations()[0].status(), ReservationStatus::Expired);
    }
}

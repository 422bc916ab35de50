//! Stock ledger service: the command and query surface over `Stock`.
//!
//! ## Execution model
//!
//! Every command on an existing stock runs the same cycle:
//!
//! 1. Acquire the per-stock lock (bounded wait → `LockTimeout`)
//! 2. Load the aggregate into a private copy
//! 3. Apply the mutation (domain rules; failures leave nothing behind)
//! 4. Save state + outbox events in one commit, expecting the loaded version
//! 5. Still under the lock, publish the stock's outbox backlog oldest first and
//!    acknowledge what the bus accepted
//!
//! A version conflict at step 4 or a lock timeout at step 1 restarts the cycle
//! after a backoff delay, up to `RetryPolicy::max_retries` times. Mutations
//! that change nothing (releasing an already-terminal reservation) skip the
//! commit entirely.
//!
//! Publication is at-least-once and ordered per stock: a bus failure is logged
//! and that event plus everything after it stays in the outbox. The next
//! commit on the stock, or `flush_outbox`, resumes from the oldest row, so
//! subscribers never see a stock's events out of sequence.

mod error;

pub use error::LedgerError;

use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use stockledger_core::{AggregateRoot, CartId, ExpectedVersion, VariantId, WarehouseId};
use stockledger_events::{EventBus, EventEnvelope};
use stockledger_inventory::{
    AdjustStock, ConfirmReservation, CreateStock, MovementDirection, ReleaseReservation,
    ReservationId, ReserveStock, Stock, StockError, StockEvent, StockId, StockMovement,
    StockReservation, UpdateThresholds,
};

use crate::config::LedgerConfig;
use crate::lock::StockLocks;
use crate::repository::{OutboxRecord, StockRepository};

/// Reason recorded on releases performed by the expiry sweep.
pub const EXPIRED_REASON: &str = "expired";

type Mutation<'a, T> = dyn FnMut(&mut Stock) -> Result<(T, Vec<StockEvent>), StockError> + 'a;

/// Command/query service for stocks.
///
/// Generic over the repository and bus so tests can run fully in memory.
pub struct StockLedger<R, B> {
    repo: R,
    bus: B,
    locks: Arc<StockLocks>,
    config: LedgerConfig,
}

impl<R, B> StockLedger<R, B>
where
    R: StockRepository,
    B: EventBus<EventEnvelope<StockEvent>>,
{
    pub fn new(repo: R, bus: B, config: LedgerConfig) -> Self {
        Self {
            repo,
            bus,
            locks: Arc::new(StockLocks::new()),
            config,
        }
    }

    /// Share per-stock locks with other ledgers in the same process.
    pub fn with_locks(mut self, locks: Arc<StockLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    // ---- commands -------------------------------------------------------

    /// Create a stock; at most one may exist per variant × warehouse.
    pub fn create_stock(&self, cmd: CreateStock) -> Result<Stock, LedgerError> {
        let (stock, events) = Stock::create(&cmd)?;
        let stock_id = cmd.stock_id;

        {
            let _guard = self.locks.acquire(stock_id, self.config.lock_timeout)?;

            if self.repo.load(stock_id)?.is_some() {
                return Err(LedgerError::StockExists(stock_id));
            }
            if self
                .repo
                .find_by_variant_and_warehouse(stock.variant_id(), stock.warehouse_id())?
                .is_some()
            {
                return Err(LedgerError::AlreadyExists {
                    variant_id: stock.variant_id(),
                    warehouse_id: stock.warehouse_id(),
                });
            }

            match self.repo.save(&stock, &events, ExpectedVersion::NoStream) {
                Ok(_) => {}
                // Another process created the same id between load and save.
                Err(crate::repository::RepositoryError::Concurrency { .. }) => {
                    return Err(LedgerError::StockExists(stock_id));
                }
                Err(other) => return Err(other.into()),
            }

            info!(
                operation = "create_stock",
                %stock_id,
                variant_id = %stock.variant_id(),
                warehouse_id = %stock.warehouse_id(),
                available = stock.quantity_available().value(),
                "stock created"
            );
            self.relay_stock(stock_id);
        }
        Ok(stock)
    }

    /// Increase or decrease stock through a typed movement.
    ///
    /// `cmd.direction` must agree with `cmd.movement_type`.
    pub fn adjust_stock(&self, cmd: AdjustStock) -> Result<Stock, LedgerError> {
        if cmd.movement_type.direction() != cmd.direction {
            return Err(StockError::InvalidMovementDirection {
                movement_type: cmd.movement_type,
                expected: cmd.direction,
            }
            .into());
        }

        self.execute("adjust_stock", cmd.stock_id, &mut |stock| {
            let events = match cmd.direction {
                MovementDirection::Increase => stock.increase_stock(
                    cmd.quantity,
                    cmd.movement_type,
                    cmd.reference.clone(),
                    cmd.occurred_at,
                )?,
                MovementDirection::Decrease => stock.decrease_stock(
                    cmd.quantity,
                    cmd.movement_type,
                    cmd.reference.clone(),
                    cmd.occurred_at,
                )?,
            };
            Ok((stock.clone(), events))
        })
    }

    /// Hold units for a cart, an order or an operator.
    pub fn reserve_stock(&self, cmd: ReserveStock) -> Result<StockReservation, LedgerError> {
        self.execute("reserve_stock", cmd.stock_id, &mut |stock| {
            stock.reserve_stock(
                cmd.quantity,
                cmd.reservation_type,
                cmd.cart_id,
                cmd.order_id,
                cmd.expires_at,
                cmd.occurred_at,
            )
        })
    }

    /// Release a reservation by id, resolving its stock.
    ///
    /// Returns `true` when units went back to available, `false` when the
    /// reservation had already left `PENDING` (idempotent success).
    pub fn release_reservation(&self, cmd: ReleaseReservation) -> Result<bool, LedgerError> {
        let stock_id = self.owning_stock(cmd.reservation_id)?;
        self.release_on_stock(stock_id, cmd.reservation_id, &cmd.reason, cmd.occurred_at)
    }

    /// Release a reservation on a known stock.
    pub fn release_on_stock(
        &self,
        stock_id: StockId,
        reservation_id: ReservationId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.execute("release_reservation", stock_id, &mut |stock| {
            let events = stock.release_reservation(reservation_id, reason, now)?;
            Ok((!events.is_empty(), events))
        })
    }

    /// Turn a pending reservation into a sale for `cmd.order_id`.
    pub fn confirm_reservation(&self, cmd: ConfirmReservation) -> Result<(), LedgerError> {
        let stock_id = self.owning_stock(cmd.reservation_id)?;
        self.execute("confirm_reservation", stock_id, &mut |stock| {
            let events = stock.confirm_reservation(
                cmd.reservation_id,
                cmd.order_id,
                cmd.performed_by,
                cmd.occurred_at,
            )?;
            Ok(((), events))
        })
    }

    pub fn update_thresholds(&self, cmd: UpdateThresholds) -> Result<Stock, LedgerError> {
        self.execute("update_thresholds", cmd.stock_id, &mut |stock| {
            stock.update_thresholds(cmd.low_stock_threshold, cmd.reorder_point, cmd.occurred_at)?;
            Ok((stock.clone(), vec![]))
        })
    }

    /// Release every pending reservation held for a cart (cart abandoned or
    /// expired upstream). Returns how many were released.
    ///
    /// Stops at the first failure; calling again is safe since releases are
    /// idempotent.
    pub fn release_cart_reservations(
        &self,
        cart_id: CartId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let pending = self.repo.find_pending_reservations_for_cart(cart_id)?;
        let mut released = 0;
        for (stock_id, reservation_id) in pending {
            if self.release_on_stock(stock_id, reservation_id, reason, now)? {
                released += 1;
            }
        }
        debug!(%cart_id, released, "cart reservations released");
        Ok(released)
    }

    /// Re-publish committed events that were never acknowledged.
    ///
    /// Stocks are relayed one at a time under their lock, oldest row first. A
    /// stock whose lock is busy is skipped: its holder relays the backlog on
    /// commit. Returns the number of events published by this call.
    pub fn flush_outbox(&self) -> Result<usize, LedgerError> {
        let pending = self.repo.unpublished_events(self.config.outbox_batch_size)?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut stocks: Vec<StockId> = Vec::new();
        for record in &pending {
            if !stocks.contains(&record.stock_id) {
                stocks.push(record.stock_id);
            }
        }

        let mut published = 0;
        for stock_id in stocks {
            match self.locks.acquire(stock_id, self.config.lock_timeout) {
                Ok(_guard) => published += self.relay_stock(stock_id),
                Err(err) => debug!(%stock_id, error = %err, "stock busy; outbox left to its writer"),
            }
        }
        info!(pending = pending.len(), published, "outbox flushed");
        Ok(published)
    }

    // ---- queries --------------------------------------------------------

    pub fn get_stock(&self, stock_id: StockId) -> Result<Option<Stock>, LedgerError> {
        Ok(self.repo.load(stock_id)?)
    }

    pub fn find_stock(
        &self,
        variant_id: VariantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, LedgerError> {
        Ok(self.repo.find_by_variant_and_warehouse(variant_id, warehouse_id)?)
    }

    pub fn stocks_for_variant(&self, variant_id: VariantId) -> Result<Vec<Stock>, LedgerError> {
        Ok(self.repo.list_by_variant(variant_id)?)
    }

    pub fn stocks_in_warehouse(&self, warehouse_id: WarehouseId) -> Result<Vec<Stock>, LedgerError> {
        Ok(self.repo.list_by_warehouse(warehouse_id)?)
    }

    /// Stocks in a warehouse at or below their low-stock threshold.
    pub fn low_stock_in_warehouse(
        &self,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<Stock>, LedgerError> {
        let mut stocks = self.repo.list_by_warehouse(warehouse_id)?;
        stocks.retain(Stock::is_low_stock);
        Ok(stocks)
    }

    /// Movements of a stock in the order they were recorded.
    pub fn movements(&self, stock_id: StockId) -> Result<Vec<StockMovement>, LedgerError> {
        Ok(self.require_stock(stock_id)?.movements().to_vec())
    }

    /// Pending, unexpired reservations of a stock.
    pub fn active_reservations(
        &self,
        stock_id: StockId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>, LedgerError> {
        Ok(self
            .require_stock(stock_id)?
            .active_reservations(now)
            .cloned()
            .collect())
    }

    // ---- internals ------------------------------------------------------

    fn require_stock(&self, stock_id: StockId) -> Result<Stock, LedgerError> {
        self.repo
            .load(stock_id)?
            .ok_or(LedgerError::StockNotFound(stock_id))
    }

    fn owning_stock(&self, reservation_id: ReservationId) -> Result<StockId, LedgerError> {
        self.repo
            .find_stock_for_reservation(reservation_id)?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))
    }

    /// Run a mutation with locking, optimistic save and retries.
    fn execute<T>(
        &self,
        operation: &'static str,
        stock_id: StockId,
        mutate: &mut Mutation<'_, T>,
    ) -> Result<T, LedgerError> {
        let mut retries = 0;
        loop {
            match self.try_execute(operation, stock_id, mutate) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && self.config.retry.should_retry(retries) => {
                    retries += 1;
                    let delay = self.config.retry.delay_for_attempt(retries);
                    debug!(
                        operation,
                        %stock_id,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying stock operation"
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(operation, %stock_id, retries, error = %err, "giving up after retries");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn try_execute<T>(
        &self,
        operation: &'static str,
        stock_id: StockId,
        mutate: &mut Mutation<'_, T>,
    ) -> Result<T, LedgerError> {
        let _guard = self.locks.acquire(stock_id, self.config.lock_timeout)?;

        let mut stock = self.require_stock(stock_id)?;
        let loaded_version = stock.version();

        let (value, events) = mutate(&mut stock)?;
        if stock.version() == loaded_version {
            return Ok(value);
        }

        let records = self
            .repo
            .save(&stock, &events, ExpectedVersion::Exact(loaded_version))?;

        info!(
            operation,
            %stock_id,
            version = stock.version(),
            available = stock.quantity_available().value(),
            reserved = stock.quantity_reserved().value(),
            events = records.len(),
            "stock committed"
        );
        self.relay_stock(stock_id);
        Ok(value)
    }

    /// Publish the stock's whole outbox backlog. The caller holds the stock
    /// lock, so no other publisher interleaves with this one.
    ///
    /// A commit already happened when this runs; failures here are logged and
    /// left for the next relay.
    fn relay_stock(&self, stock_id: StockId) -> usize {
        match self.repo.unpublished_events_for_stock(stock_id) {
            Ok(backlog) => self.publish(&backlog),
            Err(err) => {
                warn!(%stock_id, error = %err, "failed to read outbox backlog");
                0
            }
        }
    }

    /// Publish outbox rows in order and acknowledge the ones that made it.
    /// Stops at the first failure so nothing overtakes the failed row.
    fn publish(&self, records: &[OutboxRecord]) -> usize {
        let mut acked: Vec<Uuid> = Vec::with_capacity(records.len());
        for record in records {
            let envelope = match record.to_envelope() {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(event_id = %record.event_id, error = %err, "undecodable outbox event");
                    break;
                }
            };
            if let Err(err) = self.bus.publish(envelope) {
                warn!(
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    error = ?err,
                    "event publication failed; left in outbox"
                );
                break;
            }
            acked.push(record.event_id);
        }

        if let Err(err) = self.repo.mark_published(&acked) {
            warn!(error = %err, "failed to acknowledge published events");
        }
        acked.len()
    }
}

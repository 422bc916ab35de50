use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stockledger_core::{CartId, ExpectedVersion, VariantId, WarehouseId};
use stockledger_events::{Event, EventEnvelope};
use stockledger_inventory::{ReservationId, Stock, StockEvent, StockId};

/// Aggregate type recorded on every outbox row written for a stock.
pub const STOCK_AGGREGATE_TYPE: &str = "inventory.stock";

/// A domain event committed to the outbox together with the aggregate state
/// that produced it.
///
/// A row lives in the outbox until it is acknowledged with `mark_published`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: Uuid,
    pub stock_id: StockId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the stock's outbox stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl OutboxRecord {
    /// Serialize a domain event into an (unpublished) outbox row.
    pub fn from_event(
        stock_id: StockId,
        sequence_number: u64,
        event: &StockEvent,
    ) -> Result<Self, RepositoryError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| RepositoryError::Serialization(format!("event payload: {e}")))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            stock_id,
            aggregate_type: STOCK_AGGREGATE_TYPE.to_string(),
            sequence_number,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }

    pub fn decode(&self) -> Result<StockEvent, RepositoryError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| RepositoryError::Serialization(format!("event {}: {e}", self.event_id)))
    }

    /// Build the envelope handed to the event bus.
    pub fn to_envelope(&self) -> Result<EventEnvelope<StockEvent>, RepositoryError> {
        Ok(EventEnvelope::new(
            self.event_id,
            self.stock_id.0,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.decode()?,
        ))
    }
}

/// A pending reservation whose deadline has passed, as found by the sweep.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExpiredReservation {
    pub stock_id: StockId,
    pub reservation_id: ReservationId,
    pub expires_at: DateTime<Utc>,
}

/// Repository operation error.
///
/// Infrastructure failures, as opposed to the business-rule failures carried by
/// `StockError`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The stored version did not match the caller's expectation.
    #[error("optimistic concurrency check failed for stock {stock_id}: expected {expected:?}, found {actual:?}")]
    Concurrency {
        stock_id: StockId,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    /// A different stock already exists for this variant × warehouse pair.
    #[error("stock already exists for variant {variant_id} in warehouse {warehouse_id}")]
    Duplicate {
        variant_id: VariantId,
        warehouse_id: WarehouseId,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Persistence port for `Stock` aggregates.
///
/// ## Save semantics
///
/// `save()` is one commit: the aggregate state (quantities, movements,
/// reservations) and the outbox rows for `events` become visible together or
/// not at all. It checks `expected` against the stored version first and
/// rejects the whole commit on mismatch.
///
/// ## Outbox
///
/// Rows written by `save()` stay in the outbox until acknowledged with
/// `mark_published`, which removes them. Publishers must hand a stock's rows to
/// the bus in `sequence_number` order and must not skip past a row that failed,
/// so `unpublished_events_for_stock` always starts at the oldest one.
pub trait StockRepository: Send + Sync {
    /// Load a stock by id (`None` when it does not exist).
    fn load(&self, stock_id: StockId) -> Result<Option<Stock>, RepositoryError>;

    /// Persist the aggregate and its events atomically.
    fn save(
        &self,
        stock: &Stock,
        events: &[StockEvent],
        expected: ExpectedVersion,
    ) -> Result<Vec<OutboxRecord>, RepositoryError>;

    fn find_by_variant_and_warehouse(
        &self,
        variant_id: VariantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, RepositoryError>;

    fn list_by_variant(&self, variant_id: VariantId) -> Result<Vec<Stock>, RepositoryError>;

    fn list_by_warehouse(&self, warehouse_id: WarehouseId) -> Result<Vec<Stock>, RepositoryError>;

    /// Resolve the stock owning a reservation.
    fn find_stock_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<StockId>, RepositoryError>;

    /// Pending reservations held for a cart, across all stocks.
    fn find_pending_reservations_for_cart(
        &self,
        cart_id: CartId,
    ) -> Result<Vec<(StockId, ReservationId)>, RepositoryError>;

    /// Up to `limit` pending reservations with `expires_at <= now`, oldest
    /// deadline first.
    fn find_expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredReservation>, RepositoryError>;

    /// Up to `limit` committed but unpublished outbox rows, in commit order.
    fn unpublished_events(&self, limit: usize) -> Result<Vec<OutboxRecord>, RepositoryError>;

    /// Every unacknowledged outbox row of one stock, by sequence number.
    fn unpublished_events_for_stock(
        &self,
        stock_id: StockId,
    ) -> Result<Vec<OutboxRecord>, RepositoryError>;

    /// Acknowledge publication and drop the rows. Unknown ids are ignored.
    fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), RepositoryError>;
}

impl<R> StockRepository for Arc<R>
where
    R: StockRepository + ?Sized,
{
    fn load(&self, stock_id: StockId) -> Result<Option<Stock>, RepositoryError> {
        (**self).load(stock_id)
    }

    fn save(
        &self,
        stock: &Stock,
        events: &[StockEvent],
        expected: ExpectedVersion,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        (**self).save(stock, events, expected)
    }

    fn find_by_variant_and_warehouse(
        &self,
        variant_id: VariantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, RepositoryError> {
        (**self).find_by_variant_and_warehouse(variant_id, warehouse_id)
    }

    fn list_by_variant(&self, variant_id: VariantId) -> Result<Vec<Stock>, RepositoryError> {
        (**self).list_by_variant(variant_id)
    }

    fn list_by_warehouse(&self, warehouse_id: WarehouseId) -> Result<Vec<Stock>, RepositoryError> {
        (**self).list_by_warehouse(warehouse_id)
    }

    fn find_stock_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<StockId>, RepositoryError> {
        (**self).find_stock_for_reservation(reservation_id)
    }

    fn find_pending_reservations_for_cart(
        &self,
        cart_id: CartId,
    ) -> Result<Vec<(StockId, ReservationId)>, RepositoryError> {
        (**self).find_pending_reservations_for_cart(cart_id)
    }

    fn find_expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredReservation>, RepositoryError> {
        (**self).find_expired_pending_reservations(now, limit)
    }

    fn unpublished_events(&self, limit: usize) -> Result<Vec<OutboxRecord>, RepositoryError> {
        (**self).unpublished_events(limit)
    }

    fn unpublished_events_for_stock(
        &self,
        stock_id: StockId,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        (**self).unpublished_events_for_stock(stock_id)
    }

    fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), RepositoryError> {
        (**self).mark_published(event_ids)
    }
}

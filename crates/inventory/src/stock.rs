use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    AggregateId, AggregateRoot, CartId, Entity, OrderId, ProductId, Quantity, UserId, VariantId,
    WarehouseId,
};

use crate::command::CreateStock;
use crate::error::StockError;
use crate::events::{
    LowStockAlert, ReservationConfirmed, StockAdjusted, StockCreated, StockEvent, StockReleased,
    StockReserved,
};
use crate::movement::{MovementDirection, MovementReference, MovementType, StockMovement};
use crate::reservation::{ReservationId, ReservationStatus, ReservationType, StockReservation};

/// Reference type of the movement recording a stock's opening quantity.
pub const INITIAL_STOCK_REFERENCE: &str = "INITIAL_STOCK";

/// Reference type of the sale movement written when a reservation is confirmed.
pub const ORDER_REFERENCE: &str = "ORDER";

/// Stock identifier (one per variant × warehouse).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockId(pub AggregateId);

impl StockId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for StockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Stock.
///
/// Tracks available and reserved units of one variant in one warehouse together
/// with the movements and reservations that explain them.
///
/// Invariants, upheld by every method:
/// - `quantity_available + quantity_reserved == total_quantity()`, both ≥ 0
///   (enforced by `Quantity`);
/// - the total only changes together with a new `StockMovement`, so the signed
///   sum of all movements equals the total;
/// - `quantity_reserved` equals the sum of reservations still holding stock.
///
/// Every mutating method validates first and writes last: an `Err` leaves the
/// aggregate untouched. Successful mutations bump `version` by one and return
/// the events they produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stock {
    pub(crate) id: StockId,
    pub(crate) product_id: ProductId,
    pub(crate) variant_id: VariantId,
    pub(crate) warehouse_id: WarehouseId,
    pub(crate) quantity_available: Quantity,
    pub(crate) quantity_reserved: Quantity,
    pub(crate) quantity_incoming: Quantity,
    pub(crate) low_stock_threshold: Quantity,
    pub(crate) reorder_point: Quantity,
    pub(crate) last_restocked_at: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) movements: Vec<StockMovement>,
    pub(crate) reservations: Vec<StockReservation>,
    pub(crate) version: u64,
}

impl Stock {
    /// Create a new stock record, validating every input.
    ///
    /// A non-zero opening quantity is recorded as an `ADJUSTMENT_IN` movement so
    /// that the movement ledger accounts for the whole total from day one.
    pub fn create(cmd: &CreateStock) -> Result<(Self, Vec<StockEvent>), StockError> {
        if cmd.stock_id.0.is_nil() {
            return Err(StockError::invalid_argument("stock_id is required"));
        }
        let product_id = cmd.product_id.require("product_id")?;
        let variant_id = cmd.variant_id.require("variant_id")?;
        let warehouse_id = cmd.warehouse_id.require("warehouse_id")?;
        let initial = Quantity::new(cmd.initial_quantity)?;
        let incoming = Quantity::new(cmd.quantity_incoming)?;
        let low_stock_threshold = threshold(cmd.low_stock_threshold, "low_stock_threshold")?;
        let reorder_point = threshold(cmd.reorder_point, "reorder_point")?;
        let now = cmd.occurred_at;

        let mut stock = Self {
            id: cmd.stock_id,
            product_id,
            variant_id,
            warehouse_id,
            quantity_available: initial,
            quantity_reserved: Quantity::ZERO,
            quantity_incoming: incoming,
            low_stock_threshold,
            reorder_point,
            last_restocked_at: None,
            created_at: now,
            updated_at: now,
            movements: Vec::new(),
            reservations: Vec::new(),
            version: 1,
        };

        if !initial.is_zero() {
            stock.movements.push(StockMovement::record(
                stock.id,
                MovementType::AdjustmentIn,
                initial,
                MovementReference::new(INITIAL_STOCK_REFERENCE).with_note("Initial stock"),
                now,
            ));
            stock.last_restocked_at = Some(now);
        }

        let created = StockEvent::StockCreated(StockCreated {
            stock_id: stock.id,
            product_id,
            variant_id,
            warehouse_id,
            initial_quantity: initial.value(),
            occurred_at: now,
        });

        Ok((stock, vec![created]))
    }

    pub fn stock_id(&self) -> StockId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.warehouse_id
    }

    pub fn quantity_available(&self) -> Quantity {
        self.quantity_available
    }

    pub fn quantity_reserved(&self) -> Quantity {
        self.quantity_reserved
    }

    pub fn quantity_incoming(&self) -> Quantity {
        self.quantity_incoming
    }

    pub fn total_quantity(&self) -> Quantity {
        Quantity::from_units(
            self.quantity_available
                .value()
                .saturating_add(self.quantity_reserved.value()),
        )
    }

    pub fn available_for_reservation(&self) -> Quantity {
        self.quantity_available
    }

    pub fn low_stock_threshold(&self) -> Quantity {
        self.low_stock_threshold
    }

    pub fn reorder_point(&self) -> Quantity {
        self.reorder_point
    }

    pub fn last_restocked_at(&self) -> Option<DateTime<Utc>> {
        self.last_restocked_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_low_stock(&self) -> bool {
        self.quantity_available <= self.low_stock_threshold
    }

    pub fn needs_reorder(&self) -> bool {
        self.quantity_available <= self.reorder_point
    }

    /// Movements in the order they were recorded.
    pub fn movements(&self) -> &[StockMovement] {
        &self.movements
    }

    pub fn reservations(&self) -> &[StockReservation] {
        &self.reservations
    }

    pub fn reservation(&self, reservation_id: ReservationId) -> Option<&StockReservation> {
        self.reservations.iter().find(|r| *r.id() == reservation_id)
    }

    /// Pending reservations whose deadline (if any) has not been reached.
    pub fn active_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &StockReservation> + '_ {
        self.reservations.iter().filter(move |r| r.is_active_at(now))
    }

    /// Pending reservations the expiry sweep should release.
    pub fn expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &StockReservation> + '_ {
        self.reservations
            .iter()
            .filter(move |r| r.is_expired_pending_at(now))
    }

    pub fn pending_reservations_for_cart(
        &self,
        cart_id: CartId,
    ) -> impl Iterator<Item = &StockReservation> + '_ {
        self.reservations.iter().filter(move |r| {
            r.status() == ReservationStatus::Pending && r.external_cart_id() == Some(cart_id)
        })
    }

    /// Add units (purchase, return, positive adjustment, inbound transfer).
    pub fn increase_stock(
        &mut self,
        quantity: i64,
        movement_type: MovementType,
        reference: MovementReference,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockEvent>, StockError> {
        let quantity = Quantity::positive(quantity)?;
        ensure_direction(movement_type, MovementDirection::Increase)?;

        let new_available = self
            .quantity_available
            .checked_add(quantity)
            .filter(|available| available.checked_add(self.quantity_reserved).is_some())
            .ok_or_else(|| StockError::invariant("stock quantity overflow"))?;

        let reference_type = reference.reference_type.clone();
        self.movements.push(StockMovement::record(
            self.id,
            movement_type,
            quantity,
            reference,
            now,
        ));
        self.quantity_available = new_available;
        self.last_restocked_at = Some(now);
        self.touch(now);

        Ok(vec![self.adjusted_event(movement_type, quantity, reference_type, now)])
    }

    /// Remove units (sale, damage, negative adjustment, outbound transfer).
    ///
    /// This is the oversell guard: the request is refused unless it fits in the
    /// units currently available.
    pub fn decrease_stock(
        &mut self,
        quantity: i64,
        movement_type: MovementType,
        reference: MovementReference,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockEvent>, StockError> {
        let quantity = Quantity::positive(quantity)?;
        ensure_direction(movement_type, MovementDirection::Decrease)?;

        let new_available = self
            .quantity_available
            .checked_sub(quantity)
            .ok_or_else(|| self.insufficient(quantity))?;

        let reference_type = reference.reference_type.clone();
        self.movements.push(StockMovement::record(
            self.id,
            movement_type,
            quantity,
            reference,
            now,
        ));
        self.quantity_available = new_available;
        self.touch(now);

        let mut events = vec![self.adjusted_event(movement_type, quantity, reference_type, now)];
        events.extend(self.low_stock_alert(now));
        Ok(events)
    }

    /// Move units from available to reserved under a new `PENDING` reservation.
    ///
    /// Returns a copy of the reservation; its id is the caller's handle for a
    /// later release or confirmation.
    pub fn reserve_stock(
        &mut self,
        quantity: i64,
        reservation_type: ReservationType,
        cart_id: Option<CartId>,
        order_id: Option<OrderId>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(StockReservation, Vec<StockEvent>), StockError> {
        let quantity = Quantity::positive(quantity)?;
        if expires_at.is_some_and(|at| at <= now) {
            return Err(StockError::invalid_argument(
                "expires_at must be later than the reservation time",
            ));
        }

        let new_available = self
            .quantity_available
            .checked_sub(quantity)
            .ok_or_else(|| self.insufficient(quantity))?;
        let new_reserved = self
            .quantity_reserved
            .checked_add(quantity)
            .ok_or_else(|| StockError::invariant("reserved quantity overflow"))?;

        let reservation = StockReservation::open(
            self.id,
            quantity,
            reservation_type,
            cart_id,
            order_id,
            expires_at,
            now,
        );
        self.reservations.push(reservation.clone());
        self.quantity_available = new_available;
        self.quantity_reserved = new_reserved;
        self.touch(now);

        let mut events = vec![StockEvent::StockReserved(StockReserved {
            stock_id: self.id,
            reservation_id: *reservation.id(),
            variant_id: self.variant_id,
            warehouse_id: self.warehouse_id,
            quantity: quantity.value(),
            reservation_type,
            cart_id,
            order_id,
            occurred_at: now,
        })];
        events.extend(self.low_stock_alert(now));

        Ok((reservation, events))
    }

    /// Give reserved units back to available.
    ///
    /// Idempotent: releasing a reservation that no longer holds stock succeeds
    /// without any effect and without events. A reservation past its deadline
    /// ends `EXPIRED`, any other one `CANCELLED`.
    pub fn release_reservation(
        &mut self,
        reservation_id: ReservationId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockEvent>, StockError> {
        let idx = self.reservation_index(reservation_id)?;
        let reservation = &self.reservations[idx];
        if !reservation.status().holds_stock() {
            return Ok(vec![]);
        }

        let quantity = reservation.quantity();
        let target = if reservation.is_expired_at(now) {
            ReservationStatus::Expired
        } else {
            ReservationStatus::Cancelled
        };
        reservation.ensure_transition(target)?;

        let new_reserved = self
            .quantity_reserved
            .checked_sub(quantity)
            .ok_or_else(|| StockError::invariant("reserved quantity would go negative"))?;
        let new_available = self
            .quantity_available
            .checked_add(quantity)
            .ok_or_else(|| StockError::invariant("stock quantity overflow"))?;

        self.reservations[idx].transition(target, now)?;
        self.quantity_reserved = new_reserved;
        self.quantity_available = new_available;
        self.touch(now);

        Ok(vec![StockEvent::StockReleased(StockReleased {
            stock_id: self.id,
            reservation_id,
            variant_id: self.variant_id,
            warehouse_id: self.warehouse_id,
            quantity: quantity.value(),
            reason: reason.into(),
            occurred_at: now,
        })])
    }

    /// Turn a pending reservation into a completed sale.
    ///
    /// The reserved units leave the warehouse: `quantity_reserved` drops and a
    /// `SALE` movement referencing the order is recorded. Available stock is not
    /// touched.
    pub fn confirm_reservation(
        &mut self,
        reservation_id: ReservationId,
        order_id: OrderId,
        performed_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockEvent>, StockError> {
        let order_id = order_id.require("order_id")?;
        let idx = self.reservation_index(reservation_id)?;
        let reservation = &self.reservations[idx];
        reservation.ensure_transition(ReservationStatus::Confirmed)?;
        let quantity = reservation.quantity();

        let new_reserved = self
            .quantity_reserved
            .checked_sub(quantity)
            .ok_or_else(|| StockError::invariant("reserved quantity would go negative"))?;

        let reservation = &mut self.reservations[idx];
        reservation.transition(ReservationStatus::Confirmed, now)?;
        reservation.transition(ReservationStatus::Completed, now)?;

        let mut reference = MovementReference::new(ORDER_REFERENCE)
            .with_external_id(order_id)
            .with_note("Reservation confirmed");
        reference.performed_by = performed_by;
        self.movements.push(StockMovement::record(
            self.id,
            MovementType::Sale,
            quantity,
            reference,
            now,
        ));
        self.quantity_reserved = new_reserved;
        self.touch(now);

        Ok(vec![StockEvent::ReservationConfirmed(ReservationConfirmed {
            stock_id: self.id,
            reservation_id,
            variant_id: self.variant_id,
            warehouse_id: self.warehouse_id,
            quantity: quantity.value(),
            order_id,
            occurred_at: now,
        })])
    }

    /// Change the alerting thresholds. Emits nothing; alerts follow on the next
    /// quantity change.
    pub fn update_thresholds(
        &mut self,
        low_stock_threshold: i64,
        reorder_point: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StockError> {
        let low_stock_threshold = threshold(low_stock_threshold, "low_stock_threshold")?;
        let reorder_point = threshold(reorder_point, "reorder_point")?;

        self.low_stock_threshold = low_stock_threshold;
        self.reorder_point = reorder_point;
        self.touch(now);
        Ok(())
    }

    /// Recompute the derived totals from the owned entities and compare.
    pub fn check_invariants(&self) -> Result<(), StockError> {
        if let Some(m) = self.movements.iter().find(|m| m.stock_id() != self.id) {
            return Err(StockError::invariant(format!(
                "movement {} belongs to stock {}",
                m.id(),
                m.stock_id()
            )));
        }
        if let Some(r) = self.reservations.iter().find(|r| r.stock_id() != self.id) {
            return Err(StockError::invariant(format!(
                "reservation {} belongs to stock {}",
                r.id(),
                r.stock_id()
            )));
        }

        let held: u64 = self
            .reservations
            .iter()
            .filter(|r| r.status().holds_stock())
            .map(|r| r.quantity().value())
            .sum();
        if held != self.quantity_reserved.value() {
            return Err(StockError::invariant(format!(
                "reserved quantity {} does not match pending reservations {held}",
                self.quantity_reserved
            )));
        }

        let ledger: i128 = self.movements.iter().map(StockMovement::signed_quantity).sum();
        if ledger != i128::from(self.total_quantity().value()) {
            return Err(StockError::invariant(format!(
                "total quantity {} does not match movement ledger {ledger}",
                self.total_quantity()
            )));
        }

        Ok(())
    }

    fn reservation_index(&self, reservation_id: ReservationId) -> Result<usize, StockError> {
        self.reservations
            .iter()
            .position(|r| *r.id() == reservation_id)
            .ok_or(StockError::ReservationNotOwned {
                stock_id: self.id,
                reservation_id,
            })
    }

    fn insufficient(&self, requested: Quantity) -> StockError {
        StockError::InsufficientStock {
            stock_id: self.id,
            requested: requested.value(),
            available: self.quantity_available.value(),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }

    fn adjusted_event(
        &self,
        movement_type: MovementType,
        quantity: Quantity,
        reference_type: Option<String>,
        now: DateTime<Utc>,
    ) -> StockEvent {
        StockEvent::StockAdjusted(StockAdjusted {
            stock_id: self.id,
            variant_id: self.variant_id,
            warehouse_id: self.warehouse_id,
            movement_type,
            quantity: quantity.value(),
            new_available: self.quantity_available.value(),
            reference_type,
            occurred_at: now,
        })
    }

    fn low_stock_alert(&self, now: DateTime<Utc>) -> Option<StockEvent> {
        self.is_low_stock().then(|| {
            StockEvent::LowStockAlert(LowStockAlert {
                stock_id: self.id,
                variant_id: self.variant_id,
                warehouse_id: self.warehouse_id,
                available: self.quantity_available.value(),
                threshold: self.low_stock_threshold.value(),
                occurred_at: now,
            })
        })
    }
}

impl AggregateRoot for Stock {
    type Id = StockId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn ensure_direction(
    movement_type: MovementType,
    expected: MovementDirection,
) -> Result<(), StockError> {
    if movement_type.direction() == expected {
        Ok(())
    } else {
        Err(StockError::InvalidMovementDirection {
            movement_type,
            expected,
        })
    }
}

fn threshold(value: i64, field: &str) -> Result<Quantity, StockError> {
    Quantity::new(value)
        .map_err(|_| StockError::invalid_argument(format!("{field} cannot be negative (got {value})")))
}

//! Stock reservations and their lifecycle.
//!
//! ```text
//! PENDING ──confirm──▶ CONFIRMED ──complete──▶ COMPLETED
//!    │
//!    ├──cancel──▶ CANCELLED
//!    └──expire──▶ EXPIRED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{CartId, Entity, OrderId, Quantity};

use crate::error::StockError;
use crate::stock::StockId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationType {
    /// Held while an item sits in a shopping cart.
    Cart,
    /// Held for a placed order awaiting payment.
    Order,
    /// Held by an operator.
    Manual,
}

impl core::fmt::Display for ReservationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ReservationType::Cart => f.write_str("CART"),
            ReservationType::Order => f.write_str("ORDER"),
            ReservationType::Manual => f.write_str("MANUAL"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
    Completed,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 5] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::Cancelled,
        ReservationStatus::Expired,
        ReservationStatus::Completed,
    ];

    /// The full transition table.
    pub fn can_transition_to(self, to: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed) | (Pending, Cancelled) | (Pending, Expired) | (Confirmed, Completed)
        )
    }

    /// No transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationStatus::Cancelled | ReservationStatus::Expired | ReservationStatus::Completed
        )
    }

    /// Units are still held against the reservation (counted in `quantity_reserved`).
    pub fn holds_stock(self) -> bool {
        self == ReservationStatus::Pending
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// A time-bounded hold on units of one `Stock`.
///
/// Owned by its stock: status changes happen only from inside the aggregate,
/// callers receive clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    id: ReservationId,
    stock_id: StockId,
    quantity: Quantity,
    reservation_type: ReservationType,
    external_cart_id: Option<CartId>,
    external_order_id: Option<OrderId>,
    expires_at: Option<DateTime<Utc>>,
    status: ReservationStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StockReservation {
    pub(crate) fn open(
        stock_id: StockId,
        quantity: Quantity,
        reservation_type: ReservationType,
        external_cart_id: Option<CartId>,
        external_order_id: Option<OrderId>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            stock_id,
            quantity,
            reservation_type,
            external_cart_id,
            external_order_id,
            expires_at,
            status: ReservationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stock_id(&self) -> StockId {
        self.stock_id
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn reservation_type(&self) -> ReservationType {
        self.reservation_type
    }

    pub fn external_cart_id(&self) -> Option<CartId> {
        self.external_cart_id
    }

    pub fn external_order_id(&self) -> Option<OrderId> {
        self.external_order_id
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// The expiry instant has been reached (`expires_at <= now`).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status.holds_stock() && !self.is_expired_at(now)
    }

    /// Eligible for the expiry sweep.
    pub fn is_expired_pending_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && self.is_expired_at(now)
    }

    pub(crate) fn ensure_transition(&self, to: ReservationStatus) -> Result<(), StockError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(StockError::InvalidReservationTransition {
                from: self.status,
                to,
            })
        }
    }

    pub(crate) fn transition(
        &mut self,
        to: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StockError> {
        self.ensure_transition(to)?;
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for StockReservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

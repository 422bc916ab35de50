//! Commands accepted by the stock ledger.
//!
//! Plain data: validation happens inside `Stock` so that the aggregate stays the
//! single place where the rules live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{CartId, OrderId, ProductId, UserId, VariantId, WarehouseId};

use crate::movement::{MovementDirection, MovementReference, MovementType};
use crate::reservation::{ReservationId, ReservationType};
use crate::stock::StockId;

/// Command: CreateStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStock {
    pub stock_id: StockId,
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub initial_quantity: i64,
    pub quantity_incoming: i64,
    pub low_stock_threshold: i64,
    pub reorder_point: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustStock.
///
/// `direction` states what the caller intends; a `movement_type` pointing the
/// other way is rejected rather than silently reinterpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub stock_id: StockId,
    pub direction: MovementDirection,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub reference: MovementReference,
    pub occurred_at: DateTime<Utc>,
}

impl AdjustStock {
    /// Build an adjustment whose direction is taken from the movement type.
    pub fn inferred(
        stock_id: StockId,
        movement_type: MovementType,
        quantity: i64,
        reference: MovementReference,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stock_id,
            direction: movement_type.direction(),
            movement_type,
            quantity,
            reference,
            occurred_at,
        }
    }
}

/// Command: ReserveStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub stock_id: StockId,
    pub quantity: i64,
    pub reservation_type: ReservationType,
    pub cart_id: Option<CartId>,
    pub order_id: Option<OrderId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReservation {
    pub reservation_id: ReservationId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmReservation {
    pub reservation_id: ReservationId,
    pub order_id: OrderId,
    pub performed_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateThresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateThresholds {
    pub stock_id: StockId,
    pub low_stock_threshold: i64,
    pub reorder_point: i64,
    pub occurred_at: DateTime<Utc>,
}

//! Domain events emitted by the Stock aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{CartId, OrderId, ProductId, VariantId, WarehouseId};
use stockledger_events::Event;

use crate::movement::MovementType;
use crate::reservation::{ReservationId, ReservationType};
use crate::stock::StockId;

/// Event: StockCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCreated {
    pub stock_id: StockId,
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub initial_quantity: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAdjusted (increase or decrease through a movement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub stock_id: StockId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub movement_type: MovementType,
    pub quantity: u64,
    pub new_available: u64,
    pub reference_type: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub stock_id: StockId,
    pub reservation_id: ReservationId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub quantity: u64,
    pub reservation_type: ReservationType,
    pub cart_id: Option<CartId>,
    pub order_id: Option<OrderId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReleased (reservation cancelled or expired).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub stock_id: StockId,
    pub reservation_id: ReservationId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub quantity: u64,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationConfirmed (reserved units left as a sale).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConfirmed {
    pub stock_id: StockId,
    pub reservation_id: ReservationId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub quantity: u64,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LowStockAlert.
///
/// Level-triggered: raised on every decrease/reservation that leaves the stock
/// at or below its threshold, not only when crossing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub stock_id: StockId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub available: u64,
    pub threshold: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    StockCreated(StockCreated),
    StockAdjusted(StockAdjusted),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
    ReservationConfirmed(ReservationConfirmed),
    LowStockAlert(LowStockAlert),
}

impl StockEvent {
    pub fn stock_id(&self) -> StockId {
        match self {
            StockEvent::StockCreated(e) => e.stock_id,
            StockEvent::StockAdjusted(e) => e.stock_id,
            StockEvent::StockReserved(e) => e.stock_id,
            StockEvent::StockReleased(e) => e.stock_id,
            StockEvent::ReservationConfirmed(e) => e.stock_id,
            StockEvent::LowStockAlert(e) => e.stock_id,
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::StockCreated(_) => "inventory.stock.created",
            StockEvent::StockAdjusted(_) => "inventory.stock.adjusted",
            StockEvent::StockReserved(_) => "inventory.stock.reserved",
            StockEvent::StockReleased(_) => "inventory.stock.released",
            StockEvent::ReservationConfirmed(_) => "inventory.reservation.confirmed",
            StockEvent::LowStockAlert(_) => "inventory.stock.low_stock_alert",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::StockCreated(e) => e.occurred_at,
            StockEvent::StockAdjusted(e) => e.occurred_at,
            StockEvent::StockReserved(e) => e.occurred_at,
            StockEvent::StockReleased(e) => e.occurred_at,
            StockEvent::ReservationConfirmed(e) => e.occurred_at,
            StockEvent::LowStockAlert(e) => e.occurred_at,
        }
    }
}

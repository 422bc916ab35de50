//! Serializable state of a `Stock`, for repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{ProductId, Quantity, VariantId, WarehouseId};

use crate::error::StockError;
use crate::movement::StockMovement;
use crate::reservation::StockReservation;
use crate::stock::{Stock, StockId};

/// Flat copy of everything a `Stock` owns.
///
/// Repositories store this as a whole; loading it back yields an identical
/// aggregate (including its version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub id: StockId,
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub quantity_available: Quantity,
    pub quantity_reserved: Quantity,
    pub quantity_incoming: Quantity,
    pub low_stock_threshold: Quantity,
    pub reorder_point: Quantity,
    pub last_restocked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub movements: Vec<StockMovement>,
    pub reservations: Vec<StockReservation>,
    pub version: u64,
}

impl Stock {
    pub fn snapshot(&self) -> StockSnapshot {
        StockSnapshot {
            id: self.id,
            product_id: self.product_id,
            variant_id: self.variant_id,
            warehouse_id: self.warehouse_id,
            quantity_available: self.quantity_available,
            quantity_reserved: self.quantity_reserved,
            quantity_incoming: self.quantity_incoming,
            low_stock_threshold: self.low_stock_threshold,
            reorder_point: self.reorder_point,
            last_restocked_at: self.last_restocked_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            movements: self.movements.clone(),
            reservations: self.reservations.clone(),
            version: self.version,
        }
    }

    /// Rebuild a stock from a snapshot, rejecting one whose totals disagree with
    /// its movements and reservations, or that holds entities of another stock.
    pub fn restore(snapshot: StockSnapshot) -> Result<Self, StockError> {
        let stock = Self {
            id: snapshot.id,
            product_id: snapshot.product_id,
            variant_id: snapshot.variant_id,
            warehouse_id: snapshot.warehouse_id,
            quantity_available: snapshot.quantity_available,
            quantity_reserved: snapshot.quantity_reserved,
            quantity_incoming: snapshot.quantity_incoming,
            low_stock_threshold: snapshot.low_stock_threshold,
            reorder_point: snapshot.reorder_point,
            last_restocked_at: snapshot.last_restocked_at,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            movements: snapshot.movements,
            reservations: snapshot.reservations,
            version: snapshot.version,
        };
        stock.check_invariants()?;
        Ok(stock)
    }
}

//! Inventory stock ledger domain.
//!
//! Business rules for per-warehouse stock: quantity movements, reservations
//! and low-stock alerting, implemented as deterministic domain logic (no IO,
//! no locking, no storage). Callers pass the current time in explicitly.

pub mod command;
pub mod error;
pub mod events;
pub mod movement;
pub mod persistence;
pub mod reservation;
pub mod stock;

pub use command::{
    AdjustStock, ConfirmReservation, CreateStock, ReleaseReservation, ReserveStock,
    UpdateThresholds,
};
pub use error::StockError;
pub use events::{
    LowStockAlert, ReservationConfirmed, StockAdjusted, StockCreated, StockEvent, StockReleased,
    StockReserved,
};
pub use movement::{MovementDirection, MovementId, MovementReference, MovementType, StockMovement};
pub use persistence::StockSnapshot;
pub use reservation::{ReservationId, ReservationStatus, ReservationType, StockReservation};
pub use stock::{INITIAL_STOCK_REFERENCE, ORDER_REFERENCE, Stock, StockId};

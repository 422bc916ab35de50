//! Errors raised by the Stock aggregate.

use thiserror::Error;

use stockledger_core::DomainError;

use crate::movement::{MovementDirection, MovementType};
use crate::reservation::{ReservationId, ReservationStatus};
use crate::stock::StockId;

/// Failure of an operation on a `Stock`.
///
/// Every variant is raised before any state is touched, so a failed call leaves
/// the aggregate exactly as it was.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    /// Malformed input: non-positive quantity, nil id, negative threshold.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Not enough available units to satisfy a decrease or reservation.
    #[error("insufficient stock on {stock_id}: requested {requested}, available {available}")]
    InsufficientStock {
        stock_id: StockId,
        requested: u64,
        available: u64,
    },

    /// The movement type points the other way from the requested operation.
    #[error("movement type {movement_type} cannot be used to {expected} stock")]
    InvalidMovementDirection {
        movement_type: MovementType,
        expected: MovementDirection,
    },

    #[error("invalid reservation transition from {from} to {to}")]
    InvalidReservationTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("reservation {reservation_id} does not belong to stock {stock_id}")]
    ReservationNotOwned {
        stock_id: StockId,
        reservation_id: ReservationId,
    },

    /// Internal bookkeeping would break (counter overflow or drift).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl StockError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

impl From<DomainError> for StockError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                StockError::InvalidArgument(msg)
            }
        }
    }
}

//! Stock movements: the append-only audit trail of quantity changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{Entity, Quantity, UserId};

use crate::stock::StockId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovementId(Uuid);

impl MovementId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MovementId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for MovementId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Which way a movement moves the total.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementDirection {
    Increase,
    Decrease,
}

impl core::fmt::Display for MovementDirection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MovementDirection::Increase => f.write_str("increase"),
            MovementDirection::Decrease => f.write_str("decrease"),
        }
    }
}

/// Why stock moved. Each type has exactly one direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Purchase,
    Return,
    AdjustmentIn,
    TransferIn,
    Sale,
    Damage,
    AdjustmentOut,
    TransferOut,
}

impl MovementType {
    pub const ALL: [MovementType; 8] = [
        MovementType::Purchase,
        MovementType::Return,
        MovementType::AdjustmentIn,
        MovementType::TransferIn,
        MovementType::Sale,
        MovementType::Damage,
        MovementType::AdjustmentOut,
        MovementType::TransferOut,
    ];

    pub fn direction(self) -> MovementDirection {
        match self {
            MovementType::Purchase
            | MovementType::Return
            | MovementType::AdjustmentIn
            | MovementType::TransferIn => MovementDirection::Increase,
            MovementType::Sale
            | MovementType::Damage
            | MovementType::AdjustmentOut
            | MovementType::TransferOut => MovementDirection::Decrease,
        }
    }

    pub fn increases_stock(self) -> bool {
        self.direction() == MovementDirection::Increase
    }

    pub fn decreases_stock(self) -> bool {
        self.direction() == MovementDirection::Decrease
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::Purchase => "PURCHASE",
            MovementType::Return => "RETURN",
            MovementType::AdjustmentIn => "ADJUSTMENT_IN",
            MovementType::TransferIn => "TRANSFER_IN",
            MovementType::Sale => "SALE",
            MovementType::Damage => "DAMAGE",
            MovementType::AdjustmentOut => "ADJUSTMENT_OUT",
            MovementType::TransferOut => "TRANSFER_OUT",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form pointer to whatever caused a movement (an order, a purchase order,
/// an audit) plus who did it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementReference {
    pub reference_type: Option<String>,
    pub external_reference_id: Option<Uuid>,
    pub performed_by: Option<UserId>,
    pub note: Option<String>,
}

impl MovementReference {
    pub fn new(reference_type: impl Into<String>) -> Self {
        Self {
            reference_type: Some(reference_type.into()),
            ..Self::default()
        }
    }

    pub fn with_external_id(mut self, id: impl Into<Uuid>) -> Self {
        self.external_reference_id = Some(id.into());
        self
    }

    pub fn performed_by(mut self, user: UserId) -> Self {
        self.performed_by = Some(user);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Immutable audit record of one quantity change.
///
/// Only `Stock` creates movements; there is no way to edit one afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    id: MovementId,
    stock_id: StockId,
    movement_type: MovementType,
    quantity: Quantity,
    reference: MovementReference,
    created_at: DateTime<Utc>,
}

impl StockMovement {
    /// `quantity` has already been validated as positive by the caller.
    pub(crate) fn record(
        stock_id: StockId,
        movement_type: MovementType,
        quantity: Quantity,
        reference: MovementReference,
        created_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(!quantity.is_zero(), "movement quantity must be positive");
        Self {
            id: MovementId::new(),
            stock_id,
            movement_type,
            quantity,
            reference,
            created_at,
        }
    }

    pub fn stock_id(&self) -> StockId {
        self.stock_id
    }

    pub fn movement_type(&self) -> MovementType {
        self.movement_type
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    /// Quantity with the sign of the movement's direction.
    pub fn signed_quantity(&self) -> i128 {
        let q = i128::from(self.quantity.value());
        match self.movement_type.direction() {
            MovementDirection::Increase => q,
            MovementDirection::Decrease => -q,
        }
    }

    pub fn reference(&self) -> &MovementReference {
        &self.reference
    }

    pub fn reference_type(&self) -> Option<&str> {
        self.reference.reference_type.as_deref()
    }

    pub fn external_reference_id(&self) -> Option<Uuid> {
        self.reference.external_reference_id
    }

    pub fn performed_by(&self) -> Option<UserId> {
        self.reference.performed_by
    }

    pub fn note(&self) -> Option<&str> {
        self.reference.note.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Entity for StockMovement {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

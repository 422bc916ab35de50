use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stockledger_core::{AggregateRoot, CartId, Entity, ExpectedVersion, VariantId, WarehouseId};
use stockledger_inventory::{
    ReservationId, ReservationStatus, Stock, StockEvent, StockId, StockSnapshot,
};

use super::r#trait::{ExpiredReservation, OutboxRecord, RepositoryError, StockRepository};

/// Stored stock row: the snapshot as JSON plus the columns queries filter on.
#[derive(Debug, Clone)]
struct StockRow {
    version: u64,
    variant_id: VariantId,
    warehouse_id: WarehouseId,
    snapshot: String,
    last_sequence: u64,
}

#[derive(Debug, Clone)]
struct ReservationRow {
    stock_id: StockId,
    status: ReservationStatus,
    expires_at: Option<DateTime<Utc>>,
    cart_id: Option<CartId>,
}

#[derive(Debug, Default)]
struct Tables {
    stocks: HashMap<StockId, StockRow>,
    by_variant_warehouse: HashMap<(VariantId, WarehouseId), StockId>,
    reservations: HashMap<ReservationId, ReservationRow>,
    /// Unacknowledged rows in commit order.
    outbox: Vec<OutboxRecord>,
}

/// In-memory stock repository.
///
/// Every commit runs under one write lock, which gives `save()` the same
/// all-or-nothing behaviour a database transaction would. Intended for
/// tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryStockRepository {
    tables: RwLock<Tables>,
}

impl InMemoryStockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, RepositoryError> {
        self.tables
            .read()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, RepositoryError> {
        self.tables
            .write()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn outbox_len(&self) -> usize {
        self.read().map(|t| t.outbox.len()).unwrap_or(0)
    }

    fn decode(stock_id: StockId, row: &StockRow) -> Result<Stock, RepositoryError> {
        let snapshot: StockSnapshot = serde_json::from_str(&row.snapshot)
            .map_err(|e| RepositoryError::Serialization(format!("stock {stock_id}: {e}")))?;
        Stock::restore(snapshot)
            .map_err(|e| RepositoryError::Storage(format!("corrupt stock row {stock_id}: {e}")))
    }

    fn decode_all<'a>(
        rows: impl Iterator<Item = (&'a StockId, &'a StockRow)>,
    ) -> Result<Vec<Stock>, RepositoryError> {
        rows.map(|(id, row)| Self::decode(*id, row)).collect()
    }
}

impl StockRepository for InMemoryStockRepository {
    fn load(&self, stock_id: StockId) -> Result<Option<Stock>, RepositoryError> {
        let tables = self.read()?;
        tables
            .stocks
            .get(&stock_id)
            .map(|row| Self::decode(stock_id, row))
            .transpose()
    }

    fn save(
        &self,
        stock: &Stock,
        events: &[StockEvent],
        expected: ExpectedVersion,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let stock_id = *AggregateRoot::id(stock);
        let pair = (stock.variant_id(), stock.warehouse_id());

        let mut tables = self.write()?;

        let current = tables.stocks.get(&stock_id);
        let actual = current.map(|row| row.version);
        if !expected.matches(actual) {
            return Err(RepositoryError::Concurrency {
                stock_id,
                expected,
                actual,
            });
        }

        if let Some(owner) = tables.by_variant_warehouse.get(&pair) {
            if *owner != stock_id {
                return Err(RepositoryError::Duplicate {
                    variant_id: pair.0,
                    warehouse_id: pair.1,
                });
            }
        }

        // Build everything fallible before touching the tables.
        let snapshot = serde_json::to_string(&stock.snapshot())
            .map_err(|e| RepositoryError::Serialization(format!("stock {stock_id}: {e}")))?;

        let mut sequence = current.map(|row| row.last_sequence).unwrap_or(0);
        let records = events
            .iter()
            .map(|event| {
                sequence += 1;
                OutboxRecord::from_event(stock_id, sequence, event)
            })
            .collect::<Result<Vec<_>, _>>()?;

        tables.stocks.insert(
            stock_id,
            StockRow {
                version: stock.version(),
                variant_id: pair.0,
                warehouse_id: pair.1,
                snapshot,
                last_sequence: sequence,
            },
        );
        tables.by_variant_warehouse.insert(pair, stock_id);
        for reservation in stock.reservations() {
            tables.reservations.insert(
                *reservation.id(),
                ReservationRow {
                    stock_id,
                    status: reservation.status(),
                    expires_at: reservation.expires_at(),
                    cart_id: reservation.external_cart_id(),
                },
            );
        }
        tables.outbox.extend(records.iter().cloned());

        Ok(records)
    }

    fn find_by_variant_and_warehouse(
        &self,
        variant_id: VariantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, RepositoryError> {
        let tables = self.read()?;
        let Some(stock_id) = tables.by_variant_warehouse.get(&(variant_id, warehouse_id)) else {
            return Ok(None);
        };
        tables
            .stocks
            .get(stock_id)
            .map(|row| Self::decode(*stock_id, row))
            .transpose()
    }

    fn list_by_variant(&self, variant_id: VariantId) -> Result<Vec<Stock>, RepositoryError> {
        let tables = self.read()?;
        Self::decode_all(
            tables
                .stocks
                .iter()
                .filter(|(_, row)| row.variant_id == variant_id),
        )
    }

    fn list_by_warehouse(&self, warehouse_id: WarehouseId) -> Result<Vec<Stock>, RepositoryError> {
        let tables = self.read()?;
        Self::decode_all(
            tables
                .stocks
                .iter()
                .filter(|(_, row)| row.warehouse_id == warehouse_id),
        )
    }

    fn find_stock_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<StockId>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables.reservations.get(&reservation_id).map(|row| row.stock_id))
    }

    fn find_pending_reservations_for_cart(
        &self,
        cart_id: CartId,
    ) -> Result<Vec<(StockId, ReservationId)>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .reservations
            .iter()
            .filter(|(_, row)| row.status == ReservationStatus::Pending && row.cart_id == Some(cart_id))
            .map(|(id, row)| (row.stock_id, *id))
            .collect())
    }

    fn find_expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredReservation>, RepositoryError> {
        let tables = self.read()?;
        let mut expired: Vec<ExpiredReservation> = tables
            .reservations
            .iter()
            .filter(|(_, row)| row.status == ReservationStatus::Pending)
            .filter_map(|(id, row)| {
                row.expires_at
                    .filter(|at| *at <= now)
                    .map(|expires_at| ExpiredReservation {
                        stock_id: row.stock_id,
                        reservation_id: *id,
                        expires_at,
                    })
            })
            .collect();
        expired.sort_by_key(|r| (r.expires_at, *r.reservation_id.as_uuid()));
        expired.truncate(limit);
        Ok(expired)
    }

    fn unpublished_events(&self, limit: usize) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables.outbox.iter().take(limit).cloned().collect())
    }

    fn unpublished_events_for_stock(
        &self,
        stock_id: StockId,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .outbox
            .iter()
            .filter(|r| r.stock_id == stock_id)
            .cloned()
            .collect())
    }

    fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), RepositoryError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let acked: HashSet<&Uuid> = event_ids.iter().collect();
        let mut tables = self.write()?;
        tables.outbox.retain(|r| !acked.contains(&r.event_id));
        Ok(())
    }
}

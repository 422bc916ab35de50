//! Stock persistence boundary.
//!
//! The port (`StockRepository`) commits an aggregate together with its outbox
//! events; adapters decide how. Only the in-memory adapter ships here.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryStockRepository;
pub use r#trait::{
    ExpiredReservation, OutboxRecord, RepositoryError, STOCK_AGGREGATE_TYPE, StockRepository,
};

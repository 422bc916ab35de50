//! Integration tests for the ledger pipeline under concurrency.
//!
//! Tests: Ledger → Locks → Repository (+ outbox) → EventBus, plus the sweeper
//!
//! Verifies:
//! - Concurrent reserve/decrease calls never oversell
//! - Ledgers with separate locks sharing one store (separate processes) never
//!   lose updates thanks to version checks
//! - Sweeper/user release races resolve to exactly one release
//! - Outbox events survive bus failures and are relayed later
//! - One failing reservation does not stop a sweep

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use stockledger_core::{
    AggregateRoot, CartId, Entity, ExpectedVersion, OrderId, ProductId, Quantity, VariantId,
    WarehouseId,
};
use stockledger_events::{Event, EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use stockledger_inventory::{
    AdjustStock, CreateStock, MovementReference, MovementType, ReleaseReservation,
    ReservationId, ReservationStatus, ReservationType, ReserveStock, Stock, StockError,
    StockEvent, StockId,
};

use crate::config::{LedgerConfig, SweeperConfig};
use crate::ledger::{LedgerError, StockLedger};
use crate::repository::{
    ExpiredReservation, InMemoryStockRepository, OutboxRecord, RepositoryError, StockRepository,
};
use crate::retry::RetryPolicy;
use crate::workers::ReservationSweeper;

type Envelope = EventEnvelope<StockEvent>;
type Bus = Arc<InMemoryEventBus<Envelope>>;
type Ledger<R = Arc<InMemoryStockRepository>, B = Bus> = StockLedger<R, B>;

fn init_tracing() {
    stockledger_observability::init_for_tests();
}

fn config() -> LedgerConfig {
    LedgerConfig::default()
        .with_lock_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::exponential(
            50,
            Duration::from_micros(200),
            Duration::from_millis(5),
        ))
}

fn setup() -> (Arc<Ledger>, Bus) {
    init_tracing();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let ledger = Arc::new(StockLedger::new(
        Arc::new(InMemoryStockRepository::new()),
        bus.clone(),
        config(),
    ));
    (ledger, bus)
}

fn create<R, B>(ledger: &Ledger<R, B>, initial_quantity: i64, low_stock_threshold: i64) -> StockId
where
    R: StockRepository,
    B: EventBus<Envelope>,
{
    let stock = ledger
        .create_stock(CreateStock {
            stock_id: StockId::generate(),
            product_id: ProductId::new(),
            variant_id: VariantId::new(),
            warehouse_id: WarehouseId::new(),
            initial_quantity,
            quantity_incoming: 0,
            low_stock_threshold,
            reorder_point: 0,
            occurred_at: Utc::now(),
        })
        .unwrap();
    *stock.id()
}

fn reserve_cmd(stock_id: StockId, quantity: i64, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ReserveStock {
    ReserveStock {
        stock_id,
        quantity,
        reservation_type: ReservationType::Cart,
        cart_id: Some(CartId::new()),
        order_id: None,
        expires_at,
        occurred_at: now,
    }
}

fn load(ledger: &Ledger, stock_id: StockId) -> Stock {
    ledger.get_stock(stock_id).unwrap().unwrap()
}

fn count_events(sub: &Subscription<Envelope>, event_type: &str) -> usize {
    sub.drain()
        .iter()
        .filter(|e| e.payload().event_type() == event_type)
        .count()
}

#[test]
fn concurrent_reservations_never_oversell() {
    let (ledger, _bus) = setup();
    let stock_id = create(&ledger, 100, 0);
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ledger.reserve_stock(reserve_cmd(stock_id, 10, None, Utc::now()))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::Stock(StockError::InsufficientStock { .. }))))
        .count();

    assert_eq!(succeeded, 10);
    assert_eq!(insufficient, 6);

    let stock = load(&ledger, stock_id);
    assert_eq!(stock.quantity_available(), Quantity::ZERO);
    assert_eq!(stock.quantity_reserved(), Quantity::from_units(100));
    stock.check_invariants().unwrap();
}

#[test]
fn mixed_decreases_and_reservations_account_for_every_unit() {
    let (ledger, _bus) = setup();
    let stock_id = create(&ledger, 500, 0);
    let accepted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ledger = ledger.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                for i in 0..40 {
                    let quantity = 1 + ((t * 7 + i * 3) % 9) as i64;
                    let result = if (t + i) % 2 == 0 {
                        ledger
                            .adjust_stock(AdjustStock::inferred(
                                stock_id,
                                MovementType::Sale,
                                quantity,
                                MovementReference::new("ORDER"),
                                Utc::now(),
                            ))
                            .map(|_| ())
                    } else {
                        ledger
                            .reserve_stock(reserve_cmd(stock_id, quantity, None, Utc::now()))
                            .map(|_| ())
                    };
                    match result {
                        Ok(()) => {
                            accepted.fetch_add(quantity as usize, Ordering::SeqCst);
                        }
                        Err(LedgerError::Stock(StockError::InsufficientStock { .. })) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stock = load(&ledger, stock_id);
    let taken = accepted.load(Ordering::SeqCst) as u64;
    assert!(taken <= 500);
    assert_eq!(stock.quantity_available().value(), 500 - taken);
    stock.check_invariants().unwrap();
}

#[test]
fn separate_processes_sharing_a_store_never_lose_updates() {
    init_tracing();
    let repo = Arc::new(InMemoryStockRepository::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    // Separate lock registries: only the version check coordinates them.
    let first = Arc::new(StockLedger::new(repo.clone(), bus.clone(), config()));
    let second = Arc::new(StockLedger::new(repo.clone(), bus.clone(), config()));
    let stock_id = create(&first, 0, 0);

    let handles: Vec<_> = [first.clone(), second.clone(), first, second]
        .into_iter()
        .map(|ledger| {
            thread::spawn(move || {
                for _ in 0..25 {
                    ledger
                        .adjust_stock(AdjustStock::inferred(
                            stock_id,
                            MovementType::Purchase,
                            2,
                            MovementReference::new("PURCHASE_ORDER"),
                            Utc::now(),
                        ))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stock = repo.load(stock_id).unwrap().unwrap();
    assert_eq!(stock.quantity_available(), Quantity::from_units(200));
    assert_eq!(stock.movements().len(), 100);
    assert_eq!(stock.version(), 101);
    stock.check_invariants().unwrap();
}

#[test]
fn sweeper_and_user_release_race_to_a_single_release() {
    init_tracing();
    let repo = Arc::new(InMemoryStockRepository::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let sub = bus.subscribe();
    let user_side = Arc::new(StockLedger::new(repo.clone(), bus.clone(), config()));
    let sweeper_side = Arc::new(StockLedger::new(repo.clone(), bus.clone(), config()));

    let past = Utc::now() - ChronoDuration::hours(1);
    let stock_id = create(&user_side, 20, 0);
    let reservation = user_side
        .reserve_stock(reserve_cmd(stock_id, 8, Some(past + ChronoDuration::minutes(15)), past))
        .unwrap();
    let reservation_id = *reservation.id();

    let barrier = Arc::new(Barrier::new(3));
    let sweepers: Vec<_> = (0..2)
        .map(|_| {
            let sweeper = ReservationSweeper::new(sweeper_side.clone(), SweeperConfig::default());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                sweeper.sweep_once(Utc::now()).unwrap()
            })
        })
        .collect();
    let user = {
        let ledger = user_side.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            ledger
                .release_reservation(ReleaseReservation {
                    reservation_id,
                    reason: "customer left".into(),
                    occurred_at: Utc::now(),
                })
                .unwrap()
        })
    };

    let swept: usize = sweepers.into_iter().map(|h| h.join().unwrap().expired).sum();
    let user_released = usize::from(user.join().unwrap());
    assert_eq!(swept + user_released, 1);

    let stock = repo.load(stock_id).unwrap().unwrap();
    assert_eq!(stock.quantity_available(), Quantity::from_units(20));
    assert_eq!(stock.quantity_reserved(), Quantity::ZERO);
    let status = stock.reservation(reservation_id).map(|r| r.status());
    // Released after its deadline either way.
    assert_eq!(status, Some(ReservationStatus::Expired));
    assert_eq!(count_events(&sub, "inventory.stock.released"), 1);
}

#[test]
fn concurrent_confirm_and_release_settle_once() {
    let (ledger, bus) = setup();
    let sub = bus.subscribe();
    let stock_id = create(&ledger, 30, 0);
    let reservation = ledger
        .reserve_stock(reserve_cmd(stock_id, 12, None, Utc::now()))
        .unwrap();
    let reservation_id = *reservation.id();

    let confirm = {
        let ledger = ledger.clone();
        thread::spawn(move || {
            ledger.confirm_reservation(stockledger_inventory::ConfirmReservation {
                reservation_id,
                order_id: OrderId::new(),
                performed_by: None,
                occurred_at: Utc::now(),
            })
        })
    };
    let release = {
        let ledger = ledger.clone();
        thread::spawn(move || {
            ledger.release_reservation(ReleaseReservation {
                reservation_id,
                reason: "payment failed".into(),
                occurred_at: Utc::now(),
            })
        })
    };

    let confirmed = confirm.join().unwrap();
    let released = release.join().unwrap().unwrap();
    let stock = load(&ledger, stock_id);

    match confirmed {
        Ok(()) => {
            assert!(!released);
            assert_eq!(stock.total_quantity(), Quantity::from_units(18));
        }
        Err(LedgerError::Stock(StockError::InvalidReservationTransition { .. })) => {
            assert!(released);
            assert_eq!(stock.total_quantity(), Quantity::from_units(30));
        }
        Err(other) => panic!("unexpected error: {other}"),
    }
    assert_eq!(stock.quantity_reserved(), Quantity::ZERO);
    stock.check_invariants().unwrap();

    let settled = sub
        .drain()
        .iter()
        .filter(|e| {
            matches!(
                e.payload(),
                StockEvent::ReservationConfirmed(_) | StockEvent::StockReleased(_)
            )
        })
        .count();
    assert_eq!(settled, 1);
}

/// Bus that rejects the first `failures` publishes.
#[derive(Debug)]
struct FlakyBus {
    inner: InMemoryEventBus<Envelope>,
    failures: AtomicUsize,
}

impl EventBus<Envelope> for FlakyBus {
    type Error = &'static str;

    fn publish(&self, message: Envelope) -> Result<(), Self::Error> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err("broker unavailable");
        }
        self.inner.publish(message).map_err(|_| "inner bus poisoned")
    }

    fn subscribe(&self) -> Subscription<Envelope> {
        self.inner.subscribe()
    }
}

#[test]
fn outbox_keeps_events_until_the_bus_accepts_them() -> anyhow::Result<()> {
    init_tracing();
    let repo = Arc::new(InMemoryStockRepository::new());
    let bus = Arc::new(FlakyBus {
        inner: InMemoryEventBus::new(),
        failures: AtomicUsize::new(2),
    });
    let sub = bus.subscribe();
    let ledger = StockLedger::new(repo.clone(), bus.clone(), config());

    // Both commits succeed even though publication fails.
    let stock_id = create(&ledger, 10, 5);
    ledger.adjust_stock(AdjustStock::inferred(
        stock_id,
        MovementType::Damage,
        6,
        MovementReference::new("AUDIT"),
        Utc::now(),
    ))?;
    assert!(sub.drain().is_empty());

    let pending = repo.unpublished_events(10)?;
    let types: Vec<_> = pending.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "inventory.stock.created",
            "inventory.stock.adjusted",
            "inventory.stock.low_stock_alert",
        ]
    );

    assert_eq!(ledger.flush_outbox()?, 3);
    assert_eq!(ledger.flush_outbox()?, 0);

    let delivered: Vec<u64> = sub.drain().iter().map(|e| e.sequence_number()).collect();
    assert_eq!(delivered, vec![1, 2, 3]);
    assert!(repo.unpublished_events(10)?.is_empty());
    Ok(())
}

#[test]
fn events_after_a_failed_publish_never_overtake_it() -> anyhow::Result<()> {
    init_tracing();
    let repo = Arc::new(InMemoryStockRepository::new());
    let bus = Arc::new(FlakyBus {
        inner: InMemoryEventBus::new(),
        failures: AtomicUsize::new(1),
    });
    let sub = bus.subscribe();
    let ledger = StockLedger::new(repo.clone(), bus.clone(), config());

    // The creation event is rejected by the bus.
    let stock_id = create(&ledger, 10, 0);
    assert!(sub.drain().is_empty());
    assert_eq!(repo.unpublished_events_for_stock(stock_id)?.len(), 1);

    // The next commit relays the backlog first, then its own event.
    ledger.adjust_stock(AdjustStock::inferred(
        stock_id,
        MovementType::Damage,
        1,
        MovementReference::new("AUDIT"),
        Utc::now(),
    ))?;
    assert_eq!(ledger.flush_outbox()?, 0);

    let delivered: Vec<u64> = sub.drain().iter().map(|e| e.sequence_number()).collect();
    assert_eq!(delivered, vec![1, 2]);
    assert_eq!(repo.outbox_len(), 0);
    Ok(())
}

#[test]
fn concurrent_writers_publish_each_stock_in_sequence() {
    let (ledger, bus) = setup();
    let sub = bus.subscribe();
    let stock_id = create(&ledger, 1_000, 0);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    ledger
                        .adjust_stock(AdjustStock::inferred(
                            stock_id,
                            MovementType::Sale,
                            1,
                            MovementReference::default(),
                            Utc::now(),
                        ))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let delivered: Vec<u64> = sub.drain().iter().map(|e| e.sequence_number()).collect();
    assert_eq!(delivered, (1..=81).collect::<Vec<u64>>());
}

/// Repository whose `load` fails for one stock.
struct FailingLoads {
    inner: Arc<InMemoryStockRepository>,
    broken: StockId,
}

impl StockRepository for FailingLoads {
    fn load(&self, stock_id: StockId) -> Result<Option<Stock>, RepositoryError> {
        if stock_id == self.broken {
            return Err(RepositoryError::Storage("row unreadable".into()));
        }
        self.inner.load(stock_id)
    }

    fn save(
        &self,
        stock: &Stock,
        events: &[StockEvent],
        expected: ExpectedVersion,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        self.inner.save(stock, events, expected)
    }

    fn find_by_variant_and_warehouse(
        &self,
        variant_id: VariantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, RepositoryError> {
        self.inner.find_by_variant_and_warehouse(variant_id, warehouse_id)
    }

    fn list_by_variant(&self, variant_id: VariantId) -> Result<Vec<Stock>, RepositoryError> {
        self.inner.list_by_variant(variant_id)
    }

    fn list_by_warehouse(&self, warehouse_id: WarehouseId) -> Result<Vec<Stock>, RepositoryError> {
        self.inner.list_by_warehouse(warehouse_id)
    }

    fn find_stock_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<StockId>, RepositoryError> {
        self.inner.find_stock_for_reservation(reservation_id)
    }

    fn find_pending_reservations_for_cart(
        &self,
        cart_id: CartId,
    ) -> Result<Vec<(StockId, ReservationId)>, RepositoryError> {
        self.inner.find_pending_reservations_for_cart(cart_id)
    }

    fn find_expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredReservation>, RepositoryError> {
        self.inner.find_expired_pending_reservations(now, limit)
    }

    fn unpublished_events(&self, limit: usize) -> Result<Vec<OutboxRecord>, RepositoryError> {
        self.inner.unpublished_events(limit)
    }

    fn unpublished_events_for_stock(
        &self,
        stock_id: StockId,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        self.inner.unpublished_events_for_stock(stock_id)
    }

    fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), RepositoryError> {
        self.inner.mark_published(event_ids)
    }
}

#[test]
fn sweep_continues_past_a_failing_reservation() {
    init_tracing();
    let repo = Arc::new(InMemoryStockRepository::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let healthy = StockLedger::new(repo.clone(), bus.clone(), config());

    let past = Utc::now() - ChronoDuration::hours(1);
    let deadline = Some(past + ChronoDuration::minutes(15));
    let good = create(&healthy, 10, 0);
    let bad = create(&healthy, 10, 0);
    for stock_id in [good, bad] {
        healthy
            .reserve_stock(reserve_cmd(stock_id, 3, deadline, past))
            .unwrap();
    }

    let flaky = Arc::new(StockLedger::new(
        FailingLoads {
            inner: repo.clone(),
            broken: bad,
        },
        bus,
        config(),
    ));
    let report = ReservationSweeper::new(flaky, SweeperConfig::default())
        .sweep_once(Utc::now())
        .unwrap();

    assert_eq!(report.found, 2);
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 1);

    let good_stock = repo.load(good).unwrap().unwrap();
    assert_eq!(good_stock.quantity_available(), Quantity::from_units(10));
    let bad_stock = repo.load(bad).unwrap().unwrap();
    assert_eq!(bad_stock.quantity_reserved(), Quantity::from_units(3));

    // The next sweep with a healthy store picks it up.
    let report = ReservationSweeper::new(Arc::new(healthy), SweeperConfig::default())
        .sweep_once(Utc::now())
        .unwrap();
    assert_eq!(report.expired, 1);
}

#[test]
fn queries_cover_variant_and_warehouse() {
    let (ledger, _bus) = setup();
    let variant_id = VariantId::new();
    let main = WarehouseId::new();
    let overflow = WarehouseId::new();

    for (warehouse_id, qty) in [(main, 3), (overflow, 40)] {
        ledger
            .create_stock(CreateStock {
                stock_id: StockId::generate(),
                product_id: ProductId::new(),
                variant_id,
                warehouse_id,
                initial_quantity: qty,
                quantity_incoming: 0,
                low_stock_threshold: 5,
                reorder_point: 10,
                occurred_at: Utc::now(),
            })
            .unwrap();
    }

    assert_eq!(ledger.stocks_for_variant(variant_id).unwrap().len(), 2);
    let low = ledger.low_stock_in_warehouse(main).unwrap();
    assert_eq!(low.len(), 1);
    assert!(ledger.low_stock_in_warehouse(overflow).unwrap().is_empty());

    let found = ledger.find_stock(variant_id, overflow).unwrap().unwrap();
    assert_eq!(found.quantity_available(), Quantity::from_units(40));
    assert!(ledger.find_stock(VariantId::new(), main).unwrap().is_none());
}

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::thread;

use stockledger_core::{AggregateRoot, CartId, OrderId, ProductId, VariantId, WarehouseId};
use stockledger_events::{EventEnvelope, InMemoryEventBus};
use stockledger_infra::{
    InMemoryStockRepository, LedgerConfig, ReservationSweeper, StockLedger, SweeperConfig,
};
use stockledger_inventory::{
    AdjustStock, CreateStock, MovementReference, MovementType, ReleaseReservation,
    ReservationType, ReserveStock, StockEvent, StockId,
};

type Ledger =
    StockLedger<Arc<InMemoryStockRepository>, Arc<InMemoryEventBus<EventEnvelope<StockEvent>>>>;

fn ledger() -> Arc<Ledger> {
    Arc::new(StockLedger::new(
        Arc::new(InMemoryStockRepository::new()),
        Arc::new(InMemoryEventBus::new()),
        LedgerConfig::default(),
    ))
}

fn create_stock(ledger: &Ledger, initial_quantity: i64) -> StockId {
    let stock = ledger
        .create_stock(CreateStock {
            stock_id: StockId::generate(),
            product_id: ProductId::new(),
            variant_id: VariantId::new(),
            warehouse_id: WarehouseId::new(),
            initial_quantity,
            quantity_incoming: 0,
            low_stock_threshold: 0,
            reorder_point: 0,
            occurred_at: Utc::now(),
        })
        .unwrap();
    *stock.id()
}

fn bench_command_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_latency");
    group.sample_size(200);

    group.bench_function("adjust_stock_purchase", |b| {
        let ledger = ledger();
        let stock_id = create_stock(&ledger, 0);
        b.iter(|| {
            ledger
                .adjust_stock(AdjustStock::inferred(
                    stock_id,
                    MovementType::Purchase,
                    black_box(1),
                    MovementReference::new("PURCHASE_ORDER"),
                    Utc::now(),
                ))
                .unwrap()
        });
    });

    group.bench_function("reserve_then_release", |b| {
        let ledger = ledger();
        let stock_id = create_stock(&ledger, 1_000_000);
        b.iter(|| {
            let reservation = ledger
                .reserve_stock(ReserveStock {
                    stock_id,
                    quantity: black_box(1),
                    reservation_type: ReservationType::Order,
                    cart_id: None,
                    order_id: Some(OrderId::new()),
                    expires_at: None,
                    occurred_at: Utc::now(),
                })
                .unwrap();
            ledger
                .release_reservation(ReleaseReservation {
                    reservation_id: *stockledger_core::Entity::id(&reservation),
                    reason: "bench".into(),
                    occurred_at: Utc::now(),
                })
                .unwrap()
        });
    });

    group.finish();
}

fn bench_contended_reservations(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_reservations");
    group.sample_size(20);

    for threads in [2usize, 4, 8].iter() {
        let per_thread = 50usize;
        group.throughput(Throughput::Elements((*threads * per_thread) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            b.iter(|| {
                let ledger = ledger();
                let stock_id = create_stock(&ledger, (threads * per_thread) as i64);
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let ledger = ledger.clone();
                        thread::spawn(move || {
                            for _ in 0..per_thread {
                                ledger
                                    .reserve_stock(ReserveStock {
                                        stock_id,
                                        quantity: 1,
                                        reservation_type: ReservationType::Cart,
                                        cart_id: Some(CartId::new()),
                                        order_id: None,
                                        expires_at: None,
                                        occurred_at: Utc::now(),
                                    })
                                    .unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_expiry_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("expiry_sweep");
    group.sample_size(20);

    for expired in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*expired as u64));
        group.bench_with_input(BenchmarkId::from_parameter(expired), expired, |b, &expired| {
            b.iter_with_setup(
                || {
                    let ledger = ledger();
                    let stock_id = create_stock(&ledger, expired as i64);
                    let past = Utc::now() - ChronoDuration::hours(1);
                    for _ in 0..expired {
                        ledger
                            .reserve_stock(ReserveStock {
                                stock_id,
                                quantity: 1,
                                reservation_type: ReservationType::Cart,
                                cart_id: Some(CartId::new()),
                                order_id: None,
                                expires_at: Some(past + ChronoDuration::minutes(15)),
                                occurred_at: past,
                            })
                            .unwrap();
                    }
                    ReservationSweeper::new(ledger, SweeperConfig::default())
                },
                |sweeper| sweeper.sweep_once(Utc::now()).unwrap(),
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_latency,
    bench_contended_reservations,
    bench_expiry_sweep
);
criterion_main!(benches);

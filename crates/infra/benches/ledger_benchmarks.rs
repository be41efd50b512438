use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use chronicle_core::AggregateId;
use chronicle_events::{Event, EventEnvelope, InMemoryEventBus};
use chronicle_infra::command_dispatcher::CommandDispatcher;
use chronicle_infra::event_store::{EventStore, InMemoryEventStore, NewEvent, StoredEvent};
use chronicle_infra::projections::{OrderStatusProjection, ProjectionApplier};
use chronicle_infra::read_model::InMemoryOrderViewStore;
use chronicle_infra::replay::fold_history;
use chronicle_infra::retry::{BackoffPolicy, InMemoryRetryStore, RetryStore};
use chronicle_orders::{CreateOrder, Order, OrderCommand, OrderCreated, OrderEvent, OrderId, OrderPaid, order_registry};

fn runtime() -> Runtime {
    Runtime::new().unwrap()
}

fn order_id(n: usize) -> OrderId {
    OrderId::new(AggregateId::new(format!("order-{n}")).unwrap())
}

fn created(n: usize) -> OrderEvent {
    OrderEvent::Created(OrderCreated {
        order_id: order_id(n),
        occurred_at: Utc::now(),
    })
}

fn paid(n: usize) -> OrderEvent {
    OrderEvent::Paid(OrderPaid {
        order_id: order_id(n),
        occurred_at: Utc::now(),
    })
}

fn stored(n: usize, version: u64, event: &OrderEvent) -> StoredEvent {
    StoredEvent {
        aggregate_id: order_id(n).as_aggregate_id().clone(),
        version,
        event_type: event.event_type().to_string(),
        payload: event.encode_payload().unwrap(),
        occurred_at: Utc::now(),
    }
}

fn bench_command_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_dispatch");
    let rt = runtime();
    let registry = order_registry().unwrap();

    group.bench_function("create_order_fresh", |b| {
        let dispatcher = CommandDispatcher::new(Arc::new(InMemoryEventStore::new()), Arc::new(InMemoryEventBus::new()));
        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            let command = OrderCommand::Create(CreateOrder {
                order_id: order_id(n),
                occurred_at: Utc::now(),
            });
            rt.block_on(dispatcher.dispatch(command, |id| Order::empty(OrderId::new(id.clone())), &registry))
                .unwrap();
        });
    });

    group.finish();
}

fn bench_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_append_throughput");
    let rt = runtime();

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("batch_append", batch_size), &batch_size, |b, &size| {
            let store = InMemoryEventStore::new();
            let aggregate_id = AggregateId::new("bench-stream").unwrap();
            let mut version = 0u64;

            b.iter(|| {
                let events: Vec<NewEvent> = (0..size)
                    .map(|i| NewEvent {
                        event_type: "bench.tick".to_string(),
                        payload: format!("{{\"i\":{i}}}").into_bytes(),
                        occurred_at: Utc::now(),
                    })
                    .collect();

                let committed = rt.block_on(store.append(&aggregate_id, version, events)).unwrap();
                version += committed.len() as u64;
                black_box(committed);
            });
        });
    }

    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_rebuild");
    let registry = order_registry().unwrap();

    // Orders accept one payment; longer streams repeat the paid event to measure
    // per-event decode + apply cost.
    for event_count in [2u64, 10, 100, 1000] {
        let history: Vec<StoredEvent> = std::iter::once(stored(0, 1, &created(0)))
            .chain((2..=event_count).map(|v| stored(0, v, &paid(0))))
            .collect();
        let aggregate_id = order_id(0).as_aggregate_id().clone();

        group.throughput(Throughput::Elements(event_count));
        group.bench_with_input(BenchmarkId::new("fold_history", event_count), &history, |b, history| {
            b.iter(|| {
                let order = Order::empty(order_id(0));
                black_box(fold_history(&aggregate_id, order, &registry, history).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_projection_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_apply");
    let rt = runtime();

    for orders in [10usize, 100, 1000] {
        let envelopes: Vec<EventEnvelope> = (0..orders)
            .flat_map(|n| [stored(n, 1, &created(n)), stored(n, 2, &paid(n))])
            .map(|s| s.to_envelope())
            .collect();

        group.throughput(Throughput::Elements(envelopes.len() as u64));
        group.bench_with_input(BenchmarkId::new("order_status", orders), &envelopes, |b, envelopes| {
            b.iter(|| {
                let projection = OrderStatusProjection::new(Arc::new(InMemoryOrderViewStore::new()), order_registry().unwrap());
                rt.block_on(async {
                    for envelope in envelopes {
                        projection.apply(black_box(envelope)).await.unwrap();
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_retry_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_claim_due");
    let rt = runtime();
    let policy = BackoffPolicy::new(Duration::from_secs(1), 5);

    for pending in [100usize, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("claim_100", pending), &pending, |b, &pending| {
            let store = InMemoryRetryStore::new();
            let now = Utc::now();
            rt.block_on(async {
                for n in 0..pending {
                    let envelope = stored(n, 1, &created(n)).to_envelope();
                    store.record_failure(&envelope, "bench", &policy, now).await.unwrap();
                }
            });
            let due = now + chrono::Duration::seconds(60);
            let mut owner = 0u64;

            b.iter(|| {
                // Zero lease: every pass re-claims the same oldest slice.
                owner += 1;
                let claimed = rt
                    .block_on(store.claim_due(&format!("sweeper-{owner}"), due, 100, Duration::from_secs(0)))
                    .unwrap();
                black_box(claimed);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_dispatch,
    bench_append_throughput,
    bench_rebuild,
    bench_projection_apply,
    bench_retry_claim
);
criterion_main!(benches);

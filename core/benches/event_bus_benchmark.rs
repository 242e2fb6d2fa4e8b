/// EventBus Performance Benchmarks using Criterion
///
/// Run with: cargo bench --bench event_bus_benchmark
///
/// Benchmarks cover:
/// - Single publisher throughput with synchronous subscribers
/// - Concurrent publishers with an asynchronous subscriber
/// - Middleware chain overhead
/// - Fan-out to many subscribers
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use conduit_core::{
    handler_fn, DedupCache, DeduplicationMiddleware, Event, EventBus, EventData, EventHandler,
    EventType, LoggingMiddleware, RecoveryMiddleware, Subscriber,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn make_event(id: u64) -> Event {
    Event::new(EventType::TaskProgress, EventData::Empty)
        .with_id(format!("evt_{}", id))
        .with_source("benchmark")
}

fn counting_handler(counter: &Arc<AtomicU64>) -> Arc<dyn EventHandler> {
    let counter = Arc::clone(counter);
    handler_fn(move |_event| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    })
}

/// Benchmark: Single publisher, one synchronous subscriber
fn bench_single_publisher(c: &mut Criterion) {
    let mut group = c.benchmark_group("eventbus_single_publisher");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for event_count in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*event_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(event_count),
            event_count,
            |b, &count| {
                b.to_async(&rt).iter(|| async move {
                    let bus = EventBus::new();
                    let counter = Arc::new(AtomicU64::new(0));
                    bus.subscribe("task", Subscriber::new("sink", counting_handler(&counter)))
                        .await
                        .unwrap();

                    for i in 0..count {
                        bus.publish("task", make_event(i)).await.unwrap();
                    }
                    black_box(counter.load(Ordering::Relaxed));
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Multiple publishers, one asynchronous subscriber
fn bench_concurrent_publishers(c: &mut Criterion) {
    let mut group = c.benchmark_group("eventbus_concurrent_publishers");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let events_per_publisher = 250u64;

    for publishers in [2u64, 4, 8].iter() {
        group.throughput(Throughput::Elements(events_per_publisher * publishers));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_publishers", publishers)),
            publishers,
            |b, &publishers| {
                b.to_async(&rt).iter(|| async move {
                    let bus = Arc::new(EventBus::new());
                    let counter = Arc::new(AtomicU64::new(0));
                    bus.subscribe(
                        "task",
                        Subscriber::new("sink", counting_handler(&counter)).asynchronous(),
                    )
                    .await
                    .unwrap();

                    let mut handles = Vec::new();
                    for p in 0..publishers {
                        let bus = Arc::clone(&bus);
                        handles.push(tokio::spawn(async move {
                            for i in 0..events_per_publisher {
                                let id = p * events_per_publisher + i;
                                bus.publish("task", make_event(id)).await.unwrap();
                            }
                        }));
                    }
                    for h in handles {
                        h.await.unwrap();
                    }
                    bus.shutdown(Duration::from_secs(10)).await.unwrap();
                    black_box(counter.load(Ordering::Relaxed));
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Cost of the default middleware chain
fn bench_middleware_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("eventbus_middleware");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let event_count = 1_000u64;
    group.throughput(Throughput::Elements(event_count));

    for with_chain in [false, true] {
        let label = if with_chain { "recovery_logging_dedup" } else { "bare" };
        group.bench_function(label, |b| {
            b.to_async(&rt).iter(|| async move {
                let bus = EventBus::new();
                if with_chain {
                    bus.use_middleware(Arc::new(RecoveryMiddleware::new())).await;
                    bus.use_middleware(Arc::new(LoggingMiddleware::new())).await;
                    let cache = Arc::new(DedupCache::new(Duration::from_secs(300)));
                    bus.use_middleware(Arc::new(DeduplicationMiddleware::new(cache)))
                        .await;
                }
                let counter = Arc::new(AtomicU64::new(0));
                bus.subscribe("task", Subscriber::new("sink", counting_handler(&counter)))
                    .await
                    .unwrap();

                for i in 0..event_count {
                    bus.publish("task", make_event(i)).await.unwrap();
                }
                black_box(counter.load(Ordering::Relaxed));
            });
        });
    }

    group.finish();
}

/// Benchmark: Multiple subscribers on same topic
fn bench_multiple_subscribers(c: &mut Criterion) {
    let mut group = c.benchmark_group("eventbus_multiple_subscribers");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let event_count = 500u64;

    for sub_count in [2u64, 5, 10].iter() {
        group.throughput(Throughput::Elements(event_count * *sub_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_subs", sub_count)),
            sub_count,
            |b, &subs| {
                b.to_async(&rt).iter(|| async move {
                    let bus = EventBus::new();
                    let counter = Arc::new(AtomicU64::new(0));
                    for s in 0..subs {
                        bus.subscribe(
                            "task",
                            Subscriber::new(format!("sub_{}", s), counting_handler(&counter))
                                .with_priority(s as i32),
                        )
                        .await
                        .unwrap();
                    }

                    for i in 0..event_count {
                        bus.publish("task", make_event(i)).await.unwrap();
                    }
                    black_box(counter.load(Ordering::Relaxed));
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_publisher,
    bench_concurrent_publishers,
    bench_middleware_chain,
    bench_multiple_subscribers,
);
criterion_main!(benches);

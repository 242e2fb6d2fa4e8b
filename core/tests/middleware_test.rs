use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{
    handler_fn, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMiddleware, ConduitError,
    DedupCache, DeduplicationMiddleware, Event, EventBus, EventData, EventHandler, EventType,
    FilterMiddleware, LoggingMiddleware, MetricsMiddleware, Middleware, RecoveryMiddleware,
    Result, RetryMiddleware, Subscriber, TimeoutMiddleware,
};
use tokio_util::sync::CancellationToken;

fn make_event(id: &str) -> Event {
    Event::new(EventType::ToolInvoked, EventData::Empty).with_id(id)
}

fn counter(hits: &Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
    let hits = Arc::clone(hits);
    handler_fn(move |_event| {
        let hits = Arc::clone(&hits);
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

// Fails the first `failures` calls, then succeeds
fn flaky(failures: usize, calls: &Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
    let calls = Arc::clone(calls);
    handler_fn(move |_event| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(ConduitError::handler(format!("attempt {n} failed")))
            } else {
                Ok(())
            }
        }
    })
}

// Pushes its tag before and after the inner handler
struct Tagging {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

struct TaggingHandler {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    next: Arc<dyn EventHandler>,
}

impl Middleware for Tagging {
    fn name(&self) -> &'static str {
        self.tag
    }

    fn wrap(&self, _subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(TaggingHandler {
            tag: self.tag,
            log: Arc::clone(&self.log),
            next,
        })
    }
}

#[async_trait]
impl EventHandler for TaggingHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        self.log.lock().unwrap().push(format!("{}>", self.tag));
        let res = self.next.handle(event).await;
        self.log.lock().unwrap().push(format!("<{}", self.tag));
        res
    }
}

#[tokio::test]
async fn first_registered_middleware_is_outermost() -> Result<()> {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    for tag in ["a", "b"] {
        bus.use_middleware(Arc::new(Tagging {
            tag,
            log: Arc::clone(&log),
        }))
        .await;
    }
    let hits = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("s", counter(&hits)))
        .await?;

    bus.publish("tool", make_event("e1")).await?;
    assert_eq!(*log.lock().unwrap(), vec!["a>", "b>", "<b", "<a"]);
    Ok(())
}

#[tokio::test]
async fn dedup_delivers_same_event_once_per_subscriber() -> Result<()> {
    let bus = EventBus::new();
    let cache = Arc::new(DedupCache::new(Duration::from_secs(300)));
    bus.use_middleware(Arc::new(DeduplicationMiddleware::new(Arc::clone(&cache))))
        .await;

    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("a", counter(&a))).await?;
    bus.subscribe("tool", Subscriber::new("b", counter(&b))).await?;

    bus.publish("tool", make_event("same-id")).await?;
    bus.publish("tool", make_event("same-id")).await?;

    // fan-out is not a duplicate, the second publish is
    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 2);

    bus.publish("tool", make_event("other-id")).await?;
    assert_eq!(a.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn recovery_turns_panic_into_error() -> Result<()> {
    let bus = EventBus::new();
    bus.use_middleware(Arc::new(RecoveryMiddleware::new())).await;

    let panicking = handler_fn(|event| async move {
        if event.id == "e1" {
            panic!("subscriber exploded");
        }
        Ok(())
    });
    let hits = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("panics", panicking).with_priority(1))
        .await?;
    bus.subscribe("tool", Subscriber::new("fine", counter(&hits)))
        .await?;

    let err = bus.publish("tool", make_event("e1")).await.unwrap_err();
    match err {
        ConduitError::Delivery { first, .. } => match *first {
            ConduitError::HandlerPanic(msg) => assert!(msg.contains("subscriber exploded")),
            other => panic!("unexpected inner error: {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn retry_recovers_flaky_handler() -> Result<()> {
    let bus = EventBus::new();
    bus.use_middleware(Arc::new(RetryMiddleware::new(3, Duration::from_millis(5))))
        .await;
    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("flaky", flaky(2, &calls)))
        .await?;

    bus.publish("tool", make_event("e1")).await?;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn retry_gives_up_after_attempts() {
    let bus = EventBus::new();
    bus.use_middleware(Arc::new(RetryMiddleware::new(2, Duration::from_millis(1))))
        .await;
    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("flaky", flaky(10, &calls)))
        .await
        .unwrap();

    assert!(bus.publish("tool", make_event("e1")).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_stops_when_cancelled() {
    let token = CancellationToken::new();
    let retry = RetryMiddleware::new(5, Duration::from_secs(60)).with_cancellation(token.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = retry.wrap("s", flaky(10, &calls));

    let task = tokio::spawn(async move { handler.handle(Arc::new(make_event("e1"))).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let res = task.await.unwrap();
    assert!(matches!(res, Err(ConduitError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_fails_slow_handler() {
    let slow = handler_fn(|_event| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    });
    let handler = TimeoutMiddleware::new(Duration::from_millis(100)).wrap("s", slow);

    let res = handler.handle(Arc::new(make_event("e1"))).await;
    assert!(matches!(res, Err(ConduitError::Timeout(_))));
}

#[tokio::test]
async fn filter_middleware_skips_quietly() -> Result<()> {
    let bus = EventBus::new();
    bus.use_middleware(Arc::new(FilterMiddleware::new(|e: &Event| {
        e.source != "noisy"
    })))
    .await;
    let hits = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("s", counter(&hits)))
        .await?;

    bus.publish("tool", make_event("e1").with_source("noisy"))
        .await?;
    bus.publish("tool", make_event("e2").with_source("quiet"))
        .await?;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn metrics_middleware_counts_per_event_type() -> Result<()> {
    let bus = EventBus::new();
    let metrics = MetricsMiddleware::new();
    bus.use_middleware(Arc::new(LoggingMiddleware::new())).await;
    bus.use_middleware(Arc::new(metrics.clone())).await;

    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("flaky", flaky(1, &calls)))
        .await?;

    let _ = bus.publish("tool", make_event("e1")).await;
    bus.publish("tool", make_event("e2")).await?;
    bus.publish(
        "tool",
        Event::new(EventType::ToolCompleted, EventData::Empty),
    )
    .await?;

    let snapshot = metrics.snapshot();
    let invoked = &snapshot["tool.invoked"];
    assert_eq!(invoked.count, 2);
    assert_eq!(invoked.errors, 1);
    assert_eq!(snapshot["tool.completed"].count, 1);
    Ok(())
}

#[tokio::test]
async fn circuit_breaker_middleware_fails_fast_once_open() -> Result<()> {
    let bus = EventBus::new();
    let breaker = Arc::new(CircuitBreaker::new(
        "tool-sink",
        CircuitBreakerConfig::default()
            .with_max_failures(2)
            .with_reset_timeout(Duration::from_secs(60)),
    ));
    bus.use_middleware(Arc::new(CircuitBreakerMiddleware::new(Arc::clone(&breaker))))
        .await;
    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tool", Subscriber::new("down", flaky(100, &calls)))
        .await?;

    for i in 0..4 {
        let _ = bus.publish("tool", make_event(&format!("e{i}"))).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.metrics().await.rejected, 2);
    Ok(())
}

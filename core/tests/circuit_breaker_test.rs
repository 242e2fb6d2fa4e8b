use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPool, CircuitState, ConduitError, Result,
};

fn config(max_failures: u32, reset: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_max_failures(max_failures)
        .with_reset_timeout(reset)
}

async fn call(breaker: &CircuitBreaker, calls: &AtomicUsize, fail: bool) -> Result<u32> {
    breaker
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err(ConduitError::handler("dependency down"))
            } else {
                Ok(42)
            }
        })
        .await
}

#[tokio::test]
async fn opens_after_max_failures_and_fails_fast() {
    let breaker = CircuitBreaker::new("payments", config(3, Duration::from_secs(60)));
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        assert!(matches!(
            call(&breaker, &calls, true).await,
            Err(ConduitError::Handler(_))
        ));
    }
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = call(&breaker, &calls, false).await.unwrap_err();
    assert!(matches!(err, ConduitError::CircuitOpen(ref name) if name == "payments"));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "fn must not run while open");

    let metrics = breaker.metrics().await;
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.failures_total, 3);
    assert_eq!(metrics.total_calls, 4);
    assert!(metrics.last_failure_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn half_open_success_closes() -> Result<()> {
    let breaker = CircuitBreaker::new("search", config(2, Duration::from_secs(10)));
    let calls = AtomicUsize::new(0);
    let _ = call(&breaker, &calls, true).await;
    let _ = call(&breaker, &calls, true).await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(call(&breaker, &calls, false).await.is_err());

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(call(&breaker, &calls, false).await?, 42);
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.failures().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_one_trial_at_a_time() {
    let breaker = Arc::new(CircuitBreaker::new(
        "llm",
        config(1, Duration::from_millis(100)).with_call_timeout(None),
    ));
    let calls = AtomicUsize::new(0);
    let _ = call(&breaker, &calls, true).await;
    tokio::time::advance(Duration::from_millis(150)).await;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let trial = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .execute(|| async {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    // second caller while the trial is in flight
    assert!(matches!(
        call(&breaker, &calls, false).await,
        Err(ConduitError::CircuitOpen(_))
    ));

    release_tx.send(()).unwrap();
    trial.await.unwrap().unwrap();
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn pool_get_or_create_is_memoized() {
    let pool = Arc::new(CircuitBreakerPool::new());
    let mut handles = Vec::new();
    for _ in 0..16 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            pool.get_or_create("shared", CircuitBreakerConfig::default())
        }));
    }
    let first = pool.get_or_create("shared", CircuitBreakerConfig::default());
    for h in handles {
        assert!(Arc::ptr_eq(&first, &h.await.unwrap()));
    }
    assert_eq!(pool.names(), vec!["shared"]);
}

#[tokio::test]
async fn pool_reset_all_closes_every_breaker() {
    let pool = CircuitBreakerPool::new();
    let calls = AtomicUsize::new(0);
    for name in ["a", "b"] {
        let breaker = pool.get_or_create(name, config(1, Duration::from_secs(60)));
        let _ = call(&breaker, &calls, true).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    pool.reset_all().await;
    for m in pool.metrics().await {
        assert_eq!(m.state, CircuitState::Closed);
        assert_eq!(m.failures, 0);
    }

    assert!(pool.reset("missing").await.is_err());
    assert!(pool.remove("a").is_some());
    assert!(pool.get("a").is_none());
}

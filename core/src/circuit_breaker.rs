//! Circuit breaker state machine and a pool of named breakers.
//!
//! Closed passes calls through and counts failures. After `max_failures` the
//! breaker trips Open and rejects calls without running them. Once
//! `reset_timeout` has passed a trial call is let through (HalfOpen): success
//! closes the circuit, failure reopens it.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::event_bus::EventHandler;
use crate::middleware::Middleware;
use crate::{ConduitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures that trip a closed circuit
    pub max_failures: u32,

    /// Per-call limit; an expired call counts as a failure
    pub call_timeout: Option<Duration>,

    /// Time spent open before a trial call is allowed
    pub reset_timeout: Duration,

    /// Concurrent trial calls allowed while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            call_timeout: Some(Duration::from_secs(30)),
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls.max(1);
        self
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// Current failure counter
    pub failures: u32,
    pub total_calls: u64,
    pub successes: u64,
    pub failures_total: u64,
    /// Calls refused without running
    pub rejected: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    changed_at: Instant,
    changed_at_wall: DateTime<Utc>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure_at: None,
            changed_at: Instant::now(),
            changed_at_wall: Utc::now(),
        }
    }
}

/// Fault isolation for one named dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    trials: Arc<AtomicU32>,
    total_calls: AtomicU64,
    successes: AtomicU64,
    failures_total: AtomicU64,
    rejected: AtomicU64,
}

// Releases a half-open trial slot, including when the call future is dropped.
struct TrialPermit(Arc<AtomicU32>);

impl Drop for TrialPermit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
            trials: Arc::new(AtomicU32::new(0)),
            total_calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` under the breaker.
    ///
    /// Fails with [`ConduitError::CircuitOpen`] without calling `f` while the
    /// circuit is open, or while half-open with every trial slot taken.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let _permit = self.admit().await?;

        let res = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(res) => res,
                Err(_) => Err(ConduitError::Timeout(limit)),
            },
            None => f().await,
        };

        match &res {
            Ok(_) => self.record_success().await,
            Err(err) => {
                debug!(target: "circuit_breaker", breaker = %self.name, error = %err, "Call failed");
                self.record_failure().await;
            }
        }
        res
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failures(&self) -> u32 {
        self.inner.lock().await.failures
    }

    /// Force the circuit closed with zero failures
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            info!(target: "circuit_breaker", breaker = %self.name, from = %inner.state, "Circuit reset");
        }
        *inner = BreakerState::closed();
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock().await;
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_failure_at: inner.last_failure_at,
            state_changed_at: inner.changed_at_wall,
        }
    }

    async fn admit(&self) -> Result<Option<TrialPermit>> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => return Ok(None),
            CircuitState::Open => {
                if inner.changed_at.elapsed() > self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                } else {
                    drop(inner);
                    return Err(self.reject());
                }
            }
            CircuitState::HalfOpen => {}
        }

        let limit = self.config.half_open_max_calls.max(1);
        if self.trials.load(Ordering::Acquire) >= limit {
            drop(inner);
            return Err(self.reject());
        }
        self.trials.fetch_add(1, Ordering::AcqRel);
        Ok(Some(TrialPermit(Arc::clone(&self.trials))))
    }

    fn reject(&self) -> ConduitError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(target: "circuit_breaker", breaker = %self.name, "Call rejected, circuit open");
        ConduitError::CircuitOpen(self.name.clone())
    }

    async fn record_failure(&self) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Closed if inner.failures >= self.config.max_failures => {
                self.transition(&mut inner, CircuitState::Open)
            }
            _ => {}
        }
    }

    async fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.failures = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            // slow recovery credit
            CircuitState::Closed => inner.failures = inner.failures.saturating_sub(1),
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.changed_at = Instant::now();
        inner.changed_at_wall = Utc::now();
        match to {
            CircuitState::Open => warn!(
                target: "circuit_breaker",
                breaker = %self.name,
                %from,
                failures = inner.failures,
                "Circuit opened"
            ),
            _ => info!(target: "circuit_breaker", breaker = %self.name, %from, to = %to, "Circuit state changed"),
        }
    }
}

// ==============================================================================
// Pool
// ==============================================================================

/// Breakers memoized by name
#[derive(Debug, Default)]
pub struct CircuitBreakerPool {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker registered under `name`, creating it with `config`
    /// on first use. Later calls ignore `config`.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(target: "circuit_breaker", breaker = %name, "Circuit breaker created");
                Arc::new(CircuitBreaker::new(name, config))
            });
        Arc::clone(breaker.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub async fn reset(&self, name: &str) -> Result<()> {
        let breaker = self
            .get(name)
            .ok_or_else(|| ConduitError::NotFound(format!("circuit breaker {name}")))?;
        breaker.reset().await;
        Ok(())
    }

    pub async fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset().await;
        }
    }

    pub async fn metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut out = Vec::with_capacity(self.breakers.len());
        for breaker in self.all() {
            out.push(breaker.metrics().await);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // Clone out so no map guard is held across an await
    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

// ==============================================================================
// Middleware
// ==============================================================================

/// Runs every wrapped delivery through one shared breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn wrap(&self, _subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(BreakerHandler {
            breaker: Arc::clone(&self.breaker),
            next,
        })
    }
}

struct BreakerHandler {
    breaker: Arc<CircuitBreaker>,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for BreakerHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let next = Arc::clone(&self.next);
        self.breaker.execute(|| next.handle(event)).await
    }
}

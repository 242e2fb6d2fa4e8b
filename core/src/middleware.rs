//! Delivery middleware: decorators that wrap a subscriber's handler.
//!
//! The bus composes the registered middleware at dispatch time, first
//! registered outermost. Each decorator receives the ID of the subscriber it is
//! wrapping so that per-subscriber concerns (logging fields, deduplication keys)
//! stay accurate when one event fans out to several subscribers.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::event::{Event, EventType};
use crate::event_bus::EventHandler;
use crate::{ConduitError, Result};

/// Handler decorator
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler>;
}

// ==============================================================================
// Logging
// ==============================================================================

/// Logs start, duration and outcome of every delivery
#[derive(Debug, Default, Clone)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn wrap(&self, subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(LoggingHandler {
            subscriber: subscriber_id.to_string(),
            next,
        })
    }
}

struct LoggingHandler {
    subscriber: String,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let started = Instant::now();
        debug!(
            target: "middleware",
            subscriber = %self.subscriber,
            event_id = %event.id,
            event_type = %event.event_type,
            "Handling event"
        );
        let res = self.next.handle(Arc::clone(&event)).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &res {
            Ok(()) => debug!(
                target: "middleware",
                subscriber = %self.subscriber,
                event_id = %event.id,
                elapsed_ms,
                "Event handled"
            ),
            Err(err) => warn!(
                target: "middleware",
                subscriber = %self.subscriber,
                event_id = %event.id,
                elapsed_ms,
                error = %err,
                "Event handler failed"
            ),
        }
        res
    }
}

// ==============================================================================
// Retry
// ==============================================================================

/// Re-runs a failing handler up to `attempts` times with a fixed delay.
///
/// Waiting between attempts stops early when the optional cancellation token
/// fires; the call then fails with [`ConduitError::Cancelled`].
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    attempts: u32,
    delay: Duration,
    cancel: Option<CancellationToken>,
}

impl RetryMiddleware {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrap(&self, subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(RetryHandler {
            subscriber: subscriber_id.to_string(),
            policy: self.clone(),
            next,
        })
    }
}

struct RetryHandler {
    subscriber: String,
    policy: RetryMiddleware,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for RetryHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.next.handle(Arc::clone(&event)).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= self.policy.attempts => return Err(err),
                Err(err) => {
                    debug!(
                        target: "middleware",
                        subscriber = %self.subscriber,
                        event_id = %event.id,
                        attempt,
                        error = %err,
                        "Retrying event handler"
                    );
                }
            }
            attempt += 1;

            match &self.policy.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(ConduitError::Cancelled),
                        _ = tokio::time::sleep(self.policy.delay) => {}
                    }
                }
                None => tokio::time::sleep(self.policy.delay).await,
            }
        }
    }
}

// ==============================================================================
// Timeout
// ==============================================================================

/// Fails a delivery that runs longer than `timeout`; the handler future is dropped
#[derive(Debug, Clone)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn wrap(&self, _subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(TimeoutHandler {
            timeout: self.timeout,
            next,
        })
    }
}

struct TimeoutHandler {
    timeout: Duration,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for TimeoutHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.next.handle(event)).await {
            Ok(res) => res,
            Err(_) => Err(ConduitError::Timeout(self.timeout)),
        }
    }
}

// ==============================================================================
// Recovery
// ==============================================================================

/// Converts a panicking handler into [`ConduitError::HandlerPanic`]
#[derive(Debug, Default, Clone)]
pub struct RecoveryMiddleware;

impl RecoveryMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn wrap(&self, subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(RecoveryHandler {
            subscriber: subscriber_id.to_string(),
            next,
        })
    }
}

struct RecoveryHandler {
    subscriber: String,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for RecoveryHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let event_id = event.id.clone();
        match AssertUnwindSafe(self.next.handle(event)).catch_unwind().await {
            Ok(res) => res,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(
                    target: "middleware",
                    subscriber = %self.subscriber,
                    event_id = %event_id,
                    panic = %reason,
                    "Recovered from handler panic"
                );
                Err(ConduitError::HandlerPanic(reason))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ==============================================================================
// Filter
// ==============================================================================

/// Skips delivery (successfully) when the predicate rejects the event
#[derive(Clone)]
pub struct FilterMiddleware {
    predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl FilterMiddleware {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl Middleware for FilterMiddleware {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn wrap(&self, _subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(FilterHandler {
            predicate: Arc::clone(&self.predicate),
            next,
        })
    }
}

struct FilterHandler {
    predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for FilterHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        if (self.predicate)(&event) {
            self.next.handle(event).await
        } else {
            Ok(())
        }
    }
}

// ==============================================================================
// Deduplication
// ==============================================================================

const DEFAULT_SWEEP_THRESHOLD: usize = 1000;

/// Remembers keys for a time window.
///
/// Entries older than the window are swept lazily once the map grows past the
/// sweep threshold. One instance is owned by whoever builds the middleware chain
/// and shared by reference with every [`DeduplicationMiddleware`] using it.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    sweep_threshold: usize,
    seen: DashMap<String, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
            seen: DashMap::new(),
        }
    }

    pub fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `key`; returns false when it was already seen inside the window
    pub fn check_and_mark(&self, key: &str) -> bool {
        let now = Instant::now();
        let fresh = match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut seen) => {
                if now.duration_since(*seen.get()) < self.window {
                    false
                } else {
                    seen.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };
        if self.seen.len() > self.sweep_threshold {
            self.sweep_at(now);
        }
        fresh
    }

    /// Drop entries older than the window
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Drops a repeat delivery of the same event ID to the same subscriber
#[derive(Debug, Clone)]
pub struct DeduplicationMiddleware {
    cache: Arc<DedupCache>,
}

impl DeduplicationMiddleware {
    pub fn new(cache: Arc<DedupCache>) -> Self {
        Self { cache }
    }
}

impl Middleware for DeduplicationMiddleware {
    fn name(&self) -> &'static str {
        "deduplication"
    }

    fn wrap(&self, subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(DedupHandler {
            subscriber: subscriber_id.to_string(),
            cache: Arc::clone(&self.cache),
            next,
        })
    }
}

struct DedupHandler {
    subscriber: String,
    cache: Arc<DedupCache>,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for DedupHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let key = format!("{}:{}", self.subscriber, event.id);
        if !self.cache.check_and_mark(&key) {
            debug!(
                target: "middleware",
                subscriber = %self.subscriber,
                event_id = %event.id,
                "Duplicate event skipped"
            );
            return Ok(());
        }
        self.next.handle(event).await
    }
}

// ==============================================================================
// Metrics
// ==============================================================================

/// Per event type delivery statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeMetrics {
    pub count: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Default)]
struct TypeStats {
    count: u64,
    errors: u64,
    total: Duration,
}

/// Counts deliveries and their duration per event type
#[derive(Debug, Clone, Default)]
pub struct MetricsMiddleware {
    stats: Arc<DashMap<EventType, TypeStats>>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, EventTypeMetrics> {
        self.stats
            .iter()
            .map(|entry| {
                let s = entry.value();
                let avg_duration_ms = if s.count == 0 {
                    0.0
                } else {
                    s.total.as_secs_f64() * 1000.0 / s.count as f64
                };
                (
                    entry.key().to_string(),
                    EventTypeMetrics {
                        count: s.count,
                        errors: s.errors,
                        avg_duration_ms,
                    },
                )
            })
            .collect()
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn wrap(&self, _subscriber_id: &str, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(MetricsHandler {
            stats: Arc::clone(&self.stats),
            next,
        })
    }
}

struct MetricsHandler {
    stats: Arc<DashMap<EventType, TypeStats>>,
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for MetricsHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let event_type = event.event_type;
        let started = Instant::now();
        let res = self.next.handle(event).await;
        let elapsed = started.elapsed();

        let mut stats = self.stats.entry(event_type).or_default();
        stats.count += 1;
        stats.total += elapsed;
        if res.is_err() {
            stats.errors += 1;
        }
        res
    }
}

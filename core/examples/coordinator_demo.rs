//! End-to-end tour of the coordinator: subscribers, typed emits, a work queue,
//! a circuit breaker and the event store.
//!
//! Run with: RUST_LOG=debug cargo run --example coordinator_demo

use std::sync::Arc;
use std::time::Duration;

use conduit_core::event::{ActivityEventData, TaskEventData, ToolEventData};
use conduit_core::{
    handler_fn, message_handler_fn, telemetry, CircuitBreakerConfig, ConduitError,
    CoordinatorConfig, EventCoordinator, EventType, Message, Subscriber, TOPIC_ALL, TOPIC_TASK,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    telemetry::init_tracing()?;

    let config = CoordinatorConfig::from_env();
    let coordinator = EventCoordinator::new(config).await?;

    // Progress printer for task events
    let progress = handler_fn(|event| async move {
        info!(event_type = %event.event_type, data = ?event.data, "task update");
        Ok(())
    });
    coordinator
        .subscribe(TOPIC_TASK, Subscriber::new("progress", progress).with_priority(10))
        .await?;

    // Audit log on every topic, off the publisher's path
    let audit = handler_fn(|event| async move {
        info!(topic = %event.topic, id = %event.id, "audit");
        Ok(())
    });
    coordinator
        .subscribe(TOPIC_ALL, Subscriber::new("audit", audit).asynchronous())
        .await?;

    for step in 1..=3 {
        coordinator
            .emit_task_event(
                EventType::TaskProgress,
                TaskEventData {
                    task_id: "import-1".into(),
                    name: "import".into(),
                    status: Some("running".into()),
                    progress: Some(step as f64 / 3.0),
                    ..Default::default()
                },
            )
            .await?;
    }
    coordinator
        .emit_activity_event(
            EventType::ActivityLogged,
            ActivityEventData {
                message: "import finished".into(),
                level: Some("info".into()),
                ..Default::default()
            },
        )
        .await?;

    // Background work with retries
    coordinator.create_queue("thumbnails", 100)?;
    coordinator.register_worker(
        "thumbnails",
        message_handler_fn(|msg| async move {
            info!(payload = %msg.payload, attempt = msg.retries + 1, "rendering thumbnail");
            if msg.retries == 0 {
                return Err(ConduitError::handler("renderer warming up"));
            }
            Ok(())
        }),
    )?;
    for image in ["a.png", "b.png"] {
        coordinator
            .enqueue_message(Message::new("thumbnails", "render", json!({ "image": image })))
            .await?;
    }

    // Fault isolation around a flaky dependency
    let breaker = coordinator.get_circuit_breaker(
        "search-api",
        Some(CircuitBreakerConfig::default().with_max_failures(2)),
    );
    for attempt in 0..4 {
        let res = breaker
            .execute(|| async { Err::<(), _>(ConduitError::handler("search-api unreachable")) })
            .await;
        info!(attempt, outcome = ?res, "search call");
    }
    coordinator
        .emit_tool_event(
            EventType::ToolFailed,
            ToolEventData {
                tool_name: "search".into(),
                error: Some("circuit open".into()),
                ..Default::default()
            },
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Replay what the store captured so far
    let replay = handler_fn(|event| async move {
        info!(id = %event.id, event_type = %event.event_type, "replayed");
        Ok(())
    });
    let replayed = coordinator
        .event_store()
        .replay(&CancellationToken::new(), replay.as_ref())
        .await?;
    info!(replayed, "replay finished");

    let metrics = coordinator.get_metrics().await.to_json()?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    coordinator.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

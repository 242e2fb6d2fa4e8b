// Tracing setup for binaries and tests
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns an error when a global subscriber is already set; callers that may
/// initialize more than once can ignore it.
///
/// # Example
///
/// ```no_run
/// conduit_core::telemetry::init_tracing().ok();
/// ```
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    tracing::info!(target: "coordinator", "Tracing initialized");
    Ok(())
}

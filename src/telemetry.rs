use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured logging for the refinery.
///
/// JSON output with span context so batch runs can be correlated by the
/// surrounding manager. Respects `RUST_LOG`.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("mergeyard telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking the operations of one batch run.
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

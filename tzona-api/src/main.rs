//! TZONA API Server Entry Point
//!
//! Initialises telemetry, starts the service lifecycle and waits for ctrl-c
//! or SIGTERM before shutting down in reverse order.

use tzona_api::bootstrap::{build_lifecycle, shutdown_signal, ServiceContext};
use tzona_api::telemetry::{init_tracer, TelemetryConfig};
use tzona_api::ApiResult;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    tracing::info!(
        service = %telemetry_config.service_name,
        version = %telemetry_config.service_version,
        environment = %telemetry_config.environment,
        "Starting TZONA API"
    );

    let lifecycle = build_lifecycle(ServiceContext::from_env())?;
    lifecycle.start().await?;

    shutdown_signal().await;
    lifecycle.shutdown().await;

    tracing::info!("TZONA API stopped");
    Ok(())
}

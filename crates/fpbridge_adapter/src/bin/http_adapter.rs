#![forbid(unsafe_code)]

use std::sync::Arc;

use fpbridge_adapter::{http::build_router, BridgeConfig, BridgeRuntime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = BridgeConfig::from_env()?;
    let addr = config.http_bind;
    tracing::info!(
        capture_timeout_ms = config.capture_timeout.as_millis() as u64,
        lift_delay_ms = config.lift_delay.as_millis() as u64,
        log_retention = config.log_retention,
        model = %config.scanner_model,
        "fpbridge_http starting with simulated scanner driver"
    );

    let runtime = Arc::new(BridgeRuntime::simulated(config));
    runtime
        .log_stream()
        .info("🚀 Desktop Bridge started, waiting for web client");
    let app = build_router(runtime.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("fpbridge_http listening on http://{addr} (routes also under /api)");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Release the scanner handle on the way out.
    tokio::task::spawn_blocking(move || runtime.disconnect_scanner()).await?;
    tracing::info!("fpbridge_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

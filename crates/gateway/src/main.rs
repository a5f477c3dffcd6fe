use anyhow::Context;
use parley_gateway::{config::GatewayConfig, server};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development-only JWT secret; set PARLEY_GATEWAY_JWT_SECRET in production");
    }
    if config.test_bypass_enabled {
        warn!("test-bypass authentication is ENABLED; this must never be set in production");
    }

    let state = server::build_state(&config).await.context("failed to build gateway state")?;
    let app = server::build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting parley gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_signal())
        .await
        .context("gateway server exited unexpectedly")
}

use cpa_gateway::{app, build_state, AppConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Upstream secrets are mandatory; refuse to bind without them.
    let config = AppConfig::from_env()?;
    let port = config.port;
    tracing::info!(
        rop_wsdl = %config.endpoints.rop_wsdl_url,
        sms_wsdl = %config.endpoints.sms_wsdl_url,
        moci = %config.endpoints.moci_base_url,
        timeout_ms = config.upstream_timeout_ms,
        "gateway configured"
    );
    let router = app(build_state(config)?);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown requested, draining in-flight requests");
}

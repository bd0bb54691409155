use anyhow::{Context, Result};
use tracing::{info, warn};
use zero_feed_in::{api, config::Config, controller, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load().context("failed to load configuration")?;
    let _log_guard = telemetry::init_tracing(&cfg.logging)?;

    let (state, cancel, control) =
        controller::spawn_control_service(&cfg).context("failed to start control service")?;

    let app = api::router(state, &cfg);
    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!("status API binding to 0.0.0.0, settings are writable from the network");
    }
    info!(%addr, dtu = %cfg.dtu.base_url, inverters = cfg.inverters.len(), "starting zero feed-in controller");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = control.await {
        warn!(error = %e, "control task ended abnormally");
    }
    info!("shutdown complete");
    Ok(())
}

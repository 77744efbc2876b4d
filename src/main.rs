use anyhow::Context;
use ato_kernel::analyzer::TrafficAnalyzer;
use ato_kernel::config::load_config;
use ato_kernel::devices::DeviceRegistry;
use ato_kernel::health::HealthTracker;
use ato_kernel::http::{build_router, AppState};
use ato_kernel::scheduler::PollScheduler;
use ato_kernel::state::new_state;
use ato_kernel::transport::HttpTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    info!(
        interval_secs = cfg.scheduler.polling_interval_secs,
        max_concurrent = cfg.scheduler.max_concurrent_devices,
        "ato-kernel starting"
    );

    let registry = new_state(DeviceRegistry::new());
    let sched_cfg = new_state(cfg.scheduler.clone());
    let analyzer = TrafficAnalyzer::new(Duration::from_secs(cfg.scheduler.window_secs));
    let transport = HttpTransport::new(
        &cfg.transport.base_url,
        Duration::from_secs(cfg.scheduler.poll_timeout_secs),
    )
    .context("failed to build device transport")?;

    let scheduler = PollScheduler::new(
        registry,
        sched_cfg.clone(),
        analyzer.clone(),
        Arc::new(transport),
    );
    scheduler.initialize();

    let app_state = AppState {
        scheduler,
        analyzer,
        cfg: sched_cfg,
        health: HealthTracker::new(),
    };
    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    info!("listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.context("failed to bind HTTP listener")?;
    axum::serve(listener, app).await.context("HTTP server error")?;
    Ok(())
}

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use chatrelay_app::{AppState, build_router, config::AppConfig};
use chatrelay_observability::{ObservabilityConfig, init_observability};
use tracing::info;

const HISTORY_SAMPLE_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _observability = init_observability("chatrelay", &ObservabilityConfig::from_env());

    let config = AppConfig::from_env().context("invalid configuration")?;
    let state = AppState::from_config(&config).context("failed to build upstream client")?;
    if config.dashboard_enabled {
        state.stats().spawn_history_sampler(HISTORY_SAMPLE_PERIOD);
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        event = "relay.started",
        addr = %addr,
        upstream = config.upstream.as_str(),
        upstream_url = %config.upstream_url,
        model = %config.model_name,
        dashboard = config.dashboard_enabled
    );
    axum::serve(listener, build_router(state)).await.context("server terminated")?;
    Ok(())
}

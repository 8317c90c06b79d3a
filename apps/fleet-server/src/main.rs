use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use fleet_topics::TOPIC_SERVICE_STOP;
use serde_json::json;
use tracing::{error, info, warn};

mod api;
mod app_state;
mod bootstrap;
mod builtin;
mod catalog;
mod components;
pub mod config;
mod connector;
mod factory;
mod integration;
mod manager;
mod openapi;
mod remote;
mod responses;
mod router;
mod secrets;
mod security;
mod store;
mod striped_lock;
mod tasks;
#[cfg(test)]
mod test_support;
mod util;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleet_otel::init();
    let config = config::ServerConfig::load().context("load server config")?;
    let addr = config.bind_addr()?;

    let bootstrap::BootstrapOutput {
        router,
        state,
        background_tasks,
    } = bootstrap::build(&config).await?;

    let app = bootstrap::attach_http_layers(router.with_state(state.clone()));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "fleet-server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!(tasks = background_tasks.len(), "shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
    if let Err(err) = state.manager().shutdown().await {
        warn!(error = %err, "integrations did not shut down cleanly");
    }
    state
        .bus()
        .publish(TOPIC_SERVICE_STOP, &json!({"reason": "signal"}));
    Ok(())
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

//! Meridian scheduler binary.
//!
//! Runs the wire service workers, object stores, and clients talk to,
//! plus the read-only HTTP introspection API.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meridian_scheduler::{api, SchedulerConfig, SchedulerService, SchedulerState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("meridian_scheduler=info".parse()?),
        )
        .init();

    info!("Meridian scheduler starting");

    let config: SchedulerConfig = Figment::new()
        .merge(Toml::file("scheduler.toml"))
        .merge(Env::prefixed("MERIDIAN_SCHEDULER_").split("__"))
        .extract()?;

    info!(listen_addr = %config.listen.addr, "Configuration loaded");

    let service = SchedulerService::new(SchedulerState::new(&config.delivery));
    let cancel = CancellationToken::new();

    // Wire service
    let listener = TcpListener::bind(config.listen.addr).await?;
    info!(addr = %config.listen.addr, "Scheduler service listening");
    let wire = tokio::spawn(service.clone().run(listener, cancel.clone()));

    // HTTP introspection API
    let app_state = Arc::new(api::AppState {
        state: service.state(),
    });
    let api_listener = TcpListener::bind(config.api.listen_addr).await?;
    info!(addr = %config.api.listen_addr, "Scheduler API listening");
    let app = api::router(app_state);
    let api_task = tokio::spawn(async move { axum::serve(api_listener, app).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancel.cancel();

    wire.await??;
    api_task.abort();

    Ok(())
}

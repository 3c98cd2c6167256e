//! Meridian object store binary.
//!
//! Registers with the scheduler, then serves transfers, worker reads and
//! writes, and deallocation commands.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use meridian_net::SchedulerClient;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meridian_objstore::{LocalStore, ObjStoreConfig, ObjStoreService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("meridian_objstore=info".parse()?),
        )
        .init();

    info!("Meridian object store starting");

    let config: ObjStoreConfig = Figment::new()
        .merge(Toml::file("objstore.toml"))
        .merge(Env::prefixed("MERIDIAN_OBJSTORE_").split("__"))
        .extract()?;

    let listener = TcpListener::bind(config.listen_addr).await?;
    let advertised = config.advertised();

    let scheduler = SchedulerClient::new(&config.scheduler_addr);
    let objstore_id = scheduler.register_objstore(&advertised).await?;
    info!(%objstore_id, addr = %advertised, scheduler = %config.scheduler_addr, "registered with scheduler");

    let service = ObjStoreService::new(LocalStore::new(), scheduler, objstore_id);
    let cancel = CancellationToken::new();

    info!(addr = %config.listen_addr, "Object store listening");
    let serve = tokio::spawn(service.run(listener, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancel.cancel();
    serve.await??;

    Ok(())
}

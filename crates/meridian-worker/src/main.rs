//! Meridian worker binary.
//!
//! Deployments embed their own function tables through the library API;
//! this binary registers a small set of byte-level utility functions so a
//! fresh cluster can be exercised end to end.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meridian_worker::{FunctionRegistry, ReturnValue, WorkerConfig, WorkerRuntime};

fn builtin_functions() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    // echo(x) -> x
    registry.register_fn("echo", 1, |_, args| {
        Ok(vec![ReturnValue::payload(args[0].to_vec(), 0)])
    });

    // concat(a, b, ...) -> a ++ b ++ ...
    registry.register_fn("concat", 1, |_, args| {
        let mut joined = Vec::new();
        for arg in &args {
            joined.extend_from_slice(arg);
        }
        Ok(vec![ReturnValue::payload(joined, 0)])
    });

    // split(x) -> (first half, second half)
    registry.register_fn("split", 2, |_, args| {
        let data = &args[0];
        let mid = data.len() / 2;
        Ok(vec![
            ReturnValue::payload(data[..mid].to_vec(), 0),
            ReturnValue::payload(data[mid..].to_vec(), 0),
        ])
    });

    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("meridian_worker=info".parse()?),
        )
        .init();

    info!("Meridian worker starting");

    let config: WorkerConfig = Figment::new()
        .merge(Toml::file("worker.toml"))
        .merge(Env::prefixed("MERIDIAN_WORKER_").split("__"))
        .extract()?;

    let runtime = WorkerRuntime::new(config, builtin_functions());
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel_for_signal.cancel();
        }
    });

    runtime.run(cancel).await?;
    Ok(())
}

//! Backup handler
//!
//! Serves the coordination API over the job store and runs the dispatch loop
//! that executes dumps and loads inside database pods.

use std::future::IntoFuture;
use std::sync::Arc;

use kube::Client;
use tokio::net::TcpListener;
use tracing::{error, info};

use pachyderm_backup_operator::{
    handler::{api, Dispatcher, HandlerClient, JobStore, KubeExecutor},
    metrics,
    runtime::{init_tracing, shutdown_signal},
    HandlerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Pachyderm backup handler");

    let config = HandlerConfig::from_env()?;
    info!(
        database = %config.database_path.display(),
        listen = %config.listen_addr,
        archive_dir = %config.archive_dir.display(),
        "Loaded backup handler configuration"
    );

    let store = Arc::new(JobStore::open(&config.database_path).await?);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Coordination API listening on {}", config.listen_addr);
    let server = axum::serve(listener, api::router(store.clone())).into_future();

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let dispatcher = Dispatcher::new(
        HandlerClient::new(config.api_url.clone())?,
        KubeExecutor::new(client),
        &config,
    );

    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "Coordination API exited");
            }
        }
        _ = dispatcher.run() => {
            error!("Dispatch loop exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping backup handler");
        }
    }

    store.pool().close().await;
    info!("Pachyderm backup handler stopped");
    Ok(())
}

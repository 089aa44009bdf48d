//! Pachyderm backup operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client,
//! registers CRD controllers, and runs the reconciliation loops.

use std::sync::Arc;

use kube::Client;
use tracing::{error, info};

use pachyderm_backup_operator::{
    controllers::{self, Context},
    metrics,
    runtime::{init_tracing, shutdown_signal},
    OperatorConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Pachyderm backup operator");

    let config = OperatorConfig::from_env()?;
    info!(handler_url = %config.handler_url, "Loaded operator configuration");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let metrics_port = config.metrics_port;
    let context = Arc::new(Context::new(client.clone(), config)?);

    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    let export_controller = controllers::run_export_controller(client.clone(), context.clone());
    let import_controller = controllers::run_import_controller(client.clone(), context.clone());

    tokio::select! {
        _ = export_controller => {
            error!("Export controller exited unexpectedly");
        }
        _ = import_controller => {
            error!("Import controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    info!("Pachyderm backup operator stopped");
    Ok(())
}

//! PachydermExport controller
//!
//! Watches PachydermExport resources and drives the backup state machine.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::adapters::ClusterOps;
use crate::controllers::{retry_after, Context};
use crate::crd::PachydermExport;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::export as export_reconciler;

/// Finalizer name for PachydermExport resources
const FINALIZER_NAME: &str = "aiml.pachyderm.com/export-finalizer";

const KIND: &str = "PachydermExport";

/// Run the PachydermExport controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<PachydermExport> = Api::all(client.clone());

    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("PachydermExport CRD not installed: {}", e);
        return;
    }

    info!("Starting PachydermExport controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled PachydermExport"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
                }
            }
        })
        .await;
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<PachydermExport>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<PachydermExport> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(export) => apply(export, ctx.clone()).await,
            FinalizerEvent::Cleanup(export) => cleanup(export, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply(export: Arc<PachydermExport>, ctx: Arc<Context>) -> Result<Action> {
    info!(
        generation = export.metadata.generation.unwrap_or(0),
        phase = ?export.status.as_ref().and_then(|s| s.phase.as_deref()),
        "Reconciling PachydermExport"
    );

    let in_flight = export
        .status
        .as_ref()
        .is_some_and(|s| s.backup_id.is_some());
    if !in_flight {
        if let Err(e) = export_reconciler::validate(&export) {
            warn!(error = %e, "Validation failed");
            export_reconciler::update_status_failed(&export, &ctx.cluster, &e.to_string())
                .await?;
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    }

    export_reconciler::reconcile(&export, &ctx.cluster, &ctx.api, &ctx.config).await
}

/// Take the target out of maintenance if the resource goes away mid-backup
/// and this export was the one that paused it. The archive itself is kept.
async fn cleanup(export: Arc<PachydermExport>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = export.namespace().unwrap_or_else(|| "default".to_string());
    info!("Cleaning up PachydermExport");

    let in_flight = export_reconciler::current_phase(&export).is_some_and(|p| !p.is_terminal())
        && export.status.as_ref().is_some_and(|s| s.backup_id.is_some());
    if in_flight && export_reconciler::paused_target(&export) {
        if let Some(backup) = &export.spec.backup {
            ctx.cluster
                .set_maintenance(&namespace, &backup.target, false)
                .await?;
        }
    }

    metrics::CLEANUPS.with_label_values(&[KIND]).inc();

    Ok(Action::await_change())
}

fn error_policy(obj: Arc<PachydermExport>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    retry_after(error, &ctx.config)
}

//! PachydermImport controller
//!
//! Watches PachydermImport resources and drives the restore state machine.

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
use crate::crd::PachydermImport;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::import as import_reconciler;

/// Finalizer name for PachydermImport resources
const FINALIZER_NAME: &str = "aiml.pachyderm.com/import-finalizer";

const KIND: &str = "PachydermImport";

/// Run the PachydermImport controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<PachydermImport> = Api::all(client.clone());

    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("PachydermImport CRD not installed: {}", e);
        return;
    }

    info!("Starting PachydermImport controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled PachydermImport"
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
async fn reconcile(obj: Arc<PachydermImport>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<PachydermImport> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(import) => apply(import, ctx.clone()).await,
            FinalizerEvent::Cleanup(import) => cleanup(import, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply(import: Arc<PachydermImport>, ctx: Arc<Context>) -> Result<Action> {
    info!(
        generation = import.metadata.generation.unwrap_or(0),
        phase = ?import.status.as_ref().and_then(|s| s.phase.as_deref()),
        "Reconciling PachydermImport"
    );

    let in_flight = import.status.as_ref().is_some_and(|s| s.id.is_some());
    if !in_flight {
        if let Err(e) = import_reconciler::validate(&import) {
            warn!(error = %e, "Validation failed");
            import_reconciler::update_status_failed(&import, &ctx.cluster, &e.to_string())
                .await?;
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    }

    match import_reconciler::reconcile(&import, &ctx.cluster, &ctx.api, &ctx.config).await {
        Err(Error::PodsStillRunning(detail)) => {
            info!(%detail, "Destination still has running pods, waiting");
            Ok(Action::requeue(ctx.config.pods_running_requeue))
        }
        other => other,
    }
}

/// Take the destination out of maintenance if the resource goes away
/// mid-restore.
async fn cleanup(import: Arc<PachydermImport>, ctx: Arc<Context>) -> Result<Action> {
    info!("Cleaning up PachydermImport");

    let in_flight = import_reconciler::current_phase(&import).is_some_and(|p| !p.is_terminal())
        && import.status.as_ref().is_some_and(|s| s.id.is_some());
    if in_flight {
        ctx.cluster
            .set_maintenance(
                &import_reconciler::destination_namespace(&import),
                &import.spec.destination.name,
                false,
            )
            .await?;
    }

    metrics::CLEANUPS.with_label_values(&[KIND]).inc();

    Ok(Action::await_change())
}

fn error_policy(obj: Arc<PachydermImport>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    retry_after(error, &ctx.config)
}

//! PachydermImport reconciler
//!
//! A restore is a conversation with the backup handler:
//! 1. Submit the restore; the dispatcher attaches the archived dump and the
//!    resource snapshot and marks it `Prepared`
//! 2. Recreate the destination instance paused, wait until its pachd
//!    Deployment has no replicas, then hand the load over (`Loading`)
//! 3. Once the dispatcher marks the restore done, record the outcome and take
//!    the destination out of maintenance mode

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{runtime::controller::Action, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::export::{POSTGRES_CONTAINER, POSTGRES_SERVICE, POSTGRES_STATEFULSET};
use crate::adapters::ClusterOps;
use crate::config::OperatorConfig;
use crate::crd::{JobPhase, Pachyderm, PachydermImport, MAINTENANCE_ANNOTATION};
use crate::error::{Error, Result};
use crate::handler::models::{decode_payload, Completion, Job, JobMeta, RestoreEnvelope, RestorePhase};
use crate::handler::CoordinationApi;
use crate::metrics;

/// Deployment whose replicas must be gone before the database is replaced
pub const PACHD_DEPLOYMENT: &str = "pachd";

/// Load a plain SQL dump from stdin
pub fn load_command() -> Vec<String> {
    ["psql", "--dbname", "postgres", "--quiet"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Validate the PachydermImport spec
pub fn validate(import: &PachydermImport) -> Result<()> {
    if import.spec.storage_secret.trim().is_empty() {
        return Err(Error::validation("storageSecret is required"));
    }
    if import.spec.backup_name.trim().is_empty() {
        return Err(Error::validation("backup is required"));
    }
    if import.spec.destination.name.trim().is_empty() {
        return Err(Error::validation("destination.name is required"));
    }
    Ok(())
}

/// Namespace the destination instance lives in
pub fn destination_namespace(import: &PachydermImport) -> String {
    import
        .spec
        .destination
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| import.namespace())
        .unwrap_or_else(|| "default".to_string())
}

pub fn current_phase(import: &PachydermImport) -> Option<JobPhase> {
    JobPhase::parse(import.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// Advance the import by one step
#[instrument(skip_all, fields(name = %import.name_any(), namespace = import.namespace()))]
pub async fn reconcile<C, A>(
    import: &PachydermImport,
    cluster: &C,
    api: &A,
    config: &OperatorConfig,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
    A: CoordinationApi + ?Sized,
{
    if current_phase(import).is_some_and(|p| p.is_terminal()) {
        return Ok(Action::await_change());
    }

    let restore_id = import
        .status
        .as_ref()
        .and_then(|s| s.id.as_deref())
        .filter(|id| !id.is_empty());

    match restore_id {
        None => request_restore(import, cluster, api, config).await,
        Some(id) => poll_restore(import, id, cluster, api, config).await,
    }
}

async fn request_restore<C, A>(
    import: &PachydermImport,
    cluster: &C,
    api: &A,
    config: &OperatorConfig,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
    A: CoordinationApi + ?Sized,
{
    validate(import)?;

    let name = import.name_any();
    let namespace = import.namespace().unwrap_or_else(|| "default".to_string());

    cluster
        .secret_keys(&namespace, &import.spec.storage_secret)
        .await?;

    let envelope = RestoreEnvelope {
        meta: JobMeta::new(name.as_str(), namespace.as_str()),
        destination_name: import.spec.destination.name.clone(),
        destination_namespace: destination_namespace(import),
        backup_location: import.spec.backup_name.clone(),
        storage_secret: Some(import.spec.storage_secret.clone()),
        ..Default::default()
    };

    let created = api.create_restore(&envelope).await?;
    let id = created.require_id()?;

    cluster
        .patch_import_status(
            &namespace,
            &name,
            json!({
                "phase": JobPhase::Requested.as_str(),
                "message": format!("Restore of {} requested", import.spec.backup_name),
                "id": id.to_string(),
                "startedAt": created.meta.created_at,
                "observedGeneration": import.metadata.generation,
            }),
        )
        .await?;

    metrics::JOBS_SUBMITTED
        .with_label_values(&["restore", &namespace])
        .inc();
    info!(%id, backup = %import.spec.backup_name, "Restore requested");

    Ok(Action::requeue(config.requeue_interval))
}

async fn poll_restore<C, A>(
    import: &PachydermImport,
    raw_id: &str,
    cluster: &C,
    api: &A,
    config: &OperatorConfig,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
    A: CoordinationApi + ?Sized,
{
    let name = import.name_any();
    let namespace = import.namespace().unwrap_or_else(|| "default".to_string());
    let id = Uuid::parse_str(raw_id)
        .map_err(|e| Error::decode(format!("restore id '{}' on status: {}", raw_id, e)))?;

    let job = match api.get_restore(id).await {
        Ok(job) => job,
        Err(Error::NotFound(_)) => {
            warn!(%id, "Restore job no longer known to the backup handler");
            cluster
                .patch_import_status(
                    &namespace,
                    &name,
                    json!({
                        "phase": JobPhase::NotFound.as_str(),
                        "message": format!("Restore job {} not found", id),
                        "completedAt": Utc::now(),
                    }),
                )
                .await?;
            metrics::record_finished("restore", JobPhase::NotFound.as_str());
            return Err(Error::not_found(format!("restore job {}", id)));
        }
        Err(e) => return Err(e),
    };

    if let Completion::Done { at } = job.meta.completion {
        return finish_restore(import, &job, at, cluster).await;
    }

    match job.phase {
        RestorePhase::Prepared => apply_prepared(import, job, cluster, api, config).await,
        RestorePhase::Pending | RestorePhase::Loading => {
            mark_running(import, cluster, "Restore in progress").await?;
            Ok(Action::requeue(config.requeue_interval))
        }
    }
}

/// Recreate the destination and hand the load over to the dispatcher
async fn apply_prepared<C, A>(
    import: &PachydermImport,
    mut job: RestoreEnvelope,
    cluster: &C,
    api: &A,
    config: &OperatorConfig,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
    A: CoordinationApi + ?Sized,
{
    let dest_name = import.spec.destination.name.clone();
    let dest_namespace = destination_namespace(import);

    let restored = match restored_instance(import, &job) {
        Ok(pd) => pd,
        Err(e) => {
            warn!(error = %e, "Backup contents cannot be restored");
            update_status_failed(import, cluster, &e.to_string()).await?;
            return Err(e);
        }
    };

    cluster.create_pachyderm(&restored).await?;
    cluster
        .set_maintenance(&dest_namespace, &dest_name, true)
        .await?;

    if let Some(replicas) = cluster
        .workload_replicas(&dest_namespace, PACHD_DEPLOYMENT)
        .await?
    {
        if replicas > 0 {
            return Err(Error::PodsStillRunning(format!(
                "{}/{} has {} replicas",
                dest_namespace, PACHD_DEPLOYMENT, replicas
            )));
        }
    }

    if !cluster.service_ready(&dest_namespace, POSTGRES_SERVICE).await? {
        debug!(destination = %dest_name, "Destination database not ready, waiting");
        mark_running(import, cluster, "Waiting for destination database").await?;
        return Ok(Action::requeue(config.requeue_interval));
    }

    let Some(pod) = cluster
        .statefulset_pod(&dest_namespace, POSTGRES_STATEFULSET)
        .await?
    else {
        debug!(destination = %dest_name, "No running destination database pod, waiting");
        mark_running(import, cluster, "Waiting for destination database").await?;
        return Ok(Action::requeue(config.requeue_interval));
    };

    job.phase = RestorePhase::Loading;
    job.pod = Some(pod);
    job.container = Some(POSTGRES_CONTAINER.to_string());
    job.command = load_command();
    let job = api.update_restore(&job).await?;

    mark_running(import, cluster, "Loading database").await?;
    info!(id = ?job.id(), pod = ?job.pod, destination = %dest_name, "Restore load handed to dispatcher");

    Ok(Action::requeue(config.requeue_interval))
}

async fn finish_restore<C>(
    import: &PachydermImport,
    job: &RestoreEnvelope,
    at: chrono::DateTime<Utc>,
    cluster: &C,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
{
    let name = import.name_any();
    let namespace = import.namespace().unwrap_or_else(|| "default".to_string());

    // Pending restores never reached the destination
    if job.phase != RestorePhase::Pending {
        cluster
            .set_maintenance(
                &destination_namespace(import),
                &import.spec.destination.name,
                false,
            )
            .await?;
    }

    let (phase, message) = if job.failed() {
        (
            JobPhase::Failed,
            job.message
                .clone()
                .unwrap_or_else(|| "Restore failed".to_string()),
        )
    } else {
        (
            JobPhase::Completed,
            format!("Restored {} into {}", import.spec.backup_name, import.spec.destination.name),
        )
    };

    cluster
        .patch_import_status(
            &namespace,
            &name,
            json!({
                "phase": phase.as_str(),
                "message": message,
                "completedAt": at,
                "observedGeneration": import.metadata.generation,
            }),
        )
        .await?;

    metrics::record_finished("restore", phase.as_str());
    info!(id = ?job.id(), phase = %phase, "Restore finished");

    Ok(Action::await_change())
}

/// Decode the snapshot and retarget it at the destination, paused and
/// without status
pub fn restored_instance(import: &PachydermImport, job: &RestoreEnvelope) -> Result<Pachyderm> {
    let snapshot = job
        .kubernetes_resource
        .as_deref()
        .ok_or_else(|| Error::decode("restore carries no resource snapshot"))?;
    if job.database.is_none() {
        return Err(Error::decode("restore carries no database dump"));
    }

    let bytes = decode_payload(snapshot)?;
    let mut pachyderm: Pachyderm = serde_json::from_slice(&bytes)
        .map_err(|e| Error::decode(format!("resource snapshot is not a Pachyderm: {}", e)))?;

    pachyderm.metadata = ObjectMeta {
        name: Some(import.spec.destination.name.clone()),
        namespace: Some(destination_namespace(import)),
        annotations: Some(BTreeMap::from([(
            MAINTENANCE_ANNOTATION.to_string(),
            "true".to_string(),
        )])),
        ..Default::default()
    };
    pachyderm.status = None;

    Ok(pachyderm)
}

async fn mark_running<C>(import: &PachydermImport, cluster: &C, message: &str) -> Result<()>
where
    C: ClusterOps + ?Sized,
{
    let unchanged = current_phase(import) == Some(JobPhase::Running)
        && import
            .status
            .as_ref()
            .and_then(|s| s.message.as_deref())
            == Some(message);
    if unchanged {
        return Ok(());
    }

    cluster
        .patch_import_status(
            &import.namespace().unwrap_or_else(|| "default".to_string()),
            &import.name_any(),
            json!({
                "phase": JobPhase::Running.as_str(),
                "message": message,
            }),
        )
        .await
}

/// Update status to Failed
pub async fn update_status_failed<C>(
    import: &PachydermImport,
    cluster: &C,
    error_message: &str,
) -> Result<()>
where
    C: ClusterOps + ?Sized,
{
    let name = import.name_any();
    let namespace = import.namespace().unwrap_or_else(|| "default".to_string());

    cluster
        .patch_import_status(
            &namespace,
            &name,
            json!({
                "phase": JobPhase::Failed.as_str(),
                "message": error_message,
                "observedGeneration": import.metadata.generation,
            }),
        )
        .await
}

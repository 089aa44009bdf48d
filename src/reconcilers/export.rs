//! PachydermExport reconciler
//!
//! Drives one backup of a Pachyderm instance through the backup handler:
//! - No job id on status: pause the target, submit the backup, record the id
//! - Job id on status: poll the job, and once it is done record the outcome
//!   and take the target out of maintenance mode if this export paused it
//!
//! Waiting is always expressed as a requeue; nothing here sleeps.

use chrono::Utc;
use kube::{runtime::controller::Action, ResourceExt};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::ClusterOps;
use crate::config::OperatorConfig;
use crate::crd::{JobPhase, PachydermExport};
use crate::error::{Error, Result};
use crate::handler::models::{encode_payload, BackupEnvelope, Completion, Job};
use crate::handler::CoordinationApi;
use crate::metrics;

/// Service fronting the bundled database
pub const POSTGRES_SERVICE: &str = "postgres";

/// StatefulSet running the bundled database
pub const POSTGRES_STATEFULSET: &str = "postgres";

/// Database container inside the StatefulSet pods
pub const POSTGRES_CONTAINER: &str = "postgres";

/// Dump every database including roles, with statements that drop existing
/// objects first so the dump loads into a non-empty server.
pub fn dump_command() -> Vec<String> {
    ["pg_dumpall", "--clean", "--if-exists"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Validate the PachydermExport spec
pub fn validate(export: &PachydermExport) -> Result<()> {
    if export.spec.storage_secret.trim().is_empty() {
        return Err(Error::validation("storageSecret is required"));
    }

    let target = export
        .spec
        .backup
        .as_ref()
        .map(|b| b.target.trim())
        .unwrap_or_default();
    if target.is_empty() {
        return Err(Error::validation("backup.target is required"));
    }

    Ok(())
}

fn target_name(export: &PachydermExport) -> Result<&str> {
    export
        .spec
        .backup
        .as_ref()
        .map(|b| b.target.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::validation("backup.target is required"))
}

/// Whether this export paused its target and must resume it
pub fn paused_target(export: &PachydermExport) -> bool {
    export
        .status
        .as_ref()
        .and_then(|s| s.paused_target)
        .unwrap_or(false)
}

/// Current phase recorded on status
pub fn current_phase(export: &PachydermExport) -> Option<JobPhase> {
    JobPhase::parse(export.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// Advance the export by one step
#[instrument(skip_all, fields(name = %export.name_any(), namespace = export.namespace()))]
pub async fn reconcile<C, A>(
    export: &PachydermExport,
    cluster: &C,
    api: &A,
    config: &OperatorConfig,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
    A: CoordinationApi + ?Sized,
{
    if current_phase(export).is_some_and(|p| p.is_terminal()) {
        return Ok(Action::await_change());
    }

    let backup_id = export
        .status
        .as_ref()
        .and_then(|s| s.backup_id.as_deref())
        .filter(|id| !id.is_empty());

    match backup_id {
        None => request_backup(export, cluster, api, config).await,
        Some(id) => poll_backup(export, id, cluster, api, config).await,
    }
}

/// Idle -> Requested
async fn request_backup<C, A>(
    export: &PachydermExport,
    cluster: &C,
    api: &A,
    config: &OperatorConfig,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
    A: CoordinationApi + ?Sized,
{
    validate(export)?;

    let name = export.name_any();
    let namespace = export.namespace().unwrap_or_else(|| "default".to_string());
    let target = target_name(export)?;

    cluster
        .secret_keys(&namespace, &export.spec.storage_secret)
        .await?;

    let pachyderm = cluster
        .get_pachyderm(&namespace, target)
        .await?
        .ok_or_else(|| {
            Error::validation(format!("Pachyderm {}/{} does not exist", namespace, target))
        })?;

    if pachyderm.database_disabled() {
        return Err(Error::validation(format!(
            "Pachyderm {}/{} uses an external database",
            namespace, target
        )));
    }

    let mut paused_by_us = paused_target(export);
    if !pachyderm.is_paused() {
        // Recorded before pausing so a lost status write never strands the target
        if !paused_by_us {
            cluster
                .patch_export_status(&namespace, &name, json!({ "pausedTarget": true }))
                .await?;
            paused_by_us = true;
        }
        cluster.set_maintenance(&namespace, target, true).await?;
    }

    if !cluster.service_ready(&namespace, POSTGRES_SERVICE).await? {
        info!(target = %target, "Database service not ready, waiting");
        return Ok(Action::requeue(config.requeue_interval));
    }

    let Some(pod) = cluster
        .statefulset_pod(&namespace, POSTGRES_STATEFULSET)
        .await?
    else {
        info!(target = %target, "No running database pod, waiting");
        return Ok(Action::requeue(config.requeue_interval));
    };

    let snapshot = serde_json::to_vec(&pachyderm)?;
    let mut envelope = BackupEnvelope::new(
        name.as_str(),
        namespace.as_str(),
        pod,
        POSTGRES_CONTAINER,
        dump_command(),
    );
    envelope.storage_secret = Some(export.spec.storage_secret.clone());
    envelope.kubernetes_resource = Some(encode_payload(&snapshot));

    let created = api.create_backup(&envelope).await?;
    let id = created.require_id()?;

    cluster
        .patch_export_status(
            &namespace,
            &name,
            json!({
                "phase": JobPhase::Requested.as_str(),
                "message": format!("Backup of {} requested", target),
                "backupID": id.to_string(),
                "backupName": created.meta.name,
                "startedAt": created.meta.created_at,
                "observedGeneration": export.metadata.generation,
                "pausedTarget": paused_by_us,
            }),
        )
        .await?;

    metrics::JOBS_SUBMITTED
        .with_label_values(&["backup", &namespace])
        .inc();
    info!(%id, target = %target, pod = %created.pod, "Backup requested");

    Ok(Action::requeue(config.requeue_interval))
}

/// Requested/Running -> Running | Completed | Failed | NotFound
async fn poll_backup<C, A>(
    export: &PachydermExport,
    raw_id: &str,
    cluster: &C,
    api: &A,
    config: &OperatorConfig,
) -> Result<Action>
where
    C: ClusterOps + ?Sized,
    A: CoordinationApi + ?Sized,
{
    let name = export.name_any();
    let namespace = export.namespace().unwrap_or_else(|| "default".to_string());
    let id = Uuid::parse_str(raw_id)
        .map_err(|e| Error::decode(format!("backupID '{}' on status: {}", raw_id, e)))?;

    let job = match api.get_backup(id).await {
        Ok(job) => job,
        Err(Error::NotFound(_)) => {
            warn!(%id, "Backup job no longer known to the backup handler");
            cluster
                .patch_export_status(
                    &namespace,
                    &name,
                    json!({
                        "phase": JobPhase::NotFound.as_str(),
                        "message": format!("Backup job {} not found", id),
                        "completedAt": Utc::now(),
                    }),
                )
                .await?;
            metrics::record_finished("backup", JobPhase::NotFound.as_str());
            return Err(Error::not_found(format!("backup job {}", id)));
        }
        Err(e) => return Err(e),
    };

    let Completion::Done { at } = job.meta.completion else {
        if current_phase(export) != Some(JobPhase::Running) {
            cluster
                .patch_export_status(
                    &namespace,
                    &name,
                    json!({
                        "phase": JobPhase::Running.as_str(),
                        "message": "Backup in progress",
                    }),
                )
                .await?;
        }
        return Ok(Action::requeue(config.requeue_interval));
    };

    let target = target_name(export)?;
    if paused_target(export) {
        cluster.set_maintenance(&namespace, target, false).await?;
    } else {
        info!(target = %target, "Target was paused before this export, leaving it paused");
    }

    let (phase, message) = if job.failed() {
        (
            JobPhase::Failed,
            job.message
                .clone()
                .unwrap_or_else(|| "Backup command failed".to_string()),
        )
    } else {
        (
            JobPhase::Completed,
            format!(
                "Backup written to {}",
                job.location.as_deref().unwrap_or("unknown location")
            ),
        )
    };

    cluster
        .patch_export_status(
            &namespace,
            &name,
            json!({
                "phase": phase.as_str(),
                "message": message,
                "completedAt": at,
                "backupLocation": job.location,
                "observedGeneration": export.metadata.generation,
            }),
        )
        .await?;

    metrics::record_finished("backup", phase.as_str());
    info!(%id, phase = %phase, location = ?job.location, "Backup finished");

    Ok(Action::await_change())
}

/// Update status to Failed
pub async fn update_status_failed<C>(
    export: &PachydermExport,
    cluster: &C,
    error_message: &str,
) -> Result<()>
where
    C: ClusterOps + ?Sized,
{
    let name = export.name_any();
    let namespace = export.namespace().unwrap_or_else(|| "default".to_string());

    cluster
        .patch_export_status(
            &namespace,
            &name,
            json!({
                "phase": JobPhase::Failed.as_str(),
                "message": error_message,
                "observedGeneration": export.metadata.generation,
            }),
        )
        .await
}

//! Dispatch Loop: drive pending backup and restore jobs to completion
//!
//! One cycle fetches a bounded batch of pending jobs and works through them
//! one at a time. A job that was attempted is marked done even when the
//! remote command failed; its `state` says which. A job whose archive could
//! not be written stays pending and is attempted again on a later cycle.

use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::archive::Archiver;
use super::client::CoordinationApi;
use super::executor::{ExecRequest, RemoteExecutor};
use super::models::{
    self, BackupEnvelope, Job, RestoreEnvelope, RestorePhase, STATE_COMPLETED, STATE_FAILED,
};
use crate::config::HandlerConfig;
use crate::error::{Error, Result};
use crate::metrics;

/// How a single job ended up after a dispatch attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work succeeded and the job is done
    Completed,
    /// Work was attempted and failed; the job is done
    Failed,
    /// Restore contents attached; waiting for the operator
    Prepared,
    /// Nothing to do for this job yet
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Prepared => "prepared",
            JobOutcome::Skipped => "skipped",
        }
    }
}

/// Tally of one dispatch cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub completed: usize,
    pub failed: usize,
    pub prepared: usize,
    pub skipped: usize,
    /// Jobs left pending because of an error
    pub errors: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Prepared => self.prepared += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed + self.prepared + self.skipped + self.errors
    }
}

/// Polls the coordination API and runs jobs sequentially
pub struct Dispatcher<A, E> {
    api: A,
    executor: E,
    archiver: Archiver,
    batch_size: u32,
    startup_delay: Duration,
    poll_interval: Duration,
}

impl<A, E> Dispatcher<A, E>
where
    A: CoordinationApi,
    E: RemoteExecutor,
{
    pub fn new(api: A, executor: E, config: &HandlerConfig) -> Self {
        Self {
            api,
            executor,
            archiver: Archiver::new(&config.archive_dir),
            batch_size: config.batch_size,
            startup_delay: config.startup_delay,
            poll_interval: config.poll_interval,
        }
    }

    /// Run cycles until the task is dropped
    pub async fn run(&self) {
        info!(
            startup_delay_secs = self.startup_delay.as_secs(),
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            "Dispatch loop starting"
        );
        tokio::time::sleep(self.startup_delay).await;

        loop {
            match self.run_cycle().await {
                Ok(summary) if summary.total() > 0 => {
                    info!(
                        completed = summary.completed,
                        failed = summary.failed,
                        prepared = summary.prepared,
                        errors = summary.errors,
                        "Dispatch cycle finished"
                    );
                }
                Ok(_) => debug!("No pending jobs"),
                Err(e) => error!(error = %e, "Dispatch cycle aborted"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Fetch and work one batch of backups, then one batch of restores.
    ///
    /// A failed batch fetch aborts the cycle; a failed job does not.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        let backups = self.api.next_backup_batch(self.batch_size).await?;
        for job in backups {
            let id = job.id();
            match self.process_backup(job).await {
                Ok(outcome) => {
                    metrics::record_job("backup", outcome.as_str());
                    summary.record(outcome);
                }
                Err(e) => {
                    metrics::record_job("backup", "error");
                    warn!(id = ?id, error = %e, "Backup job left pending");
                    summary.errors += 1;
                }
            }
        }

        let restores = self.api.next_restore_batch(self.batch_size).await?;
        for job in restores {
            let id = job.id();
            match self.process_restore(job).await {
                Ok(outcome) => {
                    metrics::record_job("restore", outcome.as_str());
                    summary.record(outcome);
                }
                Err(e) => {
                    metrics::record_job("restore", "error");
                    warn!(id = ?id, error = %e, "Restore job left pending");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Execute, archive, report, mark done
    #[instrument(skip(self, job), fields(id = ?job.id(), name = %job.meta.name))]
    pub async fn process_backup(&self, job: BackupEnvelope) -> Result<JobOutcome> {
        let id = job.require_id()?;

        // Rows stored before names were checked on create
        if let Err(e) = job.meta.validate_archive_label() {
            return self.fail_backup(job, id, e.to_string()).await;
        }

        let mut running = job;
        running.is_running = true;
        let mut job = self.api.update_backup(&running).await?;

        let request = ExecRequest {
            namespace: job.meta.namespace.clone(),
            pod: job.pod.clone(),
            container: job.container.clone(),
            command: job.command.clone(),
            stdin: None,
        };

        let outcome = match self.executor.exec(&request).await {
            Ok(output) => {
                match self
                    .archiver
                    .write(&job.meta.archive_label(), output.stdout, models::now())
                    .await
                {
                    Ok(archive) => {
                        metrics::record_archive_bytes(archive.bytes);
                        job.location = Some(archive.location);
                        job.state = Some(STATE_COMPLETED.to_string());
                        job.message = models::summarize_output(&output.stderr);
                        JobOutcome::Completed
                    }
                    Err(e @ Error::Validation(_)) => {
                        warn!(error = %e, "Archive name rejected");
                        job.state = Some(STATE_FAILED.to_string());
                        job.message = Some(format!("archive write failed: {}", e));
                        JobOutcome::Failed
                    }
                    Err(e) => {
                        error!(error = %e, "Archive write failed");
                        job.is_running = false;
                        job.message = Some(format!("archive write failed: {}", e));
                        if let Err(update_err) = self.api.update_backup(&job).await {
                            warn!(error = %update_err, "Could not record archive failure");
                        }
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, pod = %request.pod, "Remote execution failed");
                job.state = Some(STATE_FAILED.to_string());
                job.message = Some(failure_message(&e));
                JobOutcome::Failed
            }
        };

        job.is_running = false;
        self.api.update_backup(&job).await?;
        self.api.delete_backup(id).await?;

        info!(outcome = outcome.as_str(), location = ?job.location, "Backup job done");
        Ok(outcome)
    }

    async fn fail_backup(
        &self,
        mut job: BackupEnvelope,
        id: Uuid,
        reason: String,
    ) -> Result<JobOutcome> {
        warn!(%id, reason = %reason, "Backup failed without running");

        job.state = Some(STATE_FAILED.to_string());
        job.message = Some(reason);
        job.is_running = false;
        self.api.update_backup(&job).await?;
        self.api.delete_backup(id).await?;
        Ok(JobOutcome::Failed)
    }

    #[instrument(skip(self, job), fields(id = ?job.id(), phase = %job.phase))]
    pub async fn process_restore(&self, job: RestoreEnvelope) -> Result<JobOutcome> {
        match job.phase {
            RestorePhase::Pending => self.prepare_restore(job).await,
            RestorePhase::Loading => self.load_restore(job).await,
            RestorePhase::Prepared => Ok(JobOutcome::Skipped),
        }
    }

    /// Attach the archived dump and resource snapshot to a pending restore
    async fn prepare_restore(&self, mut job: RestoreEnvelope) -> Result<JobOutcome> {
        let backup = match self.find_source_backup(&job.backup_location).await? {
            Some(backup) => backup,
            None => {
                let reason = format!("no backup recorded at {}", job.backup_location);
                return self.fail_restore(job, reason).await;
            }
        };

        let Some(resource) = backup.kubernetes_resource.clone() else {
            let reason = format!("backup {:?} carries no resource snapshot", backup.id());
            return self.fail_restore(job, reason).await;
        };

        let location = backup
            .location
            .clone()
            .unwrap_or_else(|| job.backup_location.clone());
        let dump = match self.archiver.read(&location).await {
            Ok(dump) => dump,
            Err(Error::NotFound(msg)) => return self.fail_restore(job, msg).await,
            Err(e) => return Err(e),
        };

        debug!(bytes = dump.len(), "Backup archive loaded");

        job.database = Some(models::encode_payload(&dump));
        job.kubernetes_resource = Some(resource);
        if job.storage_secret.is_none() {
            job.storage_secret = backup.storage_secret.clone();
        }
        job.phase = RestorePhase::Prepared;
        self.api.update_restore(&job).await?;

        info!(backup_id = ?backup.id(), "Restore prepared");
        Ok(JobOutcome::Prepared)
    }

    /// Stream the dump into the destination database and mark the restore done
    async fn load_restore(&self, job: RestoreEnvelope) -> Result<JobOutcome> {
        let id = job.require_id()?;

        let (Some(pod), Some(container)) = (job.pod.clone(), job.container.clone()) else {
            return self
                .fail_restore(job, "restore is loading without a target pod".to_string())
                .await;
        };
        let decoded = job.database.as_deref().map(models::decode_payload);
        let dump = match decoded {
            Some(Ok(dump)) => dump,
            Some(Err(e)) => return self.fail_restore(job, e.to_string()).await,
            None => {
                return self
                    .fail_restore(job, "restore has no database contents".to_string())
                    .await
            }
        };

        let mut running = job;
        running.is_running = true;
        let mut job = self.api.update_restore(&running).await?;

        let namespace = if job.destination_namespace.is_empty() {
            job.meta.namespace.clone()
        } else {
            job.destination_namespace.clone()
        };
        let request = ExecRequest {
            namespace,
            pod,
            container,
            command: job.command.clone(),
            stdin: Some(dump),
        };

        let outcome = match self.executor.exec(&request).await {
            Ok(output) => {
                job.state = Some(STATE_COMPLETED.to_string());
                job.message = models::summarize_output(&output.stderr);
                JobOutcome::Completed
            }
            Err(e) => {
                warn!(error = %e, pod = %request.pod, "Restore load failed");
                job.state = Some(STATE_FAILED.to_string());
                job.message = Some(failure_message(&e));
                JobOutcome::Failed
            }
        };

        job.is_running = false;
        self.api.update_restore(&job).await?;
        self.api.delete_restore(id).await?;

        info!(outcome = outcome.as_str(), "Restore job done");
        Ok(outcome)
    }

    async fn fail_restore(&self, mut job: RestoreEnvelope, reason: String) -> Result<JobOutcome> {
        let id = job.require_id()?;
        warn!(%id, reason = %reason, "Restore failed");

        job.state = Some(STATE_FAILED.to_string());
        job.message = Some(reason);
        job.is_running = false;
        self.api.update_restore(&job).await?;
        self.api.delete_restore(id).await?;
        Ok(JobOutcome::Failed)
    }

    /// Look a backup up by the location as given, then as resolved against
    /// the archive directory
    async fn find_source_backup(&self, location: &str) -> Result<Option<BackupEnvelope>> {
        if location.is_empty() {
            return Ok(None);
        }
        if let Some(backup) = self.api.find_backup(location).await? {
            return Ok(Some(backup));
        }
        match self.archiver.resolve(location) {
            Ok(path) => {
                let resolved = path.display().to_string();
                if resolved == location {
                    return Ok(None);
                }
                self.api.find_backup(&resolved).await
            }
            Err(_) => Ok(None),
        }
    }
}

fn failure_message(err: &Error) -> String {
    match err {
        Error::RemoteExecution { message, stderr } if !stderr.trim().is_empty() => {
            let stderr = models::summarize_output(stderr.as_bytes()).unwrap_or_default();
            format!("{}: {}", message, stderr)
        }
        other => other.to_string(),
    }
}

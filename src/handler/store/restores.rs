use uuid::Uuid;

use super::{from_micros, from_micros_opt, insert_error, parse_id, to_micros, JobStore};
use crate::error::{Error, Result};
use crate::handler::models::{self, Completion, JobMeta, RestoreEnvelope, RestorePhase};

#[derive(sqlx::FromRow)]
struct RestoreRow {
    id: String,
    name: String,
    namespace: String,
    phase: String,
    state: Option<String>,
    destination_name: String,
    destination_namespace: String,
    backup_location: String,
    storage_secret: Option<String>,
    kubernetes_resource: Option<String>,
    database: Option<String>,
    pod: Option<String>,
    container: Option<String>,
    command: Option<String>,
    is_running: bool,
    message: Option<String>,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<RestoreRow> for RestoreEnvelope {
    type Error = Error;

    fn try_from(row: RestoreRow) -> Result<Self> {
        Ok(RestoreEnvelope {
            meta: JobMeta {
                id: Some(parse_id(&row.id)?),
                name: row.name,
                namespace: row.namespace,
                created_at: Some(from_micros(row.created_at)?),
                updated_at: Some(from_micros(row.updated_at)?),
                completion: Completion::from_deleted_at(from_micros_opt(row.deleted_at)?),
            },
            phase: row.phase.parse()?,
            state: row.state,
            destination_name: row.destination_name,
            destination_namespace: row.destination_namespace,
            backup_location: row.backup_location,
            storage_secret: row.storage_secret,
            kubernetes_resource: row.kubernetes_resource,
            database: row.database,
            pod: row.pod,
            container: row.container,
            command: models::decode_command(row.command.as_deref())?,
            is_running: row.is_running,
            message: row.message,
        })
    }
}

const SELECT_RESTORE: &str = "SELECT id, name, namespace, phase, state, destination_name, \
     destination_namespace, backup_location, storage_secret, kubernetes_resource, database, \
     pod, container, command, is_running, message, created_at, updated_at, deleted_at \
     FROM restores";

impl JobStore {
    /// Persist a new restore job. New restores always start `Pending`.
    pub async fn create_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        let id = job.meta.id.unwrap_or_else(Uuid::new_v4).to_string();
        let created_at = job.meta.created_at.unwrap_or_else(models::now);

        sqlx::query(
            "INSERT INTO restores (id, name, namespace, phase, state, destination_name, \
             destination_namespace, backup_location, storage_secret, kubernetes_resource, \
             database, pod, container, command, is_running, message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&job.meta.name)
        .bind(&job.meta.namespace)
        .bind(RestorePhase::Pending.as_str())
        .bind(&job.state)
        .bind(&job.destination_name)
        .bind(&job.destination_namespace)
        .bind(&job.backup_location)
        .bind(&job.storage_secret)
        .bind(&job.kubernetes_resource)
        .bind(&job.database)
        .bind(&job.pod)
        .bind(&job.container)
        .bind(models::encode_command(&job.command))
        .bind(job.is_running)
        .bind(&job.message)
        .bind(to_micros(created_at))
        .bind(to_micros(created_at))
        .execute(self.pool())
        .await
        .map_err(|e| insert_error(e, &id))?;

        self.fetch_restore(&id).await
    }

    pub async fn get_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        self.fetch_restore(&id.to_string()).await
    }

    async fn fetch_restore(&self, id: &str) -> Result<RestoreEnvelope> {
        let row = sqlx::query_as::<_, RestoreRow>(&format!("{} WHERE id = ?", SELECT_RESTORE))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::not_found(format!("restore {}", id)))?;
        row.try_into()
    }

    /// Persist the mutable fields of a pending restore job
    pub async fn update_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        let id = job
            .meta
            .id
            .ok_or_else(|| Error::validation("restore update without id"))?
            .to_string();

        let result = sqlx::query(
            "UPDATE restores SET name = ?, phase = ?, state = ?, destination_name = ?, \
             destination_namespace = ?, backup_location = ?, storage_secret = ?, \
             kubernetes_resource = ?, database = ?, pod = ?, container = ?, command = ?, \
             is_running = ?, message = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&job.meta.name)
        .bind(job.phase.as_str())
        .bind(&job.state)
        .bind(&job.destination_name)
        .bind(&job.destination_namespace)
        .bind(&job.backup_location)
        .bind(&job.storage_secret)
        .bind(&job.kubernetes_resource)
        .bind(&job.database)
        .bind(&job.pod)
        .bind(&job.container)
        .bind(models::encode_command(&job.command))
        .bind(job.is_running)
        .bind(&job.message)
        .bind(to_micros(models::now()))
        .bind(&id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("pending restore {}", id)));
        }
        self.fetch_restore(&id).await
    }

    /// Mark a restore job done. Idempotent.
    pub async fn delete_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        let id = id.to_string();
        let now = to_micros(models::now());

        sqlx::query(
            "UPDATE restores SET deleted_at = ?, updated_at = ?, is_running = 0 \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(&id)
        .execute(self.pool())
        .await?;

        self.fetch_restore(&id).await
    }

    /// Up to `limit` pending restores the dispatcher can act on, oldest first.
    ///
    /// `Prepared` restores wait on the operator and are skipped.
    pub async fn next_restore_batch(&self, limit: u32) -> Result<Vec<RestoreEnvelope>> {
        let rows = sqlx::query_as::<_, RestoreRow>(&format!(
            "{} WHERE deleted_at IS NULL AND phase != ? \
             ORDER BY created_at ASC, rowid ASC LIMIT ?",
            SELECT_RESTORE
        ))
        .bind(RestorePhase::Prepared.as_str())
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(RestoreEnvelope::try_from).collect()
    }
}

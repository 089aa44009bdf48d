use uuid::Uuid;

use super::{from_micros, from_micros_opt, insert_error, parse_id, to_micros, JobStore};
use crate::error::{Error, Result};
use crate::handler::models::{self, BackupEnvelope, Completion, JobMeta};

#[derive(sqlx::FromRow)]
struct BackupRow {
    id: String,
    name: String,
    namespace: String,
    state: Option<String>,
    pod: String,
    container: String,
    command: Option<String>,
    is_running: bool,
    storage_secret: Option<String>,
    kubernetes_resource: Option<String>,
    location: Option<String>,
    message: Option<String>,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<BackupRow> for BackupEnvelope {
    type Error = Error;

    fn try_from(row: BackupRow) -> Result<Self> {
        Ok(BackupEnvelope {
            meta: JobMeta {
                id: Some(parse_id(&row.id)?),
                name: row.name,
                namespace: row.namespace,
                created_at: Some(from_micros(row.created_at)?),
                updated_at: Some(from_micros(row.updated_at)?),
                completion: Completion::from_deleted_at(from_micros_opt(row.deleted_at)?),
            },
            state: row.state,
            pod: row.pod,
            container: row.container,
            command: models::decode_command(row.command.as_deref())?,
            is_running: row.is_running,
            storage_secret: row.storage_secret,
            kubernetes_resource: row.kubernetes_resource,
            location: row.location,
            message: row.message,
        })
    }
}

const SELECT_BACKUP: &str = "SELECT id, name, namespace, state, pod, container, command, \
     is_running, storage_secret, kubernetes_resource, location, message, \
     created_at, updated_at, deleted_at FROM backups";

impl JobStore {
    /// Persist a new backup job, assigning id and created-at when absent.
    /// The name must be usable in an archive file name.
    pub async fn create_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        job.meta.validate_archive_label()?;

        let id = job.meta.id.unwrap_or_else(Uuid::new_v4).to_string();
        let created_at = job.meta.created_at.unwrap_or_else(models::now);

        sqlx::query(
            "INSERT INTO backups (id, name, namespace, state, pod, container, command, \
             is_running, storage_secret, kubernetes_resource, location, message, \
             created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&job.meta.name)
        .bind(&job.meta.namespace)
        .bind(&job.state)
        .bind(&job.pod)
        .bind(&job.container)
        .bind(models::encode_command(&job.command))
        .bind(job.is_running)
        .bind(&job.storage_secret)
        .bind(&job.kubernetes_resource)
        .bind(&job.location)
        .bind(&job.message)
        .bind(to_micros(created_at))
        .bind(to_micros(created_at))
        .execute(self.pool())
        .await
        .map_err(|e| insert_error(e, &id))?;

        self.fetch_backup(&id).await
    }

    /// Fetch a backup job by id, completed or not
    pub async fn get_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        self.fetch_backup(&id.to_string()).await
    }

    async fn fetch_backup(&self, id: &str) -> Result<BackupEnvelope> {
        let row = sqlx::query_as::<_, BackupRow>(&format!("{} WHERE id = ?", SELECT_BACKUP))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::not_found(format!("backup {}", id)))?;
        row.try_into()
    }

    /// Newest backup whose archive was written to `location`
    pub async fn find_backup_by_location(&self, location: &str) -> Result<Option<BackupEnvelope>> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "{} WHERE location = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
            SELECT_BACKUP
        ))
        .bind(location)
        .fetch_optional(self.pool())
        .await?;
        row.map(BackupEnvelope::try_from).transpose()
    }

    /// Persist the mutable fields of a pending backup job
    pub async fn update_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        let id = job
            .meta
            .id
            .ok_or_else(|| Error::validation("backup update without id"))?
            .to_string();

        let result = sqlx::query(
            "UPDATE backups SET name = ?, state = ?, pod = ?, container = ?, command = ?, \
             is_running = ?, storage_secret = ?, kubernetes_resource = ?, location = ?, \
             message = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&job.meta.name)
        .bind(&job.state)
        .bind(&job.pod)
        .bind(&job.container)
        .bind(models::encode_command(&job.command))
        .bind(job.is_running)
        .bind(&job.storage_secret)
        .bind(&job.kubernetes_resource)
        .bind(&job.location)
        .bind(&job.message)
        .bind(to_micros(models::now()))
        .bind(&id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("pending backup {}", id)));
        }
        self.fetch_backup(&id).await
    }

    /// Mark a backup job done. Deleting an already-done job changes nothing.
    pub async fn delete_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        let id = id.to_string();
        let now = to_micros(models::now());

        sqlx::query(
            "UPDATE backups SET deleted_at = ?, updated_at = ?, is_running = 0 \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(&id)
        .execute(self.pool())
        .await?;

        self.fetch_backup(&id).await
    }

    /// Up to `limit` pending backup jobs, oldest first
    pub async fn next_backup_batch(&self, limit: u32) -> Result<Vec<BackupEnvelope>> {
        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            "{} WHERE deleted_at IS NULL ORDER BY created_at ASC, rowid ASC LIMIT ?",
            SELECT_BACKUP
        ))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(BackupEnvelope::try_from).collect()
    }
}

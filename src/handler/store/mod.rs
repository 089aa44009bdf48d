//! Job Store: durable backup and restore records on SQLite
//!
//! Records are never removed. Completion is a soft delete (`deleted_at`),
//! after which a record is still readable but never handed out by a batch
//! query again.

mod backups;
mod restores;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

use crate::error::{Error, Result};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS backups (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        namespace TEXT NOT NULL DEFAULT '',
        state TEXT,
        pod TEXT NOT NULL DEFAULT '',
        container TEXT NOT NULL DEFAULT '',
        command TEXT,
        is_running INTEGER NOT NULL DEFAULT 0,
        storage_secret TEXT,
        kubernetes_resource TEXT,
        location TEXT,
        message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_backups_pending ON backups (deleted_at, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_backups_location ON backups (location)",
    r#"CREATE TABLE IF NOT EXISTS restores (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        namespace TEXT NOT NULL DEFAULT '',
        phase TEXT NOT NULL DEFAULT 'Pending',
        state TEXT,
        destination_name TEXT NOT NULL DEFAULT '',
        destination_namespace TEXT NOT NULL DEFAULT '',
        backup_location TEXT NOT NULL DEFAULT '',
        storage_secret TEXT,
        kubernetes_resource TEXT,
        database TEXT,
        pod TEXT,
        container TEXT,
        command TEXT,
        is_running INTEGER NOT NULL DEFAULT 0,
        message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_restores_pending ON restores (deleted_at, created_at)",
];

/// Handle to the job database. Cheap to clone.
#[derive(Clone, Debug)]
pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    /// Open (creating if needed) the database at `path` and provision the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        info!(path = %path.display(), "Job store ready");
        Ok(store)
    }

    /// Create tables and indexes that do not exist yet. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Job store schema is current");
        Ok(())
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Map an insert failure, turning primary key clashes into `DuplicateId`
fn insert_error(err: sqlx::Error, id: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::DuplicateId(id.to_string()),
        _ => Error::from(err),
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::decode(format!("timestamp {} out of range", micros)))
}

fn from_micros_opt(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    micros.map(from_micros).transpose()
}

fn parse_id(raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|e| Error::decode(format!("stored id '{}': {}", raw, e)))
}

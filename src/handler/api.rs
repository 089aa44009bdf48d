//! Coordination API: HTTP surface of the backup handler
//!
//! Routes:
//! - `GET /healthz`
//! - `POST /backup`, `PUT /backup`, `GET /backup?location=...`
//! - `GET /backup/{id}`, `DELETE /backup/{id}`
//! - `GET /next-batch?limit=N`
//! - `POST /restores`, `PUT /restores`, `GET /restores/next-batch?limit=N`
//! - `GET /restores/{id}`, `DELETE /restores/{id}`
//!
//! Every mutating route answers with the stored record.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::models::{BackupEnvelope, JobList, RestoreEnvelope};
use super::store::JobStore;
use crate::error::{Error, Result};

/// Batch size when the caller does not ask for one
pub const DEFAULT_BATCH_LIMIT: u32 = 5;

/// Upper bound on a single batch
pub const MAX_BATCH_LIMIT: u32 = 100;

/// Largest accepted request body. Prepared restores carry the whole
/// base64 encoded dump.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024 * 1024;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateId(_) => StatusCode::CONFLICT,
            Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Validation(_) | Error::Decode(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Connection(_) | Error::Kube(_) | Error::Api { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Coordination API request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "Coordination API request rejected");
        }

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchQuery {
    pub limit: Option<u32>,
}

impl BatchQuery {
    fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_BATCH_LIMIT)
            .min(MAX_BATCH_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LocationQuery {
    pub location: Option<String>,
}

type ApiState = Arc<JobStore>;

/// Build the coordination API router over a job store
pub fn router(store: Arc<JobStore>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route(
            "/backup",
            get(find_backup).post(create_backup).put(update_backup),
        )
        .route("/backup/{id}", get(get_backup).delete(delete_backup))
        .route("/next-batch", get(next_backup_batch))
        .route("/restores", axum::routing::post(create_restore).put(update_restore))
        .route("/restores/next-batch", get(next_restore_batch))
        .route("/restores/{id}", get(get_restore).delete(delete_restore))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(store)
}

async fn health(State(store): State<ApiState>) -> Result<Json<serde_json::Value>> {
    store.health_check().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn create_backup(
    State(store): State<ApiState>,
    Json(job): Json<BackupEnvelope>,
) -> Result<(StatusCode, Json<BackupEnvelope>)> {
    let stored = store.create_backup(&job).await?;
    info!(
        id = ?stored.meta.id,
        name = %stored.meta.name,
        namespace = %stored.meta.namespace,
        "Backup job created"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn update_backup(
    State(store): State<ApiState>,
    Json(job): Json<BackupEnvelope>,
) -> Result<Json<BackupEnvelope>> {
    Ok(Json(store.update_backup(&job).await?))
}

async fn find_backup(
    State(store): State<ApiState>,
    Query(query): Query<LocationQuery>,
) -> Result<Json<BackupEnvelope>> {
    let location = query
        .location
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::validation("location query parameter is required"))?;

    store
        .find_backup_by_location(&location)
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found(format!("backup at {}", location)))
}

async fn get_backup(
    State(store): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupEnvelope>> {
    Ok(Json(store.get_backup(id).await?))
}

async fn delete_backup(
    State(store): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupEnvelope>> {
    let deleted = store.delete_backup(id).await?;
    info!(%id, "Backup job marked done");
    Ok(Json(deleted))
}

async fn next_backup_batch(
    State(store): State<ApiState>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<JobList<BackupEnvelope>>> {
    let items = store.next_backup_batch(query.limit()).await?;
    Ok(Json(JobList { items }))
}

async fn create_restore(
    State(store): State<ApiState>,
    Json(job): Json<RestoreEnvelope>,
) -> Result<(StatusCode, Json<RestoreEnvelope>)> {
    let stored = store.create_restore(&job).await?;
    info!(
        id = ?stored.meta.id,
        destination = %stored.destination_name,
        backup_location = %stored.backup_location,
        "Restore job created"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn update_restore(
    State(store): State<ApiState>,
    Json(job): Json<RestoreEnvelope>,
) -> Result<Json<RestoreEnvelope>> {
    Ok(Json(store.update_restore(&job).await?))
}

async fn get_restore(
    State(store): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RestoreEnvelope>> {
    Ok(Json(store.get_restore(id).await?))
}

async fn delete_restore(
    State(store): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RestoreEnvelope>> {
    let deleted = store.delete_restore(id).await?;
    info!(%id, "Restore job marked done");
    Ok(Json(deleted))
}

async fn next_restore_batch(
    State(store): State<ApiState>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<JobList<RestoreEnvelope>>> {
    let items = store.next_restore_batch(query.limit()).await?;
    Ok(Json(JobList { items }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_limit_defaults_and_caps() {
        assert_eq!(BatchQuery::default().limit(), DEFAULT_BATCH_LIMIT);
        assert_eq!(BatchQuery { limit: Some(2) }.limit(), 2);
        assert_eq!(BatchQuery { limit: Some(10_000) }.limit(), MAX_BATCH_LIMIT);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let status = |e: Error| e.into_response().status();
        assert_eq!(status(Error::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status(Error::DuplicateId("x".into())), StatusCode::CONFLICT);
        assert_eq!(status(Error::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::Connection("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status(Error::StorageUnavailable(sqlx::Error::PoolTimedOut)),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

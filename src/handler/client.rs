//! Coordination API client
//!
//! [`CoordinationApi`] is the seam between job producers/consumers and the
//! job store. The operator and the dispatch loop talk to it over HTTP through
//! [`HandlerClient`]; tests and embedded setups can use a [`JobStore`]
//! directly.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use super::models::{BackupEnvelope, JobList, RestoreEnvelope};
use super::store::JobStore;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Job CRUD and batch retrieval for backups and restores.
///
/// Every call returns the record as stored; callers read server-assigned
/// fields (id, timestamps) from the result.
#[async_trait]
pub trait CoordinationApi: Send + Sync {
    async fn create_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope>;
    async fn update_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope>;
    async fn get_backup(&self, id: Uuid) -> Result<BackupEnvelope>;
    async fn find_backup(&self, location: &str) -> Result<Option<BackupEnvelope>>;
    async fn delete_backup(&self, id: Uuid) -> Result<BackupEnvelope>;
    async fn next_backup_batch(&self, limit: u32) -> Result<Vec<BackupEnvelope>>;

    async fn create_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope>;
    async fn update_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope>;
    async fn get_restore(&self, id: Uuid) -> Result<RestoreEnvelope>;
    async fn delete_restore(&self, id: Uuid) -> Result<RestoreEnvelope>;
    async fn next_restore_batch(&self, limit: u32) -> Result<Vec<RestoreEnvelope>>;
}

/// HTTP client for the backup handler's coordination API
#[derive(Clone, Debug)]
pub struct HandlerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HandlerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        debug!(status = status.as_u16(), message = %message, "Coordination API call rejected");

        Err(match status {
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::CONFLICT => Error::DuplicateId(message),
            _ => Error::Api {
                status: status.as_u16(),
                body: message,
            },
        })
    }
}

/// Pull `error` out of a JSON error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl CoordinationApi for HandlerClient {
    async fn create_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        self.send(self.http.post(self.url("/backup")).json(job)).await
    }

    async fn update_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        self.send(self.http.put(self.url("/backup")).json(job)).await
    }

    async fn get_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        self.send(self.http.get(self.url(&format!("/backup/{}", id))))
            .await
    }

    async fn find_backup(&self, location: &str) -> Result<Option<BackupEnvelope>> {
        let request = self
            .http
            .get(self.url("/backup"))
            .query(&[("location", location)]);
        match self.send(request).await {
            Ok(job) => Ok(Some(job)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        self.send(self.http.delete(self.url(&format!("/backup/{}", id))))
            .await
    }

    async fn next_backup_batch(&self, limit: u32) -> Result<Vec<BackupEnvelope>> {
        let request = self
            .http
            .get(self.url("/next-batch"))
            .query(&[("limit", limit)]);
        let list: JobList<BackupEnvelope> = self.send(request).await?;
        Ok(list.items)
    }

    async fn create_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        self.send(self.http.post(self.url("/restores")).json(job)).await
    }

    async fn update_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        self.send(self.http.put(self.url("/restores")).json(job)).await
    }

    async fn get_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        self.send(self.http.get(self.url(&format!("/restores/{}", id))))
            .await
    }

    async fn delete_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        self.send(self.http.delete(self.url(&format!("/restores/{}", id))))
            .await
    }

    async fn next_restore_batch(&self, limit: u32) -> Result<Vec<RestoreEnvelope>> {
        let request = self
            .http
            .get(self.url("/restores/next-batch"))
            .query(&[("limit", limit)]);
        let list: JobList<RestoreEnvelope> = self.send(request).await?;
        Ok(list.items)
    }
}

#[async_trait]
impl CoordinationApi for JobStore {
    async fn create_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        JobStore::create_backup(self, job).await
    }

    async fn update_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        JobStore::update_backup(self, job).await
    }

    async fn get_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        JobStore::get_backup(self, id).await
    }

    async fn find_backup(&self, location: &str) -> Result<Option<BackupEnvelope>> {
        self.find_backup_by_location(location).await
    }

    async fn delete_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        JobStore::delete_backup(self, id).await
    }

    async fn next_backup_batch(&self, limit: u32) -> Result<Vec<BackupEnvelope>> {
        JobStore::next_backup_batch(self, limit).await
    }

    async fn create_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        JobStore::create_restore(self, job).await
    }

    async fn update_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        JobStore::update_restore(self, job).await
    }

    async fn get_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        JobStore::get_restore(self, id).await
    }

    async fn delete_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        JobStore::delete_restore(self, id).await
    }

    async fn next_restore_batch(&self, limit: u32) -> Result<Vec<RestoreEnvelope>> {
        JobStore::next_restore_batch(self, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_json_error_field() {
        assert_eq!(error_message(r#"{"error":"backup 1 not found"}"#), "backup 1 not found");
        assert_eq!(error_message("plain text"), "plain text");
        assert_eq!(error_message(r#"{"detail":"x"}"#), r#"{"detail":"x"}"#);
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = HandlerClient::new("http://localhost:8890/").unwrap();
        assert_eq!(client.url("/backup"), "http://localhost:8890/backup");
    }
}

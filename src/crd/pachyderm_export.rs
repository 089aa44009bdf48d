//! PachydermExport Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PachydermExport resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "aiml.pachyderm.com",
    version = "v1beta1",
    kind = "PachydermExport",
    plural = "pachydermexports",
    singular = "pachydermexport",
    shortname = "pde",
    namespaced,
    status = "PachydermExportStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Backup", "type": "string", "jsonPath": ".status.backupID"}"#,
    printcolumn = r#"{"name": "Location", "type": "string", "jsonPath": ".status.backupLocation"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PachydermExportSpec {
    /// What to back up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupOptions>,

    /// Secret holding credentials for uploading the backup
    #[serde(default)]
    pub storage_secret: String,
}

/// Backup options
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupOptions {
    /// Name of the Pachyderm instance to back up, in the export's namespace
    pub target: String,
}

/// PachydermExport status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PachydermExportStatus {
    /// Current phase (Requested, Running, Completed, Failed, NotFound)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Time the backup job was accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Time the backup job was marked done
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Name recorded on the backup job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,

    /// Backup handler job id
    #[serde(rename = "backupID", skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,

    /// Where the archive was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_location: Option<String>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// True when this export put the target into maintenance mode and so
    /// owes it an unpause
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_target: Option<bool>,
}

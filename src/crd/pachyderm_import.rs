//! PachydermImport Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PachydermImport resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "aiml.pachyderm.com",
    version = "v1beta1",
    kind = "PachydermImport",
    plural = "pachydermimports",
    singular = "pachydermimport",
    shortname = "pdi",
    namespaced,
    status = "PachydermImportStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Destination", "type": "string", "jsonPath": ".spec.destination.name"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PachydermImportSpec {
    /// Pachyderm instance to restore into
    #[serde(default)]
    pub destination: RestoreDestination,

    /// Archive location of the backup to restore
    #[serde(rename = "backup", default)]
    pub backup_name: String,

    /// Secret holding credentials for the backup storage
    #[serde(default)]
    pub storage_secret: String,
}

/// Restore destination
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDestination {
    /// Name of the Pachyderm instance to create
    #[serde(default)]
    pub name: String,

    /// Namespace to restore into (defaults to the import's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// PachydermImport status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PachydermImportStatus {
    /// Current phase (Requested, Running, Completed, Failed, NotFound)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Backup handler restore id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Time the restore job was accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Time the restore job was marked done
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

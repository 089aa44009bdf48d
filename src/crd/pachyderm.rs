//! Pachyderm Custom Resource (the backup target)
//!
//! Only the fields the backup flow reads are typed; everything else is kept
//! as raw JSON so a snapshot restores the instance unchanged.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::MAINTENANCE_ANNOTATION;

/// Pachyderm resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "aiml.pachyderm.com",
    version = "v1beta1",
    kind = "Pachyderm",
    plural = "pachyderms",
    singular = "pachyderm",
    namespaced,
    status = "PachydermStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PachydermSpec {
    /// Bundled postgres options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresOptions>,

    /// Remaining spec fields, carried through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Postgres options of a Pachyderm instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresOptions {
    /// Use an external database instead of the bundled one
    #[serde(default)]
    pub disable: bool,
}

/// Pachyderm status, owned by the Pachyderm reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PachydermStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Pachyderm {
    /// True while the maintenance annotation is present
    pub fn is_paused(&self) -> bool {
        self.annotations()
            .get(MAINTENANCE_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// True when the instance runs without the bundled database
    pub fn database_disabled(&self) -> bool {
        self.spec.postgres.as_ref().is_some_and(|p| p.disable)
    }
}

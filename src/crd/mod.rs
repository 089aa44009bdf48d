//! Custom Resource Definitions for the Pachyderm backup operator

mod pachyderm;
mod pachyderm_export;
mod pachyderm_import;

pub use pachyderm::*;
pub use pachyderm_export::*;
pub use pachyderm_import::*;

use std::fmt;
use std::str::FromStr;

use kube::CustomResourceExt;

use crate::error::Error;

/// API group shared by all resources
pub const API_GROUP: &str = "aiml.pachyderm.com";

/// Annotation that tells the Pachyderm reconciler to stop managing an instance
pub const MAINTENANCE_ANNOTATION: &str = "aiml.pachyderm.com/pause";

/// Phase of an export or import, recorded on the resource status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    /// Job submitted to the backup handler
    Requested,
    /// Job observed pending or in progress
    Running,
    /// Job finished and side effects applied
    Completed,
    /// Job attempted but reported failure, or the spec is unusable
    Failed,
    /// The backup handler no longer knows the job
    NotFound,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Requested => "Requested",
            JobPhase::Running => "Running",
            JobPhase::Completed => "Completed",
            JobPhase::Failed => "Failed",
            JobPhase::NotFound => "NotFound",
        }
    }

    /// Terminal phases are never polled again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Failed | JobPhase::NotFound
        )
    }

    /// Parse an optional status string, ignoring unknown values
    pub fn parse(phase: Option<&str>) -> Option<Self> {
        phase.and_then(|p| p.parse().ok())
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Requested" => Ok(JobPhase::Requested),
            "Running" => Ok(JobPhase::Running),
            "Completed" => Ok(JobPhase::Completed),
            "Failed" => Ok(JobPhase::Failed),
            "NotFound" => Ok(JobPhase::NotFound),
            other => Err(Error::decode(format!("unknown job phase '{}'", other))),
        }
    }
}

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&PachydermExport::crd())?,
        serde_yaml::to_string(&PachydermImport::crd())?,
        serde_yaml::to_string(&Pachyderm::crd())?,
    ])
}

//! Kubernetes controllers for PachydermExport and PachydermImport
//!
//! This module contains the controller implementations that watch for CRD changes
//! and trigger reconciliation.

mod export_controller;
mod import_controller;

pub use export_controller::run as run_export_controller;
pub use import_controller::run as run_import_controller;

use std::time::Duration;

use kube::runtime::{controller::Action, finalizer::Error as FinalizerError};
use kube::Client;

use crate::adapters::KubeCluster;
use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::handler::HandlerClient;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Cluster operations used by the reconcilers
    pub cluster: KubeCluster,
    /// Coordination API of the backup handler
    pub api: HandlerClient,
    pub config: OperatorConfig,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: OperatorConfig) -> Result<Self> {
        let api = HandlerClient::new(config.handler_url.clone())?;
        Ok(Self {
            cluster: KubeCluster::new(client.clone()),
            client,
            api,
            config,
        })
    }
}

/// Requeue delay for a failed reconciliation
pub fn retry_after(error: &Error, config: &OperatorConfig) -> Action {
    match error {
        Error::Finalizer(inner) => match inner.as_ref() {
            FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => {
                retry_after(e, config)
            }
            _ => Action::requeue(Duration::from_secs(30)),
        },
        // The job is gone; retrying cannot bring it back
        Error::NotFound(_) => Action::await_change(),
        Error::PodsStillRunning(_) => Action::requeue(config.pods_running_requeue),
        Error::Config(_) | Error::Validation(_) | Error::SecretNotFound(_) | Error::Decode(_) => {
            Action::requeue(Duration::from_secs(300))
        }
        _ => Action::requeue(Duration::from_secs(30)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_by_error() {
        let config = OperatorConfig::default();
        assert_eq!(
            retry_after(&Error::not_found("restore job"), &config),
            Action::await_change()
        );
        assert_eq!(
            retry_after(&Error::PodsStillRunning("ml/pachd".into()), &config),
            Action::requeue(config.pods_running_requeue)
        );
        assert_eq!(
            retry_after(&Error::SecretNotFound("ml/creds".into()), &config),
            Action::requeue(Duration::from_secs(300))
        );
        assert_eq!(
            retry_after(&Error::Connection("refused".into()), &config),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            retry_after(
                &Error::Finalizer(Box::new(FinalizerError::ApplyFailed(Error::not_found("x")))),
                &config
            ),
            Action::await_change()
        );
    }
}

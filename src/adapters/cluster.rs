//! Cluster operations used by the export and import state machines

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::secrets;
use crate::crd::{Pachyderm, PachydermExport, PachydermImport, MAINTENANCE_ANNOTATION};
use crate::error::{Error, Result};

/// Field manager used for every patch this operator issues
pub const FIELD_MANAGER: &str = "pachyderm-backup-operator";

/// Everything the state machines need from the cluster.
///
/// Missing objects are `Ok(None)` where absence is an expected state and an
/// error where it is a misconfiguration.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn get_pachyderm(&self, namespace: &str, name: &str) -> Result<Option<Pachyderm>>;

    /// Create the instance; an existing instance of the same name is left alone
    async fn create_pachyderm(&self, pachyderm: &Pachyderm) -> Result<()>;

    /// Set or clear the maintenance annotation. Clearing on a missing
    /// instance is a no-op.
    async fn set_maintenance(&self, namespace: &str, name: &str, paused: bool) -> Result<()>;

    /// Effective replica count of a Deployment, `None` if it does not exist
    async fn workload_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>>;

    /// True when the Service has at least one ready endpoint address
    async fn service_ready(&self, namespace: &str, name: &str) -> Result<bool>;

    /// First running pod of a StatefulSet
    async fn statefulset_pod(&self, namespace: &str, name: &str) -> Result<Option<String>>;

    /// Key names of a Secret; a missing Secret is `SecretNotFound`
    async fn secret_keys(&self, namespace: &str, name: &str) -> Result<Vec<String>>;

    async fn patch_export_status(&self, namespace: &str, name: &str, status: Value) -> Result<()>;

    async fn patch_import_status(&self, namespace: &str, name: &str, status: Value) -> Result<()>;
}

/// [`ClusterOps`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn get_pachyderm(&self, namespace: &str, name: &str) -> Result<Option<Pachyderm>> {
        let api: Api<Pachyderm> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pachyderm(&self, pachyderm: &Pachyderm) -> Result<()> {
        let namespace = pachyderm
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("Pachyderm instance has no namespace"))?;
        let api: Api<Pachyderm> = Api::namespaced(self.client.clone(), namespace);

        match api.create(&PostParams::default(), pachyderm).await {
            Ok(_) => {
                info!(
                    name = ?pachyderm.metadata.name,
                    namespace = %namespace,
                    "Created Pachyderm instance"
                );
                Ok(())
            }
            Err(e) if is_status(&e, 409) => {
                debug!(name = ?pachyderm.metadata.name, "Pachyderm instance already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_maintenance(&self, namespace: &str, name: &str, paused: bool) -> Result<()> {
        let api: Api<Pachyderm> = Api::namespaced(self.client.clone(), namespace);
        let value = if paused { json!("true") } else { Value::Null };
        let patch = json!({
            "metadata": {
                "annotations": { MAINTENANCE_ANNOTATION: value }
            }
        });

        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(_) => {
                info!(name = %name, namespace = %namespace, paused, "Maintenance mode updated");
                Ok(())
            }
            Err(e) if is_status(&e, 404) && !paused => Ok(()),
            Err(e) if is_status(&e, 404) => {
                Err(Error::not_found(format!("Pachyderm {}/{}", namespace, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn workload_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let Some(deployment) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let current = deployment
            .status
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        Ok(Some(desired.max(current)))
    }

    async fn service_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let Some(endpoints) = api.get_opt(name).await? else {
            return Ok(false);
        };

        Ok(endpoints.subsets.iter().flatten().any(|subset| {
            subset
                .addresses
                .as_ref()
                .is_some_and(|addresses| !addresses.is_empty())
        }))
    }

    async fn statefulset_pod(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let Some(set) = sets.get_opt(name).await? else {
            return Ok(None);
        };

        let selector = set
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .filter(|selector| !selector.is_empty())
            .ok_or_else(|| {
                Error::validation(format!("StatefulSet {}/{} has no label selector", namespace, name))
            })?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;

        let mut running: Vec<String> = list
            .items
            .into_iter()
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    == Some("Running")
            })
            .filter_map(|pod| pod.metadata.name)
            .collect();
        running.sort();
        Ok(running.into_iter().next())
    }

    async fn secret_keys(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let secret = secrets::get_secret(&self.client, name, namespace).await?;
        Ok(secrets::secret_keys(&secret))
    }

    async fn patch_export_status(&self, namespace: &str, name: &str, status: Value) -> Result<()> {
        let api: Api<PachydermExport> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn patch_import_status(&self, namespace: &str, name: &str, status: Value) -> Result<()> {
        let api: Api<PachydermImport> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

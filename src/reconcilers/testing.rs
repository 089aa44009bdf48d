//! In-memory cluster and counting coordination API for reconciler tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use uuid::Uuid;

use crate::adapters::ClusterOps;
use crate::config::OperatorConfig;
use crate::crd::{
    BackupOptions, Pachyderm, PachydermExport, PachydermExportSpec, PachydermExportStatus,
    PachydermImport, PachydermImportSpec, PachydermImportStatus, PachydermSpec,
    RestoreDestination, MAINTENANCE_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::handler::models::{BackupEnvelope, RestoreEnvelope};
use crate::handler::{CoordinationApi, JobStore};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    pachyderms: HashMap<Key, Pachyderm>,
    secrets: HashMap<Key, Vec<String>>,
    ready_services: HashSet<Key>,
    statefulset_pods: HashMap<Key, String>,
    replicas: HashMap<Key, i32>,
    export_status: HashMap<Key, Value>,
    import_status: HashMap<Key, Value>,
    creates: usize,
}

/// Records every call; clones share state
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn add_pachyderm(&self, pachyderm: Pachyderm) {
        let k = key(&pachyderm.namespace().unwrap_or_default(), &pachyderm.name_any());
        self.state.lock().pachyderms.insert(k, pachyderm);
    }

    pub fn add_secret(&self, namespace: &str, name: &str, keys: &[&str]) {
        self.state.lock().secrets.insert(
            key(namespace, name),
            keys.iter().map(|k| k.to_string()).collect(),
        );
    }

    pub fn set_service_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut state = self.state.lock();
        if ready {
            state.ready_services.insert(key(namespace, name));
        } else {
            state.ready_services.remove(&key(namespace, name));
        }
    }

    pub fn set_statefulset_pod(&self, namespace: &str, name: &str, pod: &str) {
        self.state
            .lock()
            .statefulset_pods
            .insert(key(namespace, name), pod.to_string());
    }

    pub fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) {
        self.state
            .lock()
            .replicas
            .insert(key(namespace, name), replicas);
    }

    pub fn pachyderm(&self, namespace: &str, name: &str) -> Option<Pachyderm> {
        self.state.lock().pachyderms.get(&key(namespace, name)).cloned()
    }

    pub fn is_paused(&self, namespace: &str, name: &str) -> bool {
        self.pachyderm(namespace, name)
            .is_some_and(|pd| pd.is_paused())
    }

    pub fn creates(&self) -> usize {
        self.state.lock().creates
    }

    pub fn export_status(&self, namespace: &str, name: &str) -> Value {
        self.state
            .lock()
            .export_status
            .get(&key(namespace, name))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn export_status_typed(&self, namespace: &str, name: &str) -> PachydermExportStatus {
        serde_json::from_value(self.export_status(namespace, name)).unwrap_or_default()
    }

    pub fn import_status(&self, namespace: &str, name: &str) -> Value {
        self.state
            .lock()
            .import_status
            .get(&key(namespace, name))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn import_status_typed(&self, namespace: &str, name: &str) -> PachydermImportStatus {
        serde_json::from_value(self.import_status(namespace, name)).unwrap_or_default()
    }
}

/// JSON merge patch of one object level
fn merge(target: &mut Value, patch: Value) {
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let (Some(target), Value::Object(patch)) = (target.as_object_mut(), patch) {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(&k);
            } else {
                target.insert(k, v);
            }
        }
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn get_pachyderm(&self, namespace: &str, name: &str) -> Result<Option<Pachyderm>> {
        Ok(self.pachyderm(namespace, name))
    }

    async fn create_pachyderm(&self, pachyderm: &Pachyderm) -> Result<()> {
        let k = key(&pachyderm.namespace().unwrap_or_default(), &pachyderm.name_any());
        let mut state = self.state.lock();
        state.creates += 1;
        state.pachyderms.entry(k).or_insert_with(|| pachyderm.clone());
        Ok(())
    }

    async fn set_maintenance(&self, namespace: &str, name: &str, paused: bool) -> Result<()> {
        let mut state = self.state.lock();
        match state.pachyderms.get_mut(&key(namespace, name)) {
            Some(pd) => {
                if paused {
                    pd.annotations_mut()
                        .insert(MAINTENANCE_ANNOTATION.to_string(), "true".to_string());
                } else {
                    pd.annotations_mut().remove(MAINTENANCE_ANNOTATION);
                }
                Ok(())
            }
            None if !paused => Ok(()),
            None => Err(Error::not_found(format!("Pachyderm {}/{}", namespace, name))),
        }
    }

    async fn workload_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>> {
        Ok(self.state.lock().replicas.get(&key(namespace, name)).copied())
    }

    async fn service_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.state.lock().ready_services.contains(&key(namespace, name)))
    }

    async fn statefulset_pod(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .statefulset_pods
            .get(&key(namespace, name))
            .cloned())
    }

    async fn secret_keys(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        self.state
            .lock()
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
    }

    async fn patch_export_status(&self, namespace: &str, name: &str, status: Value) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .export_status
            .entry(key(namespace, name))
            .or_insert(Value::Null);
        merge(entry, status);
        Ok(())
    }

    async fn patch_import_status(&self, namespace: &str, name: &str, status: Value) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .import_status
            .entry(key(namespace, name))
            .or_insert(Value::Null);
        merge(entry, status);
        Ok(())
    }
}

/// Job store on a temporary file that counts submissions
pub struct TestApi {
    store: JobStore,
    backup_posts: AtomicUsize,
    restore_posts: AtomicUsize,
    _dir: TempDir,
}

impl TestApi {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("backup.db")).await.unwrap();
        Self {
            store,
            backup_posts: AtomicUsize::new(0),
            restore_posts: AtomicUsize::new(0),
            _dir: dir,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn backup_posts(&self) -> usize {
        self.backup_posts.load(Ordering::SeqCst)
    }

    pub fn restore_posts(&self) -> usize {
        self.restore_posts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationApi for TestApi {
    async fn create_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        self.backup_posts.fetch_add(1, Ordering::SeqCst);
        self.store.create_backup(job).await
    }

    async fn update_backup(&self, job: &BackupEnvelope) -> Result<BackupEnvelope> {
        self.store.update_backup(job).await
    }

    async fn get_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        self.store.get_backup(id).await
    }

    async fn find_backup(&self, location: &str) -> Result<Option<BackupEnvelope>> {
        self.store.find_backup_by_location(location).await
    }

    async fn delete_backup(&self, id: Uuid) -> Result<BackupEnvelope> {
        self.store.delete_backup(id).await
    }

    async fn next_backup_batch(&self, limit: u32) -> Result<Vec<BackupEnvelope>> {
        self.store.next_backup_batch(limit).await
    }

    async fn create_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        self.restore_posts.fetch_add(1, Ordering::SeqCst);
        self.store.create_restore(job).await
    }

    async fn update_restore(&self, job: &RestoreEnvelope) -> Result<RestoreEnvelope> {
        self.store.update_restore(job).await
    }

    async fn get_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        self.store.get_restore(id).await
    }

    async fn delete_restore(&self, id: Uuid) -> Result<RestoreEnvelope> {
        self.store.delete_restore(id).await
    }

    async fn next_restore_batch(&self, limit: u32) -> Result<Vec<RestoreEnvelope>> {
        self.store.next_restore_batch(limit).await
    }
}

pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        requeue_interval: Duration::from_secs(3),
        pods_running_requeue: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn pachyderm(namespace: &str, name: &str) -> Pachyderm {
    let mut pd = Pachyderm::new(name, PachydermSpec::default());
    pd.metadata.namespace = Some(namespace.to_string());
    pd.spec.extra = BTreeMap::from([(
        "pachd".to_string(),
        serde_json::json!({ "storage": { "backend": "MINIO" } }),
    )]);
    pd
}

pub fn export(namespace: &str, name: &str, target: &str) -> PachydermExport {
    let mut export = PachydermExport::new(
        name,
        PachydermExportSpec {
            backup: Some(BackupOptions {
                target: target.to_string(),
            }),
            storage_secret: "backup-creds".to_string(),
        },
    );
    export.metadata.namespace = Some(namespace.to_string());
    export.metadata.generation = Some(1);
    export
}

pub fn import(namespace: &str, name: &str, destination: &str, backup: &str) -> PachydermImport {
    let mut import = PachydermImport::new(
        name,
        PachydermImportSpec {
            destination: RestoreDestination {
                name: destination.to_string(),
                namespace: None,
            },
            backup_name: backup.to_string(),
            storage_secret: "backup-creds".to_string(),
        },
    );
    import.metadata.namespace = Some(namespace.to_string());
    import.metadata.generation = Some(1);
    import
}

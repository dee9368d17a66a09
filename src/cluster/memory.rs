//! In-Memory Cluster
//!
//! A self-contained cluster holding every object kind the controller reads.
//! Status writes honour resource versions the way the API server does, and
//! VolumeAttachments with finalizers are only marked for deletion.

use crate::crd::{StorageNode, Volume};
use crate::domain::ports::{ClusterWriter, ObjectCache};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Cluster state kept in process memory
#[derive(Default)]
pub struct InMemoryCluster {
    pvs: RwLock<BTreeMap<String, Arc<PersistentVolume>>>,
    /// Keyed by namespace/name
    pvcs: RwLock<BTreeMap<String, Arc<PersistentVolumeClaim>>>,
    /// Keyed by namespace/name
    pods: RwLock<BTreeMap<String, Arc<Pod>>>,
    volumes: RwLock<BTreeMap<String, Arc<Volume>>>,
    nodes: RwLock<BTreeMap<String, Arc<StorageNode>>>,
    attachments: RwLock<BTreeMap<String, Arc<VolumeAttachment>>>,
    /// Last issued resource version
    resource_version: AtomicU64,
    /// Successful Volume status writes
    status_writes: AtomicU64,
    /// VolumeAttachment delete requests that found the object
    attachment_deletes: AtomicU64,
    /// Reject writes as if the API server were down
    unavailable: AtomicBool,
}

fn key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

impl InMemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Add or replace a PersistentVolume
    pub fn put_persistent_volume(&self, pv: PersistentVolume) {
        self.pvs.write().insert(pv.name_any(), Arc::new(pv));
    }

    /// Remove a PersistentVolume
    pub fn remove_persistent_volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.pvs.write().remove(name)
    }

    /// Add or replace a PersistentVolumeClaim
    pub fn put_persistent_volume_claim(&self, pvc: PersistentVolumeClaim) {
        let k = key(pvc.metadata.namespace.as_deref(), &pvc.name_any());
        self.pvcs.write().insert(k, Arc::new(pvc));
    }

    /// Remove a PersistentVolumeClaim
    pub fn remove_persistent_volume_claim(&self, namespace: &str, name: &str) {
        self.pvcs.write().remove(&key(Some(namespace), name));
    }

    /// Add or replace a Pod
    pub fn put_pod(&self, pod: Pod) {
        let k = key(pod.metadata.namespace.as_deref(), &pod.name_any());
        self.pods.write().insert(k, Arc::new(pod));
    }

    /// Remove a Pod
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods.write().remove(&key(Some(namespace), name));
    }

    /// Add or replace a Volume, assigning a fresh resource version
    pub fn put_volume(&self, mut volume: Volume) {
        volume.metadata.resource_version = Some(self.next_resource_version());
        self.volumes.write().insert(volume.name_any(), Arc::new(volume));
    }

    /// Add or replace a StorageNode
    pub fn put_storage_node(&self, node: StorageNode) {
        self.nodes.write().insert(node.name_any(), Arc::new(node));
    }

    /// Add or replace a VolumeAttachment
    pub fn put_volume_attachment(&self, va: VolumeAttachment) {
        self.attachments.write().insert(va.name_any(), Arc::new(va));
    }

    /// Get a VolumeAttachment by name
    pub fn volume_attachment(&self, name: &str) -> Option<Arc<VolumeAttachment>> {
        self.attachments.read().get(name).cloned()
    }

    /// Number of successful Volume status writes
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::Relaxed)
    }

    /// Number of VolumeAttachment delete requests that found the object
    pub fn attachment_deletes(&self) -> u64 {
        self.attachment_deletes.load(Ordering::Relaxed)
    }

    /// Make every write fail as unavailable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Unavailable("in-memory cluster".into()));
        }
        Ok(())
    }
}

impl ObjectCache for InMemoryCluster {
    fn persistent_volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.pvs.read().get(name).cloned()
    }

    fn persistent_volumes(&self) -> Vec<Arc<PersistentVolume>> {
        self.pvs.read().values().cloned().collect()
    }

    fn persistent_volume_claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.pvcs.read().get(&key(Some(namespace), name)).cloned()
    }

    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>> {
        self.pods
            .read()
            .values()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect()
    }

    fn volume(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes.read().get(name).cloned()
    }

    fn storage_node(&self, name: &str) -> Option<Arc<StorageNode>> {
        self.nodes.read().get(name).cloned()
    }

    fn volume_attachments(&self) -> Vec<Arc<VolumeAttachment>> {
        self.attachments.read().values().cloned().collect()
    }
}

#[async_trait]
impl ClusterWriter for InMemoryCluster {
    async fn update_volume_status(&self, volume: &Volume) -> Result<Volume> {
        self.check_available()?;

        let name = volume.name_any();
        let mut volumes = self.volumes.write();
        let stored = volumes.get(&name).ok_or_else(|| Error::ResourceNotFound {
            kind: "Volume".into(),
            name: name.clone(),
        })?;

        if stored.metadata.resource_version != volume.metadata.resource_version {
            return Err(Error::Conflict {
                kind: "Volume".into(),
                name,
                resource_version: volume.resource_version().unwrap_or_default(),
            });
        }

        let mut updated = stored.with_kubernetes_status(volume.kubernetes_status());
        updated.metadata.resource_version = Some(self.next_resource_version());
        volumes.insert(name, Arc::new(updated.clone()));
        self.status_writes.fetch_add(1, Ordering::Relaxed);

        Ok(updated)
    }

    async fn delete_volume_attachment(&self, name: &str) -> Result<()> {
        self.check_available()?;

        let mut attachments = self.attachments.write();
        let Some(existing) = attachments.get(name).cloned() else {
            return Ok(());
        };
        self.attachment_deletes.fetch_add(1, Ordering::Relaxed);

        if existing.finalizers().is_empty() {
            attachments.remove(name);
        } else if existing.metadata.deletion_timestamp.is_none() {
            let mut marked = (*existing).clone();
            marked.metadata.deletion_timestamp = Some(Time(Utc::now()));
            attachments.insert(name.to_string(), Arc::new(marked));
        }
        Ok(())
    }
}

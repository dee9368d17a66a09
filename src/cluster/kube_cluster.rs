//! Kubernetes Cluster Adapter
//!
//! One reflector store per object kind, each fed by a background watcher
//! task for the lifetime of the process. Reads are lock-free snapshots out of
//! the stores; writes go straight to the API server.

use crate::crd::{StorageNode, Volume};
use crate::domain::ports::{ClusterWriter, ObjectCache};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "block-volume-controller";

// =============================================================================
// Kube Cluster
// =============================================================================

/// Reflector-backed cluster access
pub struct KubeCluster {
    client: Client,
    /// Namespace holding Volume resources
    namespace: String,
    pvs: Store<PersistentVolume>,
    pvcs: Store<PersistentVolumeClaim>,
    pods: Store<Pod>,
    volumes: Store<Volume>,
    nodes: Store<StorageNode>,
    attachments: Store<VolumeAttachment>,
}

impl KubeCluster {
    /// Start a watcher per object kind and return the cluster view.
    ///
    /// The watchers stop when `shutdown` is cancelled.
    pub fn start(client: Client, namespace: &str, shutdown: CancellationToken) -> Arc<Self> {
        info!(namespace = %namespace, "Starting object cache watchers");

        Arc::new(Self {
            pvs: spawn_reflector(Api::all(client.clone()), "PersistentVolume", shutdown.clone()),
            pvcs: spawn_reflector(Api::all(client.clone()), "PersistentVolumeClaim", shutdown.clone()),
            pods: spawn_reflector(Api::all(client.clone()), "Pod", shutdown.clone()),
            volumes: spawn_reflector(Api::namespaced(client.clone(), namespace), "Volume", shutdown.clone()),
            nodes: spawn_reflector(Api::all(client.clone()), "StorageNode", shutdown.clone()),
            attachments: spawn_reflector(Api::all(client.clone()), "VolumeAttachment", shutdown),
            client,
            namespace: namespace.to_string(),
        })
    }

    /// Wait until every store has received its initial listing
    pub async fn wait_until_ready(&self) -> Result<()> {
        let not_ready = |kind: &str| Error::Unavailable(format!("{} watcher stopped before sync", kind));

        self.pvs.wait_until_ready().await.map_err(|_| not_ready("PersistentVolume"))?;
        self.pvcs.wait_until_ready().await.map_err(|_| not_ready("PersistentVolumeClaim"))?;
        self.pods.wait_until_ready().await.map_err(|_| not_ready("Pod"))?;
        self.volumes.wait_until_ready().await.map_err(|_| not_ready("Volume"))?;
        self.nodes.wait_until_ready().await.map_err(|_| not_ready("StorageNode"))?;
        self.attachments.wait_until_ready().await.map_err(|_| not_ready("VolumeAttachment"))?;

        info!("Object cache synced");
        Ok(())
    }
}

/// Run a reflector for one kind on a background task
fn spawn_reflector<K>(api: Api<K>, kind: &'static str, shutdown: CancellationToken) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects();

    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(kind, "Object cache watcher stopped");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(kind, error = %e, "Object cache watch error"),
                    None => break,
                },
            }
        }
    });

    reader
}

impl ObjectCache for KubeCluster {
    fn persistent_volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.pvs.get(&ObjectRef::new(name))
    }

    fn persistent_volumes(&self) -> Vec<Arc<PersistentVolume>> {
        self.pvs.state()
    }

    fn persistent_volume_claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.pvcs.get(&ObjectRef::new(name).within(namespace))
    }

    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .collect()
    }

    fn volume(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes.get(&ObjectRef::new(name).within(&self.namespace))
    }

    fn storage_node(&self, name: &str) -> Option<Arc<StorageNode>> {
        self.nodes.get(&ObjectRef::new(name))
    }

    fn volume_attachments(&self) -> Vec<Arc<VolumeAttachment>> {
        self.attachments.state()
    }
}

#[async_trait]
impl ClusterWriter for KubeCluster {
    async fn update_volume_status(&self, volume: &Volume) -> Result<Volume> {
        let name = volume.name_any();
        let resource_version = volume.resource_version().ok_or_else(|| Error::InvalidObject {
            kind: "Volume".into(),
            name: name.clone(),
            reason: "missing resourceVersion".into(),
        })?;

        // resourceVersion in the patch body makes the API server reject stale writes
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": { "kubernetesStatus": volume.kubernetes_status() },
        });

        let api: Api<Volume> = Api::namespaced(self.client.clone(), &self.namespace);
        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
                    kind: "Volume".into(),
                    name: name.clone(),
                    resource_version: resource_version.clone(),
                },
                other => Error::Kube(other),
            })
    }

    async fn delete_volume_attachment(&self, name: &str) -> Result<()> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(attachment = %name, "VolumeAttachment already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

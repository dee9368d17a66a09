//! Domain Ports - Core trait definitions for the controller
//!
//! These traits define the boundaries between the reconcile logic and the
//! cluster. Adapters implement them: reflector-backed Kubernetes access in
//! production, an in-memory cluster in tests.

use crate::crd::{StorageNode, Volume};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use std::sync::Arc;

// =============================================================================
// Object Cache
// =============================================================================

/// Read-only, eventually-consistent view of cluster objects.
///
/// Reads never block and return snapshots; callers must tolerate staleness.
pub trait ObjectCache: Send + Sync {
    /// Get a PersistentVolume by name
    fn persistent_volume(&self, name: &str) -> Option<Arc<PersistentVolume>>;

    /// List all PersistentVolumes
    fn persistent_volumes(&self) -> Vec<Arc<PersistentVolume>>;

    /// Get a PersistentVolumeClaim by namespace and name
    fn persistent_volume_claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>>;

    /// List all pods in a namespace
    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>>;

    /// Get a storage Volume by name
    fn volume(&self, name: &str) -> Option<Arc<Volume>>;

    /// Get a StorageNode by name
    fn storage_node(&self, name: &str) -> Option<Arc<StorageNode>>;

    /// List all VolumeAttachments
    fn volume_attachments(&self) -> Vec<Arc<VolumeAttachment>>;

    /// VolumeAttachments whose source is the given PV
    fn volume_attachments_for_pv(&self, pv_name: &str) -> Vec<Arc<VolumeAttachment>> {
        self.volume_attachments()
            .into_iter()
            .filter(|va| attachment_pv_name(va) == Some(pv_name))
            .collect()
    }

    /// VolumeAttachments bound to the given node
    fn volume_attachments_on_node(&self, node_name: &str) -> Vec<Arc<VolumeAttachment>> {
        self.volume_attachments()
            .into_iter()
            .filter(|va| va.spec.node_name == node_name)
            .collect()
    }
}

/// PV named as the source of a VolumeAttachment
pub fn attachment_pv_name(va: &VolumeAttachment) -> Option<&str> {
    va.spec.source.persistent_volume_name.as_deref()
}

// =============================================================================
// Cluster Writer
// =============================================================================

/// Write access for the two mutations this controller performs.
#[async_trait]
pub trait ClusterWriter: Send + Sync {
    /// Replace the status of a Volume.
    ///
    /// The write is conditional on `metadata.resourceVersion`; a stale version
    /// fails with a conflict and must never be retried blindly.
    async fn update_volume_status(&self, volume: &Volume) -> Result<Volume>;

    /// Request deletion of a VolumeAttachment. Deleting an absent attachment succeeds.
    async fn delete_volume_attachment(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Clock
// =============================================================================

/// Source of the timestamps stamped into reference-loss fields
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time in the persisted string format
    fn now_rfc3339(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a fixed instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

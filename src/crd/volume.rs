//! Volume CRD
//!
//! The storage system's block volume. The attach/detach state machine lives
//! elsewhere and owns `status.state`; this controller owns only
//! `status.kubernetesStatus`, the projection of native cluster objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Volume CRD
// =============================================================================

/// Volume is a replicated block volume exposed to Kubernetes through CSI.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "block.billyronks.io",
    version = "v1",
    kind = "Volume",
    plural = "volumes",
    shortname = "bvol",
    status = "VolumeStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".status.currentNodeId"}"#,
    printcolumn = r#"{"name": "PV", "type": "string", "jsonPath": ".status.kubernetesStatus.pvName"}"#,
    printcolumn = r#"{"name": "PVC", "type": "string", "jsonPath": ".status.kubernetesStatus.pvcName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Requested size in bytes
    #[serde(default)]
    pub size_bytes: u64,

    /// Number of data replicas
    #[serde(default = "default_replicas")]
    pub number_of_replicas: u32,

    /// Filesystem type the CSI driver formats the volume with
    #[serde(default)]
    pub fs_type: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Attach/detach state, owned by the volume state machine
    #[serde(default)]
    pub state: VolumeState,

    /// Node the volume is currently attached to, if any
    #[serde(default)]
    pub current_node_id: String,

    /// Projection of the PV, PVC and pods using this volume
    #[serde(default)]
    pub kubernetes_status: KubernetesStatus,
}

/// Attach/detach state of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    #[default]
    Creating,
    Attached,
    Detached,
    Attaching,
    Detaching,
    Deleting,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Creating => write!(f, "creating"),
            VolumeState::Attached => write!(f, "attached"),
            VolumeState::Detached => write!(f, "detached"),
            VolumeState::Attaching => write!(f, "attaching"),
            VolumeState::Detaching => write!(f, "detaching"),
            VolumeState::Deleting => write!(f, "deleting"),
        }
    }
}

/// Kubernetes-side view of a volume.
///
/// The JSON field names are relied on by status viewers; an empty
/// `lastPVCRefAt`/`lastPodRefAt` means the reference is current or was never
/// held.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesStatus {
    #[serde(default)]
    pub pv_name: String,

    /// Phase of the PV, mirrored as a string
    #[serde(default)]
    pub pv_status: String,

    /// Namespace of the bound claim
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub pvc_name: String,

    /// When the claim reference was lost
    #[serde(default, rename = "lastPVCRefAt")]
    pub last_pvc_ref_at: String,

    /// When the last pod reference was lost
    #[serde(default)]
    pub last_pod_ref_at: String,

    /// Live pods using the claim
    #[serde(default)]
    pub workloads_status: Vec<WorkloadStatus>,
}

/// A pod using the volume and the workload that owns it
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub pod_name: String,

    #[serde(default)]
    pub pod_status: String,

    #[serde(default)]
    pub workload_name: String,

    #[serde(default)]
    pub workload_type: String,
}

fn default_replicas() -> u32 {
    3
}

// =============================================================================
// Implementations
// =============================================================================

impl Volume {
    /// Attach/detach state, `Creating` when no status was written yet
    pub fn state(&self) -> VolumeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Stored Kubernetes projection, empty when no status was written yet
    pub fn kubernetes_status(&self) -> KubernetesStatus {
        self.status
            .as_ref()
            .map(|s| s.kubernetes_status.clone())
            .unwrap_or_default()
    }

    /// Copy of this volume carrying a new Kubernetes projection
    pub fn with_kubernetes_status(&self, kubernetes_status: KubernetesStatus) -> Volume {
        let mut volume = self.clone();
        volume
            .status
            .get_or_insert_with(VolumeStatus::default)
            .kubernetes_status = kubernetes_status;
        volume
    }
}

impl KubernetesStatus {
    /// Whether the claim reference is held
    pub fn has_claim(&self) -> bool {
        !self.pvc_name.is_empty()
    }

    /// Whether any live pod uses the claim
    pub fn has_workloads(&self) -> bool {
        !self.workloads_status.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubernetes_status_field_names() {
        let status = KubernetesStatus {
            pv_name: "pv-1".into(),
            pv_status: "Bound".into(),
            namespace: "default".into(),
            pvc_name: "data-0".into(),
            last_pvc_ref_at: "".into(),
            last_pod_ref_at: "2024-01-01T00:00:00Z".into(),
            workloads_status: vec![WorkloadStatus {
                pod_name: "web-0".into(),
                pod_status: "Running".into(),
                workload_name: "web".into(),
                workload_type: "StatefulSet".into(),
            }],
        };
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["pvName"], "pv-1");
        assert_eq!(json["pvStatus"], "Bound");
        assert_eq!(json["pvcName"], "data-0");
        assert_eq!(json["lastPVCRefAt"], "");
        assert_eq!(json["lastPodRefAt"], "2024-01-01T00:00:00Z");
        assert_eq!(json["workloadsStatus"][0]["workloadType"], "StatefulSet");
    }

    #[test]
    fn test_status_defaults_when_absent() {
        let volume = Volume::new("vol-1", VolumeSpec::default());
        assert_eq!(volume.state(), VolumeState::Creating);
        assert_eq!(volume.kubernetes_status(), KubernetesStatus::default());

        let updated = volume.with_kubernetes_status(KubernetesStatus {
            pv_name: "pv-1".into(),
            ..Default::default()
        });
        assert_eq!(updated.kubernetes_status().pv_name, "pv-1");
        assert_eq!(updated.state(), VolumeState::Creating);
    }

    #[test]
    fn test_volume_state_deserialize() {
        let status: VolumeStatus = serde_json::from_str(r#"{"state":"detached"}"#).unwrap();
        assert_eq!(status.state, VolumeState::Detached);
        assert!(!status.kubernetes_status.has_claim());
        assert_eq!(format!("{}", VolumeState::Attached), "attached");
    }
}

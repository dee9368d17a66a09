//! Workload classification
//!
//! A pod's first owner reference decides both how it is reported in the volume
//! status and whether it may block releasing an attachment.

use crate::crd::WorkloadStatus;
use k8s_openapi::api::core::v1::Pod;

pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_REPLICA_SET: &str = "ReplicaSet";

/// Owner of a pod, from its first owner reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadOwner {
    /// Ordered, exclusive pod identity: a replacement only appears once the old pod is gone
    StatefulSet(String),
    /// No per-pod exclusivity
    ReplicaSet(String),
    /// Any other controller kind
    Other { kind: String, name: String },
    Unowned,
}

impl WorkloadOwner {
    /// Classify a pod
    pub fn of(pod: &Pod) -> Self {
        let owner = pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first());

        match owner {
            None => WorkloadOwner::Unowned,
            Some(r) => match r.kind.as_str() {
                KIND_STATEFUL_SET => WorkloadOwner::StatefulSet(r.name.clone()),
                KIND_REPLICA_SET => WorkloadOwner::ReplicaSet(r.name.clone()),
                _ => WorkloadOwner::Other {
                    kind: r.kind.clone(),
                    name: r.name.clone(),
                },
            },
        }
    }

    /// Owner name, empty if unowned
    pub fn name(&self) -> &str {
        match self {
            WorkloadOwner::StatefulSet(name) | WorkloadOwner::ReplicaSet(name) => name,
            WorkloadOwner::Other { name, .. } => name,
            WorkloadOwner::Unowned => "",
        }
    }

    /// Owner kind, empty if unowned
    pub fn kind(&self) -> &str {
        match self {
            WorkloadOwner::StatefulSet(_) => KIND_STATEFUL_SET,
            WorkloadOwner::ReplicaSet(_) => KIND_REPLICA_SET,
            WorkloadOwner::Other { kind, .. } => kind,
            WorkloadOwner::Unowned => "",
        }
    }

    /// Whether a terminating pod of this owner must be fully gone before its
    /// attachment may be released
    pub fn blocks_attachment_release(&self) -> bool {
        matches!(self, WorkloadOwner::StatefulSet(_))
    }
}

/// Whether a pod mounts the named claim
pub fn pod_uses_claim(pod: &Pod, claim_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .map(|c| c.claim_name == claim_name)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Claims mounted by a pod
pub fn pod_claim_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|c| c.claim_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a pod is marked for deletion
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Status entry for a live pod
pub fn workload_status(pod: &Pod) -> WorkloadStatus {
    let owner = WorkloadOwner::of(pod);
    WorkloadStatus {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        pod_status: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        workload_name: owner.name().to_string(),
        workload_type: owner.kind().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimVolumeSource, PodSpec, PodStatus, Volume as PodVolume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn pod(owner: Option<(&str, &str)>, claim: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web-0".into());
        pod.metadata.owner_references = owner.map(|(kind, name)| {
            vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: kind.into(),
                name: name.into(),
                uid: "uid-1".into(),
                ..Default::default()
            }]
        });
        pod.spec = Some(PodSpec {
            volumes: Some(vec![PodVolume {
                name: "data".into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.into(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_owner_classification() {
        let owner = WorkloadOwner::of(&pod(Some(("StatefulSet", "ss1")), "c1"));
        assert_eq!(owner, WorkloadOwner::StatefulSet("ss1".into()));
        assert!(owner.blocks_attachment_release());

        let owner = WorkloadOwner::of(&pod(Some(("ReplicaSet", "rs1")), "c1"));
        assert_eq!(owner.kind(), "ReplicaSet");
        assert!(!owner.blocks_attachment_release());

        let owner = WorkloadOwner::of(&pod(Some(("Job", "backup")), "c1"));
        assert_eq!(owner.name(), "backup");
        assert!(!owner.blocks_attachment_release());

        let owner = WorkloadOwner::of(&pod(None, "c1"));
        assert_eq!(owner, WorkloadOwner::Unowned);
        assert!(!owner.blocks_attachment_release());
    }

    #[test]
    fn test_workload_status_attribution() {
        let ws = workload_status(&pod(Some(("StatefulSet", "ss1")), "c1"));
        assert_eq!(ws.pod_name, "web-0");
        assert_eq!(ws.pod_status, "Running");
        assert_eq!(ws.workload_name, "ss1");
        assert_eq!(ws.workload_type, "StatefulSet");

        let ws = workload_status(&pod(None, "c1"));
        assert_eq!(ws.workload_name, "");
        assert_eq!(ws.workload_type, "");
    }

    #[test]
    fn test_pod_claims() {
        let p = pod(None, "c1");
        assert!(pod_uses_claim(&p, "c1"));
        assert!(!pod_uses_claim(&p, "c2"));
        assert_eq!(pod_claim_names(&p), vec!["c1".to_string()]);
        assert!(!is_terminating(&p));
        assert!(!pod_uses_claim(&Pod::default(), "c1"));
    }
}

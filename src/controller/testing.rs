//! Object builders shared by the controller tests

use super::pv::{ControllerConfig, PvController};
use crate::cluster::InMemoryCluster;
use crate::crd::{
    ConditionStatus, NodeCondition, StorageNode, StorageNodeSpec, StorageNodeStatus, Volume, VolumeSpec,
    VolumeState, VolumeStatus,
};
use crate::domain::ports::FixedClock;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec,
    PersistentVolumeStatus, Pod, PodSpec, PodStatus, Volume as PodVolume,
};
use k8s_openapi::api::storage::v1::{VolumeAttachment, VolumeAttachmentSource, VolumeAttachmentSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use std::sync::Arc;

pub const DRIVER: &str = "block.csi.billyronks.io";
pub const SYSTEM_NS: &str = "block-system";
pub const NOW: &str = "2024-05-01T10:00:00Z";

pub fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()))
}

pub fn controller(cluster: &Arc<InMemoryCluster>) -> PvController {
    PvController::new(ControllerConfig::default(), cluster.clone(), cluster.clone(), clock())
}

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

fn deleting() -> Option<Time> {
    Some(Time(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()))
}

/// PV of this driver, optionally bound to `(namespace, claim)`
pub fn pv(name: &str, volume: &str, claim: Option<(&str, &str)>, phase: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: meta(None, name),
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: DRIVER.into(),
                volume_handle: volume.into(),
                ..Default::default()
            }),
            claim_ref: claim.map(|(ns, claim)| ObjectReference {
                kind: Some("PersistentVolumeClaim".into()),
                namespace: Some(ns.into()),
                name: Some(claim.into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
    }
}

pub fn with_driver(mut pv: PersistentVolume, driver: &str) -> PersistentVolume {
    if let Some(csi) = pv.spec.as_mut().and_then(|s| s.csi.as_mut()) {
        csi.driver = driver.into();
    }
    pv
}

pub fn without_csi(mut pv: PersistentVolume) -> PersistentVolume {
    if let Some(spec) = pv.spec.as_mut() {
        spec.csi = None;
    }
    pv
}

pub fn deleting_pv(mut pv: PersistentVolume) -> PersistentVolume {
    pv.metadata.deletion_timestamp = deleting();
    pv
}

pub fn pvc(namespace: &str, name: &str, pv_name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(Some(namespace), name),
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(pv_name.into()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Pod mounting `claim`, owned by `(kind, name)` if given
pub fn pod(namespace: &str, name: &str, claim: &str, owner: Option<(&str, &str)>, phase: &str) -> Pod {
    let mut metadata = meta(Some(namespace), name);
    metadata.owner_references = owner.map(|(kind, owner)| {
        vec![OwnerReference {
            api_version: "apps/v1".into(),
            kind: kind.into(),
            name: owner.into(),
            uid: format!("uid-{}", owner),
            controller: Some(true),
            ..Default::default()
        }]
    });

    Pod {
        metadata,
        spec: Some(PodSpec {
            volumes: Some(vec![PodVolume {
                name: "data".into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.into(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
    }
}

pub fn terminating(mut pod: Pod) -> Pod {
    pod.metadata.deletion_timestamp = deleting();
    pod
}

pub fn volume(name: &str, state: VolumeState) -> Volume {
    let mut volume = Volume::new(name, VolumeSpec::default());
    volume.metadata.namespace = Some(SYSTEM_NS.into());
    volume.status = Some(VolumeStatus {
        state,
        ..Default::default()
    });
    volume
}

pub fn storage_node(name: &str, ready: ConditionStatus, reason: Option<&str>) -> StorageNode {
    let mut node = StorageNode::new(
        name,
        StorageNodeSpec {
            node_name: name.into(),
            allow_scheduling: true,
            ..Default::default()
        },
    );
    let mut status = StorageNodeStatus::default();
    status.set_condition(NodeCondition::ready(ready, reason));
    node.status = Some(status);
    node
}

pub fn attachment(name: &str, pv_name: &str, node: &str) -> VolumeAttachment {
    VolumeAttachment {
        metadata: meta(None, name),
        spec: VolumeAttachmentSpec {
            attacher: DRIVER.into(),
            node_name: node.into(),
            source: VolumeAttachmentSource {
                persistent_volume_name: Some(pv_name.into()),
                ..Default::default()
            },
        },
        status: None,
    }
}

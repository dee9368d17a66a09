//! Trigger mapping
//!
//! Maps a change of a secondary object to the PVs whose reconcile may now
//! reach a different result. Mappers over-approximate: an extra key costs one
//! no-op reconcile, a missed key leaves a Volume stale until the next resync.

use crate::crd::{StorageNode, Volume};
use crate::domain::ports::{attachment_pv_name, ObjectCache};
use crate::domain::workload::pod_claim_names;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use std::collections::BTreeSet;

/// PVs bound to the claims a pod mounts
pub fn pvs_for_pod(cache: &dyn ObjectCache, pod: &Pod) -> Vec<String> {
    let namespace = pod.namespace().unwrap_or_default();
    let mut pvs = BTreeSet::new();
    for claim in pod_claim_names(pod) {
        pvs.extend(pvs_for_claim_name(cache, &namespace, &claim));
    }
    pvs.into_iter().collect()
}

/// PVs bound to a claim, from either side of the binding
pub fn pvs_for_claim(cache: &dyn ObjectCache, pvc: &PersistentVolumeClaim) -> Vec<String> {
    let namespace = pvc.namespace().unwrap_or_default();
    let mut pvs = pvs_for_claim_name(cache, &namespace, &pvc.name_any());
    if let Some(bound) = pvc.spec.as_ref().and_then(|s| s.volume_name.as_ref()) {
        if !bound.is_empty() {
            pvs.insert(bound.clone());
        }
    }
    pvs.into_iter().collect()
}

fn pvs_for_claim_name(cache: &dyn ObjectCache, namespace: &str, claim: &str) -> BTreeSet<String> {
    cache
        .persistent_volumes()
        .iter()
        .filter(|pv| claim_ref_matches(pv, namespace, claim))
        .map(|pv| pv.name_any())
        .collect()
}

fn claim_ref_matches(pv: &PersistentVolume, namespace: &str, claim: &str) -> bool {
    pv.spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .is_some_and(|r| r.namespace.as_deref() == Some(namespace) && r.name.as_deref() == Some(claim))
}

/// The PV an attachment binds
pub fn pvs_for_attachment(va: &VolumeAttachment) -> Vec<String> {
    attachment_pv_name(va).map(str::to_string).into_iter().collect()
}

/// PVs backed by a Volume, plus the PV its status last named
pub fn pvs_for_volume(cache: &dyn ObjectCache, volume: &Volume) -> Vec<String> {
    let name = volume.name_any();
    let mut pvs: BTreeSet<String> = cache
        .persistent_volumes()
        .iter()
        .filter(|pv| {
            pv.spec
                .as_ref()
                .and_then(|s| s.csi.as_ref())
                .is_some_and(|csi| csi.volume_handle == name)
        })
        .map(|pv| pv.name_any())
        .collect();

    let projected = volume.kubernetes_status().pv_name;
    if !projected.is_empty() {
        pvs.insert(projected);
    }
    pvs.into_iter().collect()
}

/// PVs attached to a node
pub fn pvs_for_node(cache: &dyn ObjectCache, node: &StorageNode) -> Vec<String> {
    let pvs: BTreeSet<String> = cache
        .volume_attachments_on_node(node.node_name())
        .iter()
        .filter_map(|va| attachment_pv_name(va).map(str::to_string))
        .collect();
    pvs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::controller::testing::*;
    use crate::crd::{ConditionStatus, KubernetesStatus, VolumeState};

    #[test]
    fn test_pod_maps_to_bound_pvs() {
        let cluster = InMemoryCluster::new();
        cluster.put_persistent_volume(pv("pv-1", "vol-1", Some(("default", "c1")), "Bound"));
        cluster.put_persistent_volume(pv("pv-2", "vol-2", Some(("other", "c1")), "Bound"));
        cluster.put_persistent_volume(pv("pv-3", "vol-3", None, "Available"));

        let web = pod("default", "web-0", "c1", None, "Running");
        assert_eq!(pvs_for_pod(cluster.as_ref(), &web), vec!["pv-1".to_string()]);

        let stray = pod("default", "web-1", "c9", None, "Running");
        assert!(pvs_for_pod(cluster.as_ref(), &stray).is_empty());
    }

    #[test]
    fn test_claim_maps_from_both_sides() {
        let cluster = InMemoryCluster::new();
        cluster.put_persistent_volume(pv("pv-1", "vol-1", Some(("default", "c1")), "Bound"));

        let claim = pvc("default", "c1", "pv-1");
        assert_eq!(pvs_for_claim(cluster.as_ref(), &claim), vec!["pv-1".to_string()]);

        // volumeName set before the PV's claimRef is visible
        let claim = pvc("default", "c2", "pv-2");
        assert_eq!(pvs_for_claim(cluster.as_ref(), &claim), vec!["pv-2".to_string()]);
    }

    #[test]
    fn test_attachment_maps_to_source_pv() {
        assert_eq!(pvs_for_attachment(&attachment("va-1", "pv-1", "node-1")), vec!["pv-1".to_string()]);

        let mut inline = attachment("va-2", "pv-1", "node-1");
        inline.spec.source.persistent_volume_name = None;
        assert!(pvs_for_attachment(&inline).is_empty());
    }

    #[test]
    fn test_volume_maps_to_backing_and_projected_pvs() {
        let cluster = InMemoryCluster::new();
        cluster.put_persistent_volume(pv("pv-2", "vol-1", None, "Available"));

        let vol = volume("vol-1", VolumeState::Detached).with_kubernetes_status(KubernetesStatus {
            pv_name: "pv-1".into(),
            ..Default::default()
        });
        assert_eq!(
            pvs_for_volume(cluster.as_ref(), &vol),
            vec!["pv-1".to_string(), "pv-2".to_string()]
        );
    }

    #[test]
    fn test_node_maps_to_attached_pvs() {
        let cluster = InMemoryCluster::new();
        cluster.put_volume_attachment(attachment("va-1", "pv-1", "node-1"));
        cluster.put_volume_attachment(attachment("va-2", "pv-2", "node-1"));
        cluster.put_volume_attachment(attachment("va-3", "pv-3", "node-2"));

        let node = storage_node("node-1", ConditionStatus::False, None);
        assert_eq!(
            pvs_for_node(cluster.as_ref(), &node),
            vec!["pv-1".to_string(), "pv-2".to_string()]
        );
    }
}

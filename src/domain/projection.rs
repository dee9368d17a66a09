//! Status projection rules
//!
//! Pure functions from `(previous status, observed facts, now)` to the next
//! `KubernetesStatus`. Nothing here touches the cache, so every rule about
//! reference-loss timestamps is testable without a cluster.

use crate::crd::{KubernetesStatus, WorkloadStatus};

/// Claim a PV is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
}

/// Facts observed from the cache for one PV
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedFacts {
    pub pv_name: String,
    /// PV phase
    pub pv_status: String,
    pub claim: Option<ClaimRef>,
    /// Live pods using the claim; empty when there is no claim
    pub workloads: Vec<WorkloadStatus>,
}

/// Compute the next status for a PV that exists and is not being deleted.
///
/// A projection not made for this PV is discarded first, so a reused volume
/// never inherits loss timestamps from its previous binding. That includes the
/// record a deleted PV leaves behind, whose PV name is empty.
pub fn project(previous: &KubernetesStatus, observed: &ObservedFacts, now: &str) -> KubernetesStatus {
    let empty = KubernetesStatus::default();
    let previous = if previous.pv_name != observed.pv_name {
        &empty
    } else {
        previous
    };

    let (namespace, pvc_name, workloads) = match &observed.claim {
        Some(claim) => (
            claim.namespace.clone(),
            claim.name.clone(),
            observed.workloads.clone(),
        ),
        None => (String::new(), String::new(), Vec::new()),
    };

    let mut next = KubernetesStatus {
        pv_name: observed.pv_name.clone(),
        pv_status: observed.pv_status.clone(),
        namespace,
        pvc_name,
        last_pvc_ref_at: previous.last_pvc_ref_at.clone(),
        last_pod_ref_at: previous.last_pod_ref_at.clone(),
        workloads_status: workloads,
    };
    stamp_lost_references(previous, &mut next, now);
    next
}

/// Compute the next status once the PV is being deleted or is gone.
///
/// Every reference the volume held is lost. Only the loss timestamps change
/// and the PV identity is cleared; the last known claim and workloads stay for
/// the record.
pub fn mark_references_lost(previous: &KubernetesStatus, now: &str) -> KubernetesStatus {
    let mut next = previous.clone();
    if previous.has_claim() && next.last_pvc_ref_at.is_empty() {
        next.last_pvc_ref_at = now.to_string();
    }
    if previous.has_workloads() && next.last_pod_ref_at.is_empty() {
        next.last_pod_ref_at = now.to_string();
    }
    next.pv_name.clear();
    next.pv_status.clear();
    next
}

/// Stamp the loss timestamps for references present in `previous` but gone in `next`.
///
/// Only empty timestamps are stamped, so the first loss is what is recorded and
/// repeated evaluation is a no-op.
fn stamp_lost_references(previous: &KubernetesStatus, next: &mut KubernetesStatus, now: &str) {
    if previous.has_claim() && !next.has_claim() && next.last_pvc_ref_at.is_empty() {
        next.last_pvc_ref_at = now.to_string();
    }
    if previous.has_workloads() && !next.has_workloads() && next.last_pod_ref_at.is_empty() {
        next.last_pod_ref_at = now.to_string();
    }
}

/// Field-wise comparison with the workload list compared as a set
pub fn status_equivalent(a: &KubernetesStatus, b: &KubernetesStatus) -> bool {
    if a.pv_name != b.pv_name
        || a.pv_status != b.pv_status
        || a.namespace != b.namespace
        || a.pvc_name != b.pvc_name
        || a.last_pvc_ref_at != b.last_pvc_ref_at
        || a.last_pod_ref_at != b.last_pod_ref_at
        || a.workloads_status.len() != b.workloads_status.len()
    {
        return false;
    }

    let mut left: Vec<&WorkloadStatus> = a.workloads_status.iter().collect();
    let mut right: Vec<&WorkloadStatus> = b.workloads_status.iter().collect();
    left.sort();
    right.sort();
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: &str = "2024-05-01T10:00:00Z";
    const EARLIER: &str = "2024-04-01T10:00:00Z";

    fn workload(pod: &str) -> WorkloadStatus {
        WorkloadStatus {
            pod_name: pod.into(),
            pod_status: "Running".into(),
            workload_name: "ss1".into(),
            workload_type: "StatefulSet".into(),
        }
    }

    fn bound(pods: &[&str]) -> ObservedFacts {
        ObservedFacts {
            pv_name: "pv-1".into(),
            pv_status: "Bound".into(),
            claim: Some(ClaimRef {
                namespace: "default".into(),
                name: "c1".into(),
            }),
            workloads: pods.iter().map(|p| workload(p)).collect(),
        }
    }

    #[test]
    fn test_first_projection_sets_no_timestamps() {
        let next = project(&KubernetesStatus::default(), &bound(&[]), NOW);
        assert_eq!(next.pvc_name, "c1");
        assert_eq!(next.last_pvc_ref_at, "");
        assert_eq!(next.last_pod_ref_at, "");
    }

    #[test]
    fn test_claim_loss_stamps_once() {
        let previous = project(&KubernetesStatus::default(), &bound(&["web-0"]), NOW);
        let unbound = ObservedFacts {
            claim: None,
            workloads: vec![],
            pv_status: "Released".into(),
            ..bound(&[])
        };

        let next = project(&previous, &unbound, EARLIER);
        assert_eq!(next.pvc_name, "");
        assert_eq!(next.namespace, "");
        assert_eq!(next.last_pvc_ref_at, EARLIER);
        assert_eq!(next.last_pod_ref_at, EARLIER);

        let again = project(&next, &unbound, NOW);
        assert_eq!(again.last_pvc_ref_at, EARLIER);
        assert!(status_equivalent(&again, &next));
    }

    #[test]
    fn test_pod_loss_keeps_claim_timestamp_empty() {
        let previous = project(&KubernetesStatus::default(), &bound(&["web-0"]), EARLIER);
        let next = project(&previous, &bound(&[]), NOW);

        assert_eq!(next.last_pod_ref_at, NOW);
        assert_eq!(next.last_pvc_ref_at, "");
    }

    #[test]
    fn test_timestamps_not_cleared_on_new_reference() {
        let previous = KubernetesStatus {
            pv_name: "pv-1".into(),
            last_pod_ref_at: EARLIER.into(),
            ..Default::default()
        };
        let next = project(&previous, &bound(&["web-1"]), NOW);
        assert_eq!(next.last_pod_ref_at, EARLIER);
        assert_eq!(next.workloads_status.len(), 1);
    }

    #[test]
    fn test_reused_volume_discards_foreign_projection() {
        let previous = KubernetesStatus {
            pv_name: "pv-old".into(),
            pvc_name: "old-claim".into(),
            namespace: "default".into(),
            last_pod_ref_at: EARLIER.into(),
            workloads_status: vec![workload("old-0")],
            ..Default::default()
        };
        let unbound = ObservedFacts {
            pv_name: "pv-1".into(),
            pv_status: "Available".into(),
            ..Default::default()
        };

        let next = project(&previous, &unbound, NOW);
        assert_eq!(
            next,
            KubernetesStatus {
                pv_name: "pv-1".into(),
                pv_status: "Available".into(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_deletion_record_not_inherited() {
        let first = project(&KubernetesStatus::default(), &bound(&["web-0"]), EARLIER);
        let deleted = mark_references_lost(&first, EARLIER);
        assert_eq!(deleted.last_pvc_ref_at, EARLIER);

        let reused = ObservedFacts {
            pv_name: "pv-2".into(),
            ..bound(&[])
        };
        let next = project(&deleted, &reused, NOW);
        assert_eq!(next.pv_name, "pv-2");
        assert_eq!(next.pvc_name, "c1");
        assert_eq!(next.last_pvc_ref_at, "");
        assert_eq!(next.last_pod_ref_at, "");
    }

    #[test]
    fn test_mark_references_lost() {
        let previous = KubernetesStatus {
            namespace: "default".into(),
            pvc_name: "c1".into(),
            workloads_status: vec![workload("web-0")],
            ..Default::default()
        };
        let next = mark_references_lost(&previous, NOW);
        assert_eq!(next.last_pvc_ref_at, NOW);
        assert_eq!(next.last_pod_ref_at, NOW);
        assert_eq!(next.pvc_name, "c1");
        assert_eq!(next.workloads_status.len(), 1);

        let untouched = mark_references_lost(&KubernetesStatus::default(), NOW);
        assert_eq!(untouched, KubernetesStatus::default());
    }

    #[test]
    fn test_status_equivalent_ignores_order() {
        let a = KubernetesStatus {
            workloads_status: vec![workload("web-0"), workload("web-1")],
            ..Default::default()
        };
        let b = KubernetesStatus {
            workloads_status: vec![workload("web-1"), workload("web-0")],
            ..Default::default()
        };
        assert!(status_equivalent(&a, &b));

        let c = KubernetesStatus {
            workloads_status: vec![workload("web-0")],
            ..Default::default()
        };
        assert!(!status_equivalent(&a, &c));
    }
}

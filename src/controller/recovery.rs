//! Disaster-Recovery Evaluator
//!
//! After a node is confirmed gone, the VolumeAttachment binding a volume to it
//! is never cleaned up by the node itself and blocks re-attachment elsewhere.
//! This evaluator deletes such an attachment once doing so cannot lead two
//! nodes to hold the same volume:
//!
//! 1. the volume state machine reports the volume Detached,
//! 2. the attachment's StorageNode is confirmed gone (NotReady is not enough),
//! 3. no terminating StatefulSet pod using the claim is still present.
//!
//! Any doubt resolves to retaining the attachment.

use crate::crd::{NodeHealth, Volume, VolumeState};
use crate::domain::ports::{ClusterWriter, ObjectCache};
use crate::domain::workload::{is_terminating, pod_uses_claim, WorkloadOwner};
use crate::error::Result;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Decisions
// =============================================================================

/// Why an attachment is kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetainReason {
    /// Only a Detached volume's attachment may be released
    VolumeNotDetached(VolumeState),
    /// The node's StorageNode is not in cache
    NodeUnknown,
    /// The node is not confirmed gone
    NodeNotGone(NodeHealth),
    /// Deletion was already requested
    AlreadyDeleting,
    /// A StatefulSet pod is still terminating; its replacement must not overlap it
    StatefulSetPodTerminating { pod: String, workload: String },
}

impl std::fmt::Display for RetainReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetainReason::VolumeNotDetached(state) => write!(f, "volume is {}", state),
            RetainReason::NodeUnknown => write!(f, "node is unknown"),
            RetainReason::NodeNotGone(health) => write!(f, "node is {:?}", health),
            RetainReason::AlreadyDeleting => write!(f, "deletion already requested"),
            RetainReason::StatefulSetPodTerminating { pod, workload } => {
                write!(f, "pod {} of StatefulSet {} is terminating", pod, workload)
            }
        }
    }
}

/// Outcome of evaluating a PV's attachments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    NoAttachment,
    Retain { attachment: String, reason: RetainReason },
    /// Deletion requested; the attachment may linger until its finalizers run
    Deleted { attachment: String, node: String },
}

impl RecoveryDecision {
    pub fn is_deleted(&self) -> bool {
        matches!(self, RecoveryDecision::Deleted { .. })
    }
}

// =============================================================================
// Evaluator
// =============================================================================

/// Decides whether a dead node's VolumeAttachment may be force-deleted
pub struct DisasterRecoveryEvaluator {
    cache: Arc<dyn ObjectCache>,
    writer: Arc<dyn ClusterWriter>,
}

impl DisasterRecoveryEvaluator {
    pub fn new(cache: Arc<dyn ObjectCache>, writer: Arc<dyn ClusterWriter>) -> Self {
        Self { cache, writer }
    }

    /// Evaluate the attachment of `pv_name` against the freshly projected `volume`.
    ///
    /// At most one delete request is issued per call.
    pub async fn evaluate(&self, pv_name: &str, volume: &Volume) -> Result<RecoveryDecision> {
        let attachments = self.cache.volume_attachments_for_pv(pv_name);
        if attachments.is_empty() {
            return Ok(RecoveryDecision::NoAttachment);
        }

        let Some(va) = attachments
            .iter()
            .find(|va| va.metadata.deletion_timestamp.is_none())
        else {
            return Ok(RecoveryDecision::Retain {
                attachment: attachments[0].name_any(),
                reason: RetainReason::AlreadyDeleting,
            });
        };

        let attachment = va.name_any();
        if let Some(reason) = self.retain_reason(va, volume) {
            debug!(pv = %pv_name, attachment = %attachment, reason = %reason, "Retaining VolumeAttachment");
            return Ok(RecoveryDecision::Retain { attachment, reason });
        }

        let node = va.spec.node_name.clone();
        self.writer.delete_volume_attachment(&attachment).await?;
        info!(
            pv = %pv_name,
            volume = %volume.name_any(),
            attachment = %attachment,
            node = %node,
            "Deleted VolumeAttachment of confirmed-gone node to allow re-attachment"
        );
        Ok(RecoveryDecision::Deleted { attachment, node })
    }

    /// First reason the attachment must stay, if any
    fn retain_reason(&self, va: &VolumeAttachment, volume: &Volume) -> Option<RetainReason> {
        let state = volume.state();
        if state != VolumeState::Detached {
            return Some(RetainReason::VolumeNotDetached(state));
        }

        let Some(node) = self.cache.storage_node(&va.spec.node_name) else {
            return Some(RetainReason::NodeUnknown);
        };
        let health = node.health();
        if health != NodeHealth::ConfirmedGone {
            return Some(RetainReason::NodeNotGone(health));
        }

        self.blocking_pod(volume)
    }

    /// A terminating pod on the claim whose owner forbids early release
    fn blocking_pod(&self, volume: &Volume) -> Option<RetainReason> {
        let ks = volume.kubernetes_status();
        if !ks.has_claim() {
            return None;
        }

        self.cache
            .pods(&ks.namespace)
            .iter()
            .filter(|p| pod_uses_claim(p, &ks.pvc_name) && is_terminating(p))
            .find_map(|p| {
                let owner = WorkloadOwner::of(p);
                owner
                    .blocks_attachment_release()
                    .then(|| RetainReason::StatefulSetPodTerminating {
                        pod: p.name_any(),
                        workload: owner.name().to_string(),
                    })
            })
    }
}

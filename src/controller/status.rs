//! Status Projector
//!
//! Projects the PV, its claim and the pods using the claim onto the owning
//! Volume's `status.kubernetesStatus`. Safe to run repeatedly and out of
//! order: the result depends only on the current cache and the stored status,
//! and nothing is written when the projection is unchanged.

use crate::crd::{KubernetesStatus, Volume};
use crate::domain::ports::{ClusterWriter, Clock, ObjectCache};
use crate::domain::projection::{mark_references_lost, project, status_equivalent, ClaimRef, ObservedFacts};
use crate::domain::workload::{is_terminating, pod_uses_claim, workload_status};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Outcomes
// =============================================================================

/// Why a key produced no projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PvNotFound,
    /// No CSI source, or another driver's PV
    ForeignDriver,
    VolumeNotFound,
    /// The PV carries a deletion timestamp; only the deletion path applies
    PvDeleting,
    /// The Volume's projection belongs to a different PV
    VolumeReused,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::PvNotFound => write!(f, "pv_not_found"),
            SkipReason::ForeignDriver => write!(f, "foreign_driver"),
            SkipReason::VolumeNotFound => write!(f, "volume_not_found"),
            SkipReason::PvDeleting => write!(f, "pv_deleting"),
            SkipReason::VolumeReused => write!(f, "volume_reused"),
        }
    }
}

/// Result of projecting one PV
#[derive(Debug, Clone)]
pub enum Projection {
    Skipped(SkipReason),
    /// `volume` carries the projected status; `written` is false when it was already current
    Projected { volume: Volume, written: bool },
}

// =============================================================================
// Status Projector
// =============================================================================

/// Computes and persists the Kubernetes projection of Volumes
pub struct StatusProjector {
    cache: Arc<dyn ObjectCache>,
    writer: Arc<dyn ClusterWriter>,
    clock: Arc<dyn Clock>,
    /// CSI driver name identifying this storage system's PVs
    driver_name: String,
}

impl StatusProjector {
    pub fn new(
        cache: Arc<dyn ObjectCache>,
        writer: Arc<dyn ClusterWriter>,
        clock: Arc<dyn Clock>,
        driver_name: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            writer,
            clock,
            driver_name: driver_name.into(),
        }
    }

    /// Name of the Volume backing a PV, `None` for PVs of other drivers.
    ///
    /// A PV of this driver without a volume handle is malformed and can never
    /// be projected.
    pub fn volume_name_for(&self, pv: &PersistentVolume) -> Result<Option<String>> {
        let csi = match pv.spec.as_ref().and_then(|s| s.csi.as_ref()) {
            Some(csi) if csi.driver == self.driver_name => csi,
            _ => return Ok(None),
        };

        if csi.volume_handle.is_empty() {
            return Err(Error::InvalidObject {
                kind: "PersistentVolume".into(),
                name: pv.name_any(),
                reason: "CSI volume handle is empty".into(),
            });
        }
        Ok(Some(csi.volume_handle.clone()))
    }

    /// Project a live PV onto its Volume
    pub async fn project(&self, pv: &PersistentVolume) -> Result<Projection> {
        let pv_name = pv.name_any();

        let Some(volume_name) = self.volume_name_for(pv)? else {
            debug!(pv = %pv_name, "PV not provisioned by this driver, skipping");
            return Ok(Projection::Skipped(SkipReason::ForeignDriver));
        };

        if pv.metadata.deletion_timestamp.is_some() {
            return Ok(Projection::Skipped(SkipReason::PvDeleting));
        }

        let Some(volume) = self.cache.volume(&volume_name) else {
            debug!(pv = %pv_name, volume = %volume_name, "Volume not found, nothing to project");
            return Ok(Projection::Skipped(SkipReason::VolumeNotFound));
        };

        let observed = self.observe(pv);
        let previous = volume.kubernetes_status();
        let next = project(&previous, &observed, &self.clock.now_rfc3339());

        if status_equivalent(&previous, &next) {
            return Ok(Projection::Projected {
                volume: (*volume).clone(),
                written: false,
            });
        }

        match self.write(&volume, next).await? {
            Some(updated) => {
                info!(
                    pv = %pv_name,
                    volume = %volume_name,
                    pvc = %updated.kubernetes_status().pvc_name,
                    workloads = updated.kubernetes_status().workloads_status.len(),
                    "Updated volume Kubernetes status"
                );
                Ok(Projection::Projected {
                    volume: updated,
                    written: true,
                })
            }
            None => Ok(Projection::Skipped(SkipReason::VolumeNotFound)),
        }
    }

    /// Record that every reference held through `pv_name` is lost.
    ///
    /// Skipped when the Volume was meanwhile projected from another PV.
    pub async fn record_references_lost(&self, pv_name: &str, volume: &Volume) -> Result<Projection> {
        let previous = volume.kubernetes_status();
        if !previous.pv_name.is_empty() && previous.pv_name != pv_name {
            debug!(
                pv = %pv_name,
                volume = %volume.name_any(),
                current_pv = %previous.pv_name,
                "Volume already projected from another PV, skipping deletion bookkeeping"
            );
            return Ok(Projection::Skipped(SkipReason::VolumeReused));
        }

        let next = mark_references_lost(&previous, &self.clock.now_rfc3339());
        if status_equivalent(&previous, &next) {
            return Ok(Projection::Projected {
                volume: volume.clone(),
                written: false,
            });
        }

        match self.write(volume, next).await? {
            Some(updated) => {
                info!(
                    pv = %pv_name,
                    volume = %volume.name_any(),
                    last_pvc_ref_at = %updated.kubernetes_status().last_pvc_ref_at,
                    last_pod_ref_at = %updated.kubernetes_status().last_pod_ref_at,
                    "Recorded reference loss for deleted PV"
                );
                Ok(Projection::Projected {
                    volume: updated,
                    written: true,
                })
            }
            None => Ok(Projection::Skipped(SkipReason::VolumeNotFound)),
        }
    }

    /// Gather the facts the projection depends on
    fn observe(&self, pv: &PersistentVolume) -> ObservedFacts {
        let pv_name = pv.name_any();
        let pv_status = pv
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();

        let claim = pv
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|r| {
                let name = r.name.clone().filter(|n| !n.is_empty())?;
                Some(ClaimRef {
                    namespace: r.namespace.clone().unwrap_or_default(),
                    name,
                })
            });

        let Some(claim) = claim else {
            return ObservedFacts {
                pv_name,
                pv_status,
                claim: None,
                workloads: Vec::new(),
            };
        };

        match self.cache.persistent_volume_claim(&claim.namespace, &claim.name) {
            None => debug!(
                pv = %pv_name,
                pvc = %claim.name,
                namespace = %claim.namespace,
                "Claim not in cache yet"
            ),
            Some(pvc) => {
                let bound_to = pvc.spec.as_ref().and_then(|s| s.volume_name.as_deref());
                if bound_to.is_some_and(|v| v != pv_name) {
                    debug!(pv = %pv_name, pvc = %claim.name, "Claim is bound to a different PV");
                }
            }
        }

        let workloads = self
            .cache
            .pods(&claim.namespace)
            .iter()
            .filter(|p| pod_uses_claim(p, &claim.name) && !is_terminating(p))
            .map(|p| workload_status(p))
            .collect();

        ObservedFacts {
            pv_name,
            pv_status,
            claim: Some(claim),
            workloads,
        }
    }

    /// Persist a new projection; `None` if the Volume disappeared meanwhile
    async fn write(&self, volume: &Volume, status: KubernetesStatus) -> Result<Option<Volume>> {
        match self
            .writer
            .update_volume_status(&volume.with_kubernetes_status(status))
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

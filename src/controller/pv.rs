//! PV Controller
//!
//! Entry point of one reconcile: project a PV onto its Volume, then let the
//! disaster-recovery evaluator judge the PV's attachment against the fresh
//! projection. PVs being deleted take a separate path that only records the
//! loss of every reference the Volume held.

use super::recovery::{DisasterRecoveryEvaluator, RecoveryDecision};
use super::status::{Projection, SkipReason, StatusProjector};
use crate::domain::ports::{ClusterWriter, Clock, ObjectCache};
use crate::error::{Error, Result};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default CSI driver name
pub const DEFAULT_DRIVER_NAME: &str = "block.csi.billyronks.io";

/// Default namespace of the storage system's resources
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "block-system";

// =============================================================================
// Configuration
// =============================================================================

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// CSI driver name identifying this storage system's PVs
    pub driver_name: String,
    /// Namespace holding Volume and other system resources
    pub system_namespace: String,
    /// Maximum concurrent reconciles
    pub concurrency: u16,
    /// Requeue delay after a status write conflict
    pub conflict_requeue: Duration,
    /// First retry delay after a transient failure
    pub initial_backoff: Duration,
    /// Ceiling of the retry delay
    pub max_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            concurrency: 8,
            conflict_requeue: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// What one sync did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    /// Deletion path ran for a deleted or deleting PV
    DeletionRecorded { volume: String, written: bool },
    /// Regular path ran
    Reconciled {
        volume: String,
        status_written: bool,
        recovery: RecoveryDecision,
    },
}

impl SyncOutcome {
    /// Whether the Volume status was written
    pub fn status_written(&self) -> bool {
        match self {
            SyncOutcome::Skipped(_) => false,
            SyncOutcome::DeletionRecorded { written, .. } => *written,
            SyncOutcome::Reconciled { status_written, .. } => *status_written,
        }
    }

    /// Whether a VolumeAttachment delete was requested
    pub fn attachment_deleted(&self) -> bool {
        matches!(self, SyncOutcome::Reconciled { recovery, .. } if recovery.is_deleted())
    }
}

/// Name of a PV from a queue key; both `name` and `namespace/name` are accepted
pub fn split_key(key: &str) -> Result<&str> {
    let name = match key.split_once('/') {
        None => key,
        Some((_, name)) if !name.contains('/') => name,
        Some(_) => "",
    };

    if name.is_empty() {
        return Err(Error::InvalidObject {
            kind: "PersistentVolume".into(),
            name: key.to_string(),
            reason: "malformed queue key".into(),
        });
    }
    Ok(name)
}

// =============================================================================
// PV Controller
// =============================================================================

/// Keeps Volume status in step with PVs and releases dead nodes' attachments
pub struct PvController {
    config: ControllerConfig,
    cache: Arc<dyn ObjectCache>,
    projector: StatusProjector,
    evaluator: DisasterRecoveryEvaluator,
    /// PV name to Volume name, recorded when a PV of this driver is deleted
    pending_deletions: DashMap<String, String>,
}

impl PvController {
    /// Create a new PV controller
    pub fn new(
        config: ControllerConfig,
        cache: Arc<dyn ObjectCache>,
        writer: Arc<dyn ClusterWriter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let projector = StatusProjector::new(cache.clone(), writer.clone(), clock, config.driver_name.clone());
        let evaluator = DisasterRecoveryEvaluator::new(cache.clone(), writer);

        Self {
            config,
            cache,
            projector,
            evaluator,
            pending_deletions: DashMap::new(),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Reconcile the PV named by `key`. Idempotent; safe to call out of order.
    #[instrument(skip(self), fields(pv = %key))]
    pub async fn sync_kubernetes_status(&self, key: &str) -> Result<SyncOutcome> {
        let name = split_key(key)?;

        if let Some(volume_name) = self.pending_deletion(name) {
            if let Some(outcome) = self.sync_pending_deletion(name, &volume_name).await? {
                return Ok(outcome);
            }
        }

        let Some(pv) = self.cache.persistent_volume(name) else {
            debug!("PV not found");
            return Ok(SyncOutcome::Skipped(SkipReason::PvNotFound));
        };

        if pv.metadata.deletion_timestamp.is_some() && self.enqueue_pv_deletion(&pv) {
            if let Some(volume_name) = self.pending_deletion(name) {
                if let Some(outcome) = self.sync_pending_deletion(name, &volume_name).await? {
                    return Ok(outcome);
                }
            }
        }

        match self.projector.project(&pv).await? {
            Projection::Skipped(reason) => Ok(SyncOutcome::Skipped(reason)),
            Projection::Projected { volume, written } => {
                let recovery = self.evaluator.evaluate(name, &volume).await?;
                Ok(SyncOutcome::Reconciled {
                    volume: volume.name_any(),
                    status_written: written,
                    recovery,
                })
            }
        }
    }

    /// Record that a PV of this driver is being deleted, so the next sync
    /// takes the deletion path even if the PV is gone from cache by then.
    ///
    /// Returns false for PVs of other drivers.
    pub fn enqueue_pv_deletion(&self, pv: &PersistentVolume) -> bool {
        let pv_name = pv.name_any();
        match self.projector.volume_name_for(pv) {
            Ok(Some(volume_name)) => {
                debug!(pv = %pv_name, volume = %volume_name, "Recorded PV deletion");
                self.pending_deletions.insert(pv_name, volume_name);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pv = %pv_name, error = %e, "Ignoring deletion of malformed PV");
                false
            }
        }
    }

    /// Number of PV deletions not yet recorded on their Volume
    pub fn pending_deletions(&self) -> usize {
        self.pending_deletions.len()
    }

    fn pending_deletion(&self, pv_name: &str) -> Option<String> {
        self.pending_deletions.get(pv_name).map(|v| v.value().clone())
    }

    /// Run the deletion path; `None` when the PV was recreated and the
    /// regular path applies instead
    async fn sync_pending_deletion(&self, pv_name: &str, volume_name: &str) -> Result<Option<SyncOutcome>> {
        let Some(volume) = self.cache.volume(volume_name) else {
            debug!(volume = %volume_name, "Volume of deleted PV not found");
            self.pending_deletions.remove(pv_name);
            return Ok(Some(SyncOutcome::Skipped(SkipReason::VolumeNotFound)));
        };

        let recreated = self
            .cache
            .persistent_volume(pv_name)
            .is_some_and(|pv| pv.metadata.deletion_timestamp.is_none());
        if recreated {
            debug!(volume = %volume_name, "PV recreated, dropping deletion record");
            self.pending_deletions.remove(pv_name);
            return Ok(None);
        }

        // the record stays until the bookkeeping is persisted, so a failed write is retried
        let projection = self.projector.record_references_lost(pv_name, &volume).await?;
        self.pending_deletions.remove(pv_name);

        Ok(Some(match projection {
            Projection::Skipped(reason) => SyncOutcome::Skipped(reason),
            Projection::Projected { volume, written } => SyncOutcome::DeletionRecorded {
                volume: volume.name_any(),
                written,
            },
        }))
    }
}

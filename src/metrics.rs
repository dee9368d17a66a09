//! Controller Metrics
//!
//! Prometheus collectors for the reconcile loop, registered into a caller
//! supplied registry and served by the binary's `/metrics` endpoint.

use crate::controller::pv::SyncOutcome;
use crate::error::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Reconcile metrics
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconciles by result: `reconciled`, `skipped`, `deletion` or an error kind
    reconciles: IntCounterVec,
    status_updates: IntCounter,
    attachment_deletions: IntCounter,
    duration: Histogram,
}

impl ControllerMetrics {
    /// Create the collectors and register them in `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let reconciles = IntCounterVec::new(
            Opts::new("block_volume_reconcile_total", "PV reconciles by result"),
            &["result"],
        )?;
        let status_updates = IntCounter::new(
            "block_volume_status_updates_total",
            "Volume kubernetesStatus writes",
        )?;
        let attachment_deletions = IntCounter::new(
            "block_volume_attachment_deletions_total",
            "VolumeAttachments deleted after their node was confirmed gone",
        )?;
        let duration = Histogram::with_opts(HistogramOpts::new(
            "block_volume_reconcile_duration_seconds",
            "Duration of PV reconciles",
        ))?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(status_updates.clone()))?;
        registry.register(Box::new(attachment_deletions.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            reconciles,
            status_updates,
            attachment_deletions,
            duration,
        })
    }

    /// Record one reconcile
    pub fn observe(&self, result: &Result<SyncOutcome>, elapsed: Duration) {
        self.duration.observe(elapsed.as_secs_f64());

        let label = match result {
            Ok(SyncOutcome::Skipped(_)) => "skipped".to_string(),
            Ok(SyncOutcome::DeletionRecorded { .. }) => "deletion".to_string(),
            Ok(SyncOutcome::Reconciled { .. }) => "reconciled".to_string(),
            Err(e) => e.kind().to_string(),
        };
        self.reconciles.with_label_values(&[&label]).inc();

        if let Ok(outcome) = result {
            if outcome.status_written() {
                self.status_updates.inc();
            }
            if outcome.attachment_deleted() {
                self.attachment_deletions.inc();
            }
        }
    }
}

/// Render a registry in the Prometheus text format
pub fn encode(registry: &Registry) -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::recovery::RecoveryDecision;
    use crate::controller::status::SkipReason;
    use crate::error::Error;

    #[test]
    fn test_observe_outcomes() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::register(&registry).unwrap();

        metrics.observe(
            &Ok(SyncOutcome::Reconciled {
                volume: "vol-1".into(),
                status_written: true,
                recovery: RecoveryDecision::Deleted {
                    attachment: "va-1".into(),
                    node: "node-1".into(),
                },
            }),
            Duration::from_millis(5),
        );
        metrics.observe(&Ok(SyncOutcome::Skipped(SkipReason::ForeignDriver)), Duration::ZERO);
        metrics.observe(&Err(Error::Unavailable("apiserver".into())), Duration::ZERO);

        assert_eq!(metrics.reconciles.with_label_values(&["reconciled"]).get(), 1);
        assert_eq!(metrics.reconciles.with_label_values(&["skipped"]).get(), 1);
        assert_eq!(metrics.reconciles.with_label_values(&["transient"]).get(), 1);
        assert_eq!(metrics.status_updates.get(), 1);
        assert_eq!(metrics.attachment_deletions.get(), 1);
        assert_eq!(metrics.duration.get_sample_count(), 3);

        let (content_type, body) = encode(&registry).unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("block_volume_reconcile_total{result=\"skipped\"} 1"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        ControllerMetrics::register(&registry).unwrap();
        assert!(ControllerMetrics::register(&registry).is_err());
    }
}

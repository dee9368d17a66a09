//! Controllers
//!
//! The reconcile logic and the loop that drives it:
//! - StatusProjector: projects a PV, its claim and pods onto the Volume status
//! - DisasterRecoveryEvaluator: releases attachments of confirmed-gone nodes
//! - PvController: per-key sync composing the two, plus the PV-deletion path
//! - triggers / runner: event-to-key mapping and the `kube::runtime` driver

pub mod pv;
pub mod recovery;
pub mod runner;
pub mod status;
pub mod triggers;

#[cfg(test)]
pub(crate) mod testing;

pub use pv::{split_key, ControllerConfig, PvController, SyncOutcome};
pub use recovery::{DisasterRecoveryEvaluator, RecoveryDecision, RetainReason};
pub use status::{Projection, SkipReason, StatusProjector};

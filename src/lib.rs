//! Block Volume Controller
//!
//! Keeps the block-storage system's `Volume` resources in step with the native
//! Kubernetes objects that use them, and releases the VolumeAttachments of
//! nodes that are confirmed gone.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Reconcile Loop Driver (runner)                        │
//! │      PV watch + Pod / PVC / VolumeAttachment / Volume / StorageNode watches  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              PvController                                    │
//! │  ┌─────────────────────────────┐      ┌───────────────────────────────────┐  │
//! │  │      Status Projector       │ ───▶ │   Disaster-Recovery Evaluator     │  │
//! │  │  Volume.status.kubernetes…  │      │   VolumeAttachment force-release  │  │
//! │  └──────────────┬──────────────┘      └─────────────────┬─────────────────┘  │
//! │                 │                                       │                    │
//! ├─────────────────┴───────────────────────────────────────┴────────────────────┤
//! │                   Ports: ObjectCache / ClusterWriter / Clock                  │
//! │  ┌─────────────────────────────┐      ┌───────────────────────────────────┐  │
//! │  │  KubeCluster (reflectors)   │      │  InMemoryCluster (tests)          │  │
//! │  └─────────────────────────────┘      └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Status projection, disaster recovery and the reconcile loop
//! - [`cluster`]: Kubernetes and in-memory implementations of the ports
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Ports and the pure projection rules
//! - [`metrics`]: Prometheus collectors
//! - [`error`]: Error types and handling

pub mod cluster;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use cluster::{InMemoryCluster, KubeCluster};

pub use controller::{
    ControllerConfig, PvController, SyncOutcome,
    StatusProjector, SkipReason,
    DisasterRecoveryEvaluator, RecoveryDecision, RetainReason,
};

pub use crd::{
    Volume, VolumeSpec, VolumeStatus, VolumeState,
    KubernetesStatus, WorkloadStatus,
    StorageNode, StorageNodeSpec, StorageNodeStatus, NodeHealth,
};

pub use domain::ports::{ClusterWriter, Clock, ObjectCache, SystemClock};

pub use error::{Error, ErrorAction, ErrorKind, Result};

pub use metrics::ControllerMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

//! Reconcile Loop Driver
//!
//! Runs [`PvController`] under `kube::runtime::Controller`: one queue keyed by
//! PV name, at most one in-flight reconcile per key, secondary watches mapped
//! to PV keys by the trigger mappers. PV deletions are observed by a separate
//! watcher, since the controller never reconciles an object it no longer sees.

use super::pv::{ControllerConfig, PvController, SyncOutcome};
use super::triggers;
use crate::cluster::KubeCluster;
use crate::crd::{StorageNode, Volume};
use crate::domain::ports::{ObjectCache, SystemClock};
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::ControllerMetrics;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Context
// =============================================================================

/// State shared by all reconciles
pub struct Context {
    controller: Arc<PvController>,
    metrics: ControllerMetrics,
    /// Retry state of keys failing with transient errors
    backoffs: DashMap<String, ExponentialBackoff>,
}

impl Context {
    pub fn new(controller: Arc<PvController>, metrics: ControllerMetrics) -> Self {
        Self {
            controller,
            metrics,
            backoffs: DashMap::new(),
        }
    }

    /// Next retry delay for a failing key
    fn next_backoff(&self, key: &str) -> Duration {
        let config = self.controller.config();
        let mut backoff = self
            .backoffs
            .entry(key.to_string())
            .or_insert_with(|| retry_backoff(config));
        backoff
            .next_backoff()
            .unwrap_or(config.max_backoff)
            .min(config.max_backoff)
    }

    fn reset_backoff(&self, key: &str) {
        self.backoffs.remove(key);
    }
}

fn retry_backoff(config: &ControllerConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff)
        .with_max_interval(config.max_backoff)
        .with_max_elapsed_time(None)
        .build()
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile one PV
pub async fn reconcile(pv: Arc<PersistentVolume>, ctx: Arc<Context>) -> Result<Action> {
    let name = pv.name_any();
    let started = Instant::now();

    let result = ctx.controller.sync_kubernetes_status(&name).await;
    ctx.metrics.observe(&result, started.elapsed());

    let outcome = result?;
    ctx.reset_backoff(&name);
    debug!(pv = %name, outcome = ?outcome, "Reconciled");

    Ok(Action::await_change())
}

/// Requeue policy for failed reconciles
pub fn error_policy(pv: Arc<PersistentVolume>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = pv.name_any();

    match error.action() {
        ErrorAction::Recompute => {
            debug!(pv = %name, error = %error, "Status write conflicted, recomputing");
            Action::requeue(ctx.controller.config().conflict_requeue)
        }
        ErrorAction::RequeueWithBackoff => {
            let delay = ctx.next_backoff(&name);
            warn!(pv = %name, error = %error, retry_in = ?delay, "Reconcile failed");
            Action::requeue(delay)
        }
        ErrorAction::NoRequeue => {
            ctx.reset_backoff(&name);
            warn!(pv = %name, error = %error, kind = %error.kind(), "Reconcile failed permanently");
            Action::await_change()
        }
    }
}

// =============================================================================
// PV Deletions
// =============================================================================

/// Sync a deleted PV, retrying transient failures.
///
/// The retries count as one reconcile in the metrics.
pub async fn sync_deleted_pv(ctx: Arc<Context>, pv_name: String) -> Result<SyncOutcome> {
    let started = Instant::now();
    let controller = ctx.controller.clone();
    let op = || {
        let controller = controller.clone();
        let pv_name = pv_name.clone();
        async move {
            controller.sync_kubernetes_status(&pv_name).await.map_err(|e| {
                if e.is_retryable() {
                    debug!(pv = %pv_name, error = %e, "Retrying deleted PV sync");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    };

    let result = backoff::future::retry(retry_backoff(controller.config()), op).await;
    ctx.metrics.observe(&result, started.elapsed());
    result
}

/// Watch PVs for deletions and run the deletion path for each one of this driver
pub async fn watch_pv_deletions(api: Api<PersistentVolume>, ctx: Arc<Context>, shutdown: CancellationToken) {
    let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Deleted(pv))) => {
                    if !ctx.controller.enqueue_pv_deletion(&pv) {
                        continue;
                    }
                    let ctx = ctx.clone();
                    let shutdown = shutdown.clone();
                    let pv_name = pv.name_any();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = sync_deleted_pv(ctx, pv_name.clone()) => {
                                if let Err(e) = result {
                                    warn!(pv = %pv_name, error = %e, "Failed to record PV deletion");
                                }
                            }
                        }
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(error = %e, "PV deletion watch error"),
                None => break,
            },
        }
    }
    debug!("PV deletion watcher stopped");
}

// =============================================================================
// Run
// =============================================================================

fn pv_refs(names: Vec<String>) -> Vec<ObjectRef<PersistentVolume>> {
    names.iter().map(|name| ObjectRef::new(name)).collect()
}

/// Run the controller until `shutdown` is cancelled
pub async fn run(
    client: Client,
    config: ControllerConfig,
    metrics: ControllerMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        driver = %config.driver_name,
        namespace = %config.system_namespace,
        concurrency = config.concurrency,
        "Starting block volume controller"
    );

    let cluster = KubeCluster::start(client.clone(), &config.system_namespace, shutdown.clone());
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        ready = cluster.wait_until_ready() => ready?,
    }

    let cache: Arc<dyn ObjectCache> = cluster.clone();
    let controller = Arc::new(PvController::new(
        config.clone(),
        cache.clone(),
        cluster,
        Arc::new(SystemClock),
    ));
    let ctx = Arc::new(Context::new(controller, metrics));

    tokio::spawn(watch_pv_deletions(
        Api::all(client.clone()),
        ctx.clone(),
        shutdown.clone(),
    ));

    let pod_cache = cache.clone();
    let claim_cache = cache.clone();
    let volume_cache = cache.clone();
    let node_cache = cache;

    Controller::new(Api::<PersistentVolume>::all(client.clone()), watcher::Config::default())
        .watches(Api::<Pod>::all(client.clone()), watcher::Config::default(), move |pod| {
            pv_refs(triggers::pvs_for_pod(pod_cache.as_ref(), &pod))
        })
        .watches(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
            move |pvc| pv_refs(triggers::pvs_for_claim(claim_cache.as_ref(), &pvc)),
        )
        .watches(
            Api::<VolumeAttachment>::all(client.clone()),
            watcher::Config::default(),
            |va| pv_refs(triggers::pvs_for_attachment(&va)),
        )
        .watches(
            Api::<Volume>::namespaced(client.clone(), &config.system_namespace),
            watcher::Config::default(),
            move |volume| pv_refs(triggers::pvs_for_volume(volume_cache.as_ref(), &volume)),
        )
        .watches(
            Api::<StorageNode>::all(client),
            watcher::Config::default(),
            move |node| pv_refs(triggers::pvs_for_node(node_cache.as_ref(), &node)),
        )
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = %e, "Controller event");
            }
        })
        .await;

    info!("Block volume controller stopped");
    Ok(())
}

//! Block Volume Controller
//!
//! Projects PersistentVolumes, their claims and the pods using them onto the
//! storage system's `Volume` resources, and force-releases the
//! VolumeAttachments of nodes confirmed gone.
//!
//! # Endpoints
//!
//! ```text
//! health  (--health-addr)   /healthz  /livez  /readyz
//! metrics (--metrics-addr)  /metrics
//! ```

use clap::Parser;
use kube::CustomResourceExt;
use prometheus::Registry;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use block_volume_controller::controller::runner;
use block_volume_controller::metrics;
use block_volume_controller::{ControllerConfig, ControllerMetrics, Error, Result, StorageNode, Volume};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Block Volume Controller - Kubernetes status projection and attachment recovery
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSI driver name of this storage system's PVs
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = "block.csi.billyronks.io")]
    driver_name: String,

    /// Namespace holding Volume resources
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = "block-system")]
    system_namespace: String,

    /// Maximum concurrent reconciles
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value = "8")]
    concurrency: u16,

    /// Requeue delay after a status write conflict, in seconds
    #[arg(long, env = "CONFLICT_REQUEUE_SECS", default_value = "1")]
    conflict_requeue_secs: u64,

    /// Ceiling of the retry delay after transient failures, in seconds
    #[arg(long, env = "MAX_BACKOFF_SECS", default_value = "300")]
    max_backoff_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CustomResourceDefinitions as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn controller_config(&self) -> Result<ControllerConfig> {
        if self.concurrency == 0 {
            return Err(Error::Configuration("--concurrency must be at least 1".into()));
        }
        if self.driver_name.is_empty() {
            return Err(Error::Configuration("--driver-name must not be empty".into()));
        }

        Ok(ControllerConfig {
            driver_name: self.driver_name.clone(),
            system_namespace: self.system_namespace.clone(),
            concurrency: self.concurrency,
            conflict_requeue: Duration::from_secs(self.conflict_requeue_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(1)),
            ..Default::default()
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", serde_yaml::to_string(&Volume::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&StorageNode::crd())?);
        return Ok(());
    }

    // Initialize logging
    init_logging(&args);

    let config = args.controller_config()?;

    info!("Starting Block Volume Controller");
    info!("  Version: {}", block_volume_controller::VERSION);
    info!("  Driver: {}", config.driver_name);
    info!("  System namespace: {}", config.system_namespace);
    info!("  Concurrency: {}", config.concurrency);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let registry = Registry::new();
    let controller_metrics = ControllerMetrics::register(&registry)?;

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = kube::Client::try_default().await?;
    runner::run(client, config, controller_metrics, shutdown.clone()).await?;

    shutdown.cancel();
    info!("Controller shutdown complete");
    Ok(())
}

// =============================================================================
// Shutdown
// =============================================================================

async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, registry: Registry, shutdown: CancellationToken) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics::encode(&registry) {
                            Ok((content_type, buffer)) => {
                                let mut response = text_response(StatusCode::OK, buffer);
                                if let Ok(value) = content_type.parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

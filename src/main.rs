//! Bookstore Operator - reconciles Bookstore custom resources

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bookstore_operator::client::KubeClientImpl;
use bookstore_operator::config::ControllerConfig;
use bookstore_operator::controller::{Context, Controller};
use bookstore_operator::crd::Bookstore;
use bookstore_operator::events::KubeEventPublisher;
use bookstore_operator::queue::RateLimitConfig;
use bookstore_operator::store::KubeStateStore;
use bookstore_operator::telemetry::{init_telemetry, TelemetryConfig};
use bookstore_operator::CONTROLLER_NAME;

/// Bookstore Operator - keeps each Bookstore's Deployment and Service converged
#[derive(Parser, Debug)]
#[command(name = "bookstore-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "BOOKSTORE_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "BOOKSTORE_NAMESPACE")]
    namespace: Option<String>,

    /// Requeue delay after the first failure of a key, in milliseconds
    #[arg(long, env = "BOOKSTORE_BASE_DELAY_MS", default_value_t = 5)]
    base_delay_ms: u64,

    /// Ceiling of the per-key requeue delay, in seconds
    #[arg(long, env = "BOOKSTORE_MAX_DELAY_SECS", default_value_t = 1000)]
    max_delay_secs: u64,

    /// Sustained rate of requeues across all keys
    #[arg(long, env = "BOOKSTORE_QPS", default_value_t = 50.0, value_parser = parse_qps)]
    qps: f64,

    /// Burst size of the requeue token bucket
    #[arg(long, env = "BOOKSTORE_BURST", default_value_t = 300)]
    burst: u32,

    /// Period of the full cache resync in seconds (0 disables it)
    #[arg(long, env = "BOOKSTORE_RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "BOOKSTORE_LOG_JSON")]
    log_json: bool,
}

/// Requeue rate must be a positive finite number
fn parse_qps(raw: &str) -> Result<f64, String> {
    let qps: f64 = raw
        .parse()
        .map_err(|e| format!("invalid rate {raw:?}: {e}"))?;
    if qps.is_finite() && qps > 0.0 {
        Ok(qps)
    } else {
        Err(format!("rate must be a positive finite number, got {raw}"))
    }
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            namespace: self.namespace.clone(),
            rate_limit: RateLimitConfig {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_secs(self.max_delay_secs),
                qps: self.qps,
                burst: self.burst,
            },
            resync_period: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Bookstore::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig { json: cli.log_json })?;
    run_controller(cli.controller_config()).await
}

/// Run the controller until SIGINT or SIGTERM
async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    info!(workers = config.workers, namespace = ?config.namespace, "Starting Bookstore controller");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let store = Arc::new(KubeStateStore::new(client.clone(), config.namespace.clone()));
    let watches = store.start(config.resync_period, cancel.clone());

    let ctx = Context::builder(store, Arc::new(KubeClientImpl::new(client.clone())))
        .events(Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)))
        .build();

    let result = Controller::new(Arc::new(ctx), &config).run(cancel.clone()).await;

    cancel.cancel();
    for watch in watches {
        if let Err(e) = watch.await {
            error!(error = %e, "watch task ended abnormally");
        }
    }

    result.map_err(|e| anyhow::anyhow!("Controller failed: {}", e))?;
    info!("Bookstore controller stopped");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
    cancel.cancel();
}

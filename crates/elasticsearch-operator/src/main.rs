//! Elasticsearch Kubernetes Operator
//!
//! This operator manages ElasticsearchCluster custom resources in Kubernetes,
//! converging node pool workloads, service accounts and services towards the
//! declared cluster specification.

use anyhow::{Context, Result};
use clap::Parser;
use elasticsearch_operator::config::ControllerConfig;
use elasticsearch_operator::controller::Controller;
use elasticsearch_operator::convergence::KubeClusterStrategy;
use elasticsearch_operator::crd::ElasticsearchCluster;
use elasticsearch_operator::status::KubeStatusRecorder;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Elasticsearch Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "elasticsearch-operator")]
#[command(about = "Kubernetes operator for Elasticsearch clusters")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Seconds between full resyncs of every cluster (0 disables)
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 300)]
    resync_seconds: u64,

    /// Seconds to wait for the caches before starting workers anyway
    #[arg(long, env = "CACHE_SYNC_TIMEOUT_SECONDS", default_value_t = 60)]
    cache_sync_timeout_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_interval_secs: self.resync_seconds,
            cache_sync_timeout_secs: self.cache_sync_timeout_seconds,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.controller_config();
    config.check().context("Invalid controller configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        workers = config.workers,
        "Starting Elasticsearch Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let namespace = (!args.namespace.is_empty()).then_some(args.namespace.as_str());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let workers = config.workers;
    let (controller, informers) = Controller::new(
        config,
        Arc::new(KubeClusterStrategy::new(client.clone())),
        Arc::new(KubeStatusRecorder::new(client.clone())),
    );
    let informer_tasks = informers.spawn(client, namespace, shutdown_rx.clone());

    controller
        .run(workers, shutdown_rx)
        .await
        .context("Controller failed")?;

    for task in informer_tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Informer terminated abnormally");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = ElasticsearchCluster::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}

//! LavinMQ Kubernetes Operator
//!
//! This operator manages LavinMQ custom resources in Kubernetes,
//! deploying LavinMQ brokers as StatefulSets and validating changes to
//! them through an admission webhook.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use kube::Client;
use lavinmq_operator::{controller, crd, retry::RetryConfig, webhook};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// LavinMQ Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "lavinmq-operator")]
#[command(about = "Kubernetes operator for LavinMQ message broker clusters")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Admission webhook address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Directory holding the webhook's tls.crt and tls.key
    #[arg(
        long,
        env = "WEBHOOK_CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    webhook_cert_dir: PathBuf,

    /// Serve the webhook over plain HTTP (local development only)
    #[arg(long, env = "DISABLE_WEBHOOK_TLS", default_value = "false")]
    disable_webhook_tls: bool,

    /// Do not start the admission webhook
    #[arg(long, env = "NO_WEBHOOK", default_value = "false")]
    no_webhook: bool,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Attempts per child write before a conflict fails the pass
    #[arg(long, env = "CONFLICT_RETRIES", default_value = "5")]
    conflict_retries: u32,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    // Both kube and axum-server pull in rustls; pick the provider explicitly
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        anyhow::bail!("Failed to install rustls crypto provider: {:?}", e);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        "Starting LavinMQ Kubernetes Operator"
    );

    // Initialize metrics
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // Start admission webhook
    if !args.no_webhook {
        let webhook_addr = args.webhook_addr;
        let cert_dir = (!args.disable_webhook_tls).then(|| args.webhook_cert_dir.clone());
        tokio::spawn(async move {
            if let Err(e) = webhook::serve_webhook(webhook_addr, cert_dir.as_deref()).await {
                tracing::error!(error = %e, "Admission webhook failed");
            }
        });
    }

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Parse namespace (empty string means cluster-wide)
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace)
    };

    // Run the controller
    controller::run_controller(
        client,
        namespace,
        RetryConfig::with_max_attempts(args.conflict_retries),
    )
    .await
    .context("Controller failed")?;

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

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    info!(address = %addr, "Starting health server");

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    axum::serve(listener, app)
        .await
        .context("Health server failed")?;

    Ok(())
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = crd::LavinMQ::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}

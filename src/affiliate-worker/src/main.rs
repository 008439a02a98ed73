//! Affiliate worker — runs payout batches and provider reconciliation on a
//! schedule against the affiliate core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use affiliate_core::config::AppConfig;
use affiliate_pipeline::{AffiliateService, PayoutBatchJob, ReconciliationJob};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "affiliate-worker")]
#[command(about = "Affiliate attribution, commission and payout settlement worker")]
#[command(version)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, env = "AFFILIATE_ENGINE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "AFFILIATE_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// Metrics port (overrides config)
    #[arg(long, env = "AFFILIATE_ENGINE__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Run one payout batch and one reconciliation pass, then exit
    #[arg(long, default_value_t = false)]
    run_once: bool,
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Affiliate worker starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        currency = %config.payouts.currency,
        payout_period_days = config.jobs.payout_period_days,
        payout_interval_secs = config.jobs.payout_interval_secs,
        reconcile_interval_secs = config.jobs.reconcile_interval_secs,
        "Configuration loaded"
    );

    let jobs_config = config.jobs.clone();
    // Nothing in this process ingests touches or conversions, so in-memory
    // stores only exercise the job loop. A persistent `Backend` shared with
    // the ingestion side plugs in here through `AffiliateService::new`.
    let (service, _stores) = AffiliateService::in_memory(config.clone());
    warn!("Running on in-memory stores, scheduled jobs see no ingested data");
    let service = Arc::new(service);
    let batch = PayoutBatchJob::new(service.clone(), &jobs_config);
    let reconcile = ReconciliationJob::new(service.clone(), &jobs_config);

    if cli.run_once {
        let (start, end) = batch.period_ending(Utc::now().date_naive());
        let report = batch.run(start, end).await;
        let reconciled = reconcile.run(Utc::now()).await;
        info!(
            built = report.built,
            errors = report.errors,
            reconciled = reconciled.checked,
            "Single pass finished"
        );
        return Ok(());
    }

    if let Err(e) = start_metrics(&config) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let batch_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(jobs_config.payout_interval_secs.max(1)));
        loop {
            interval.tick().await;
            let (start, end) = batch.period_ending(Utc::now().date_naive());
            batch.run(start, end).await;
        }
    });

    let reconcile_secs = config.jobs.reconcile_interval_secs.max(1);
    let reconcile_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(reconcile_secs));
        loop {
            interval.tick().await;
            reconcile.run(Utc::now()).await;
        }
    });

    info!("Affiliate worker is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    batch_task.abort();
    reconcile_task.abort();

    Ok(())
}

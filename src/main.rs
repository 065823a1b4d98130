use anyhow::{Context, Result};
use kube::Client;
use serde::Serialize;
use tracing::info;

use kube_perf_collector::{build_collector, evaluate, load_config, CheckResult, PerformanceMetrics};

#[derive(Serialize)]
struct Output<'a> {
    check: &'a CheckResult,
    metrics: &'a PerformanceMetrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = load_config()?;
    info!(
        telemetry = cfg.telemetry_url.as_deref().unwrap_or("none"),
        history = cfg.include_history,
        "starting performance collection"
    );

    let client = Client::try_default().await.context("Failed to build kubernetes client")?;
    let collector = build_collector(client, &cfg)?;

    let metrics = collector.run().await?;
    let check = evaluate(&metrics, &cfg.thresholds);
    info!(status = ?check.status, "{}", check.message);

    let out = serde_json::to_string_pretty(&Output {
        check: &check,
        metrics: &metrics,
    })?;
    println!("{}", out);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

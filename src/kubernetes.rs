use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use tracing::info;

use crate::collector::MetricsCollector;
use crate::history::HistoryBuilder;
use crate::metrics::{AggregatedMetricsClient, CliFallbackClient, NodeInventoryClient, ProcessRunner, TelemetryClient};
use crate::types::Config;

/// Wire every source against one cluster connection.
///
/// Telemetry is only registered when `TELEMETRY_URL` is set. The `kubectl top`
/// client runs alongside the other derived sources and again as the fallback.
pub fn build_collector(client: Client, cfg: &Config) -> Result<MetricsCollector> {
    let telemetry = TelemetryClient::from_config(cfg)
        .context("Invalid telemetry configuration")?
        .map(Arc::new);

    let cli = Arc::new(CliFallbackClient::new(
        Arc::new(ProcessRunner::new(cfg.command_timeout)),
        cfg.kubectl_path.clone(),
    ));

    let mut collector = MetricsCollector::new(Arc::new(NodeInventoryClient::new(client.clone())), cfg);
    if let Some(t) = &telemetry {
        collector = collector.with_derived(t.clone());
    }
    collector = collector
        .with_derived(Arc::new(AggregatedMetricsClient::new(client)))
        .with_derived(cli.clone())
        .with_fallback(cli);

    if cfg.include_history {
        collector = collector.with_history(HistoryBuilder::from_config(cfg, telemetry.clone()));
    }

    info!(
        derived = collector.derived_count(),
        telemetry = telemetry.is_some(),
        history = cfg.include_history,
        "collector assembled"
    );
    Ok(collector)
}

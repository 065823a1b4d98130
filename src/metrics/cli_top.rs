use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::base::{set_if_unset, MetricsSource, SharedMetrics};
use crate::error::SourceError;
use crate::parsing::{normalize_quantity, parse_percent};
use crate::types::PerformanceMetrics;

/// Runs an external command and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, SourceError>;
}

/// Spawns real processes, each bounded by `timeout`.
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, SourceError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SourceError::Timeout {
                name: format!("{} {}", program, args.join(" ")),
                after: self.timeout,
            })??;
        if !output.status.success() {
            return Err(SourceError::Unavailable(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopNodeRow {
    pub name: String,
    pub cpu: f64,
    pub cpu_percent: Option<f64>,
    pub memory: f64,
    pub memory_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopPodRow {
    pub namespace: String,
    pub name: String,
    pub cpu: f64,
    pub memory: f64,
}

/// Parse `kubectl top nodes`: `NAME CPU(cores) CPU% MEMORY(bytes) MEMORY%`.
pub fn parse_top_nodes(output: &str) -> Vec<TopNodeRow> {
    data_rows(output)
        .filter_map(|cols| {
            if cols.len() < 5 {
                return None;
            }
            let cpu = normalize_quantity(cols[1]).ok()?;
            let memory = normalize_quantity(cols[3]).ok()?;
            Some(TopNodeRow {
                name: cols[0].to_string(),
                cpu,
                cpu_percent: parse_percent(cols[2]).ok(),
                memory,
                memory_percent: parse_percent(cols[4]).ok(),
            })
        })
        .collect()
}

/// Parse `kubectl top pods -A`: `NAMESPACE NAME CPU(cores) MEMORY(bytes)`.
pub fn parse_top_pods(output: &str) -> Vec<TopPodRow> {
    data_rows(output)
        .filter_map(|cols| {
            if cols.len() < 4 {
                return None;
            }
            Some(TopPodRow {
                namespace: cols[0].to_string(),
                name: cols[1].to_string(),
                cpu: normalize_quantity(cols[2]).ok()?,
                memory: normalize_quantity(cols[3]).ok()?,
            })
        })
        .collect()
}

fn data_rows(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| !cols.is_empty())
}

pub fn apply_top_nodes(metrics: &mut PerformanceMetrics, rows: &[TopNodeRow]) {
    for row in rows {
        if let Some(node) = metrics.nodes.get_mut(&row.name) {
            set_if_unset(&mut node.cpu_usage, row.cpu);
            set_if_unset(&mut node.memory_usage, row.memory);
        }
    }
    if let Some(avg) = mean(rows.iter().filter_map(|r| r.cpu_percent)) {
        set_if_unset(&mut metrics.cpu_utilization_percent, avg);
    }
    if let Some(avg) = mean(rows.iter().filter_map(|r| r.memory_percent)) {
        set_if_unset(&mut metrics.memory_utilization_percent, avg);
    }
}

pub fn apply_top_pods(metrics: &mut PerformanceMetrics, rows: &[TopPodRow]) {
    let mut by_namespace: HashMap<&str, (f64, f64)> = HashMap::new();
    for row in rows {
        let totals = by_namespace.entry(row.namespace.as_str()).or_default();
        totals.0 += row.cpu;
        totals.1 += row.memory;

        let pod = metrics.pod_mut(&row.namespace, &row.name);
        set_if_unset(&mut pod.cpu_usage, row.cpu);
        set_if_unset(&mut pod.memory_usage, row.memory);
    }
    for (namespace, (cpu, memory)) in by_namespace {
        let ns = metrics.namespace_mut(namespace);
        set_if_unset(&mut ns.cpu_usage, cpu);
        set_if_unset(&mut ns.memory_usage, memory);
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Last-resort source reading `kubectl top` tables.
pub struct CliFallbackClient {
    runner: Arc<dyn CommandRunner>,
    kubectl: String,
}

impl CliFallbackClient {
    pub fn new(runner: Arc<dyn CommandRunner>, kubectl: impl Into<String>) -> Self {
        Self {
            runner,
            kubectl: kubectl.into(),
        }
    }
}

#[async_trait]
impl MetricsSource for CliFallbackClient {
    fn name(&self) -> &str {
        "kubectl-top"
    }

    async fn collect(&self, shared: &SharedMetrics) -> Result<(), SourceError> {
        let mut last_error = None;

        match self.runner.run(&self.kubectl, &["top", "nodes"]).await {
            Ok(out) => {
                let rows = parse_top_nodes(&out);
                debug!(rows = rows.len(), "parsed kubectl top nodes");
                apply_top_nodes(&mut *shared.lock().await, &rows);
            }
            Err(e) => {
                warn!(error = %e, "kubectl top nodes failed");
                last_error = Some(e);
            }
        }

        match self.runner.run(&self.kubectl, &["top", "pods", "-A"]).await {
            Ok(out) => {
                let rows = parse_top_pods(&out);
                debug!(rows = rows.len(), "parsed kubectl top pods");
                apply_top_pods(&mut *shared.lock().await, &rows);
            }
            Err(e) => {
                warn!(error = %e, "kubectl top pods failed");
                if last_error.is_some() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

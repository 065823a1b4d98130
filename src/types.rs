use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub telemetry_url: Option<String>,
    pub telemetry_token: Option<String>,
    pub telemetry_insecure: bool,
    pub query_timeout: Duration,
    pub command_timeout: Duration,
    pub kubectl_path: String,
    pub collection_timeout: Duration,
    pub history_timeout: Duration,
    pub include_history: bool,
    pub history_samples: usize,
    pub history_step: Duration,
    pub top_k: usize,
    pub noise_floor_cpu_cores: f64,
    pub noise_floor_memory_bytes: f64,
    pub system_namespace_prefixes: Vec<String>,
    pub debug_payloads: bool,
    pub thresholds: Thresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telemetry_url: None,
            telemetry_token: None,
            telemetry_insecure: false,
            query_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(15),
            kubectl_path: "kubectl".to_string(),
            collection_timeout: Duration::from_secs(30),
            history_timeout: Duration::from_secs(120),
            include_history: false,
            history_samples: 24,
            history_step: Duration::from_secs(3600),
            top_k: 10,
            noise_floor_cpu_cores: 0.01,
            noise_floor_memory_bytes: 50.0 * 1024.0 * 1024.0,
            system_namespace_prefixes: vec!["kube-".to_string(), "openshift".to_string()],
            debug_payloads: false,
            thresholds: Thresholds::default(),
        }
    }
}

/// Percent thresholds used by the performance check.
#[derive(Debug, Clone, Serialize)]
pub struct Thresholds {
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub commitment_warning_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_warning_percent: 75.0,
            cpu_critical_percent: 90.0,
            memory_warning_percent: 80.0,
            memory_critical_percent: 95.0,
            commitment_warning_percent: 150.0,
        }
    }
}

/// Per-node resources. Cores for cpu, bytes for memory; `0.0` means unknown.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct NodeMetric {
    pub name: String,
    pub cpu_capacity: f64,
    pub cpu_allocatable: f64,
    pub cpu_usage: f64,
    pub memory_capacity: f64,
    pub memory_allocatable: f64,
    pub memory_usage: f64,
}

impl NodeMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Per-namespace resources. Requests and limits are sums over every container seen.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct NamespaceMetric {
    pub name: String,
    pub cpu_usage: f64,
    pub cpu_requests: f64,
    pub cpu_limits: f64,
    pub memory_usage: f64,
    pub memory_requests: f64,
    pub memory_limits: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_receive_bytes_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_transmit_bytes_per_sec: Option<f64>,
}

impl NamespaceMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_usage(&self) -> bool {
        self.cpu_usage > 0.0 || self.memory_usage > 0.0
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PodMetric {
    pub namespace: String,
    pub name: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

impl PodMetric {
    pub fn key(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }
}

/// One point of a historical series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub cpu_percent: f64,
    pub memory_usage: f64,
    pub memory_percent: f64,
}

impl MetricSnapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_usage: 0.0,
            cpu_percent: 0.0,
            memory_usage: 0.0,
            memory_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesOrigin {
    Measured,
    /// Synthesized from a single instantaneous reading; not ground truth.
    Approximated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalSeries {
    pub origin: SeriesOrigin,
    pub samples: Vec<MetricSnapshot>,
}

impl HistoricalSeries {
    pub fn is_approximated(&self) -> bool {
        self.origin == SeriesOrigin::Approximated
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct HistoricalData {
    pub nodes: BTreeMap<String, HistoricalSeries>,
    pub namespaces: BTreeMap<String, HistoricalSeries>,
}

impl HistoricalData {
    pub fn any_approximated(&self) -> bool {
        self.nodes
            .values()
            .chain(self.namespaces.values())
            .any(HistoricalSeries::is_approximated)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Rankings {
    pub cpu_namespaces: Vec<String>,
    pub memory_namespaces: Vec<String>,
    pub cpu_pods: Vec<String>,
    pub memory_pods: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionPhase {
    Idle,
    CollectingNodes,
    CollectingDerived,
    ConditionalFallback,
    ComputingRatios,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CollectionDiagnostics {
    pub phases: Vec<CollectionPhase>,
    pub failed_sources: Vec<SourceFailure>,
    pub fallback_attempted: bool,
    pub incomplete: bool,
}

/// Aggregate root for one collection run.
///
/// Commitment percentages are deliberately left unclamped: an overcommitted
/// cluster reports values above 100.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub cpu_utilization_percent: f64,
    pub memory_utilization_percent: f64,
    pub cpu_requests_commitment: f64,
    pub cpu_limits_commitment: f64,
    pub memory_requests_commitment: f64,
    pub memory_limits_commitment: f64,
    pub nodes: BTreeMap<String, NodeMetric>,
    pub namespaces: BTreeMap<String, NamespaceMetric>,
    pub pods: BTreeMap<String, PodMetric>,
    pub history: HistoricalData,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub raw_queries: BTreeMap<String, String>,
    pub rankings: Rankings,
    pub diagnostics: CollectionDiagnostics,
}

impl PerformanceMetrics {
    pub fn namespace_mut(&mut self, name: &str) -> &mut NamespaceMetric {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| NamespaceMetric::new(name))
    }

    pub fn pod_mut(&mut self, namespace: &str, name: &str) -> &mut PodMetric {
        self.pods
            .entry(PodMetric::key(namespace, name))
            .or_insert_with(|| PodMetric {
                namespace: namespace.to_string(),
                name: name.to_string(),
                ..Default::default()
            })
    }

    pub fn has_overall_utilization(&self) -> bool {
        self.cpu_utilization_percent != 0.0 || self.memory_utilization_percent != 0.0
    }

    pub fn has_namespace_usage(&self) -> bool {
        self.namespaces.values().any(NamespaceMetric::has_usage)
    }

    pub fn has_node_usage(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.cpu_usage > 0.0 || n.memory_usage > 0.0)
    }

    pub fn total_cpu_allocatable(&self) -> f64 {
        self.nodes.values().map(|n| n.cpu_allocatable).sum()
    }

    pub fn total_memory_allocatable(&self) -> f64 {
        self.nodes.values().map(|n| n.memory_allocatable).sum()
    }

    pub(crate) fn enter_phase(&mut self, phase: CollectionPhase) {
        self.diagnostics.phases.push(phase);
    }

    pub(crate) fn record_failure(&mut self, source: &str, reason: impl Into<String>) {
        self.diagnostics.failed_sources.push(SourceFailure {
            source: source.to_string(),
            reason: reason.into(),
        });
    }
}

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::base::{get_raw, set_if_unset, MetricsSource, SharedMetrics};
use crate::error::SourceError;
use crate::parsing::{normalize_or_zero, percent_of};
use crate::types::PerformanceMetrics;

pub const NODE_METRICS_PATH: &str = "/apis/metrics.k8s.io/v1beta1/nodes";
pub const POD_METRICS_PATH: &str = "/apis/metrics.k8s.io/v1beta1/pods";

#[derive(Debug, Deserialize)]
pub struct ItemMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContainerMetrics {
    pub name: String,
    #[serde(default)]
    pub usage: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct PodMetricsItem {
    pub metadata: ItemMeta,
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct NodeMetricsItem {
    pub metadata: ItemMeta,
    #[serde(default)]
    pub usage: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct UsageTotals {
    pub cpu: f64,
    pub memory: f64,
}

/// Client for the metrics aggregation API (metrics-server).
pub struct AggregatedMetricsClient {
    client: Client,
}

impl AggregatedMetricsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsSource for AggregatedMetricsClient {
    fn name(&self) -> &str {
        "metrics-api"
    }

    async fn collect(&self, shared: &SharedMetrics) -> Result<(), SourceError> {
        let mut last_error = None;

        match get_raw::<MetricsList<NodeMetricsItem>>(&self.client, NODE_METRICS_PATH).await {
            Ok(list) => {
                let mut metrics = shared.lock().await;
                let applied = apply_node_usage(&mut metrics, &list.items);
                debug!(nodes = applied, "node usage merged from metrics api");
            }
            Err(e) => {
                warn!(error = %e, "node metrics unavailable");
                last_error = Some(e);
            }
        }

        match get_raw::<MetricsList<PodMetricsItem>>(&self.client, POD_METRICS_PATH).await {
            Ok(list) => {
                let mut metrics = shared.lock().await;
                apply_pod_usage(&mut metrics, &list.items);
                debug!(pods = list.items.len(), "pod usage merged from metrics api");
            }
            Err(e) => {
                warn!(error = %e, "pod metrics unavailable");
                // node usage alone is still a partial success
                if last_error.is_some() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Fill node usage for inventoried nodes and derive overall utilization from it.
pub fn apply_node_usage(metrics: &mut PerformanceMetrics, items: &[NodeMetricsItem]) -> usize {
    let mut applied = 0;
    for item in items {
        if let Some(node) = metrics.nodes.get_mut(&item.metadata.name) {
            let cpu = item.usage.get("cpu").map(|q| normalize_or_zero(q, "cpu")).unwrap_or(0.0);
            let mem = item.usage.get("memory").map(|q| normalize_or_zero(q, "memory")).unwrap_or(0.0);
            set_if_unset(&mut node.cpu_usage, cpu);
            set_if_unset(&mut node.memory_usage, mem);
            applied += 1;
        }
    }

    let (cpu_used, cpu_cap, mem_used, mem_cap) = metrics.nodes.values().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(cu, cc, mu, mc), n| {
            let (cu, cc) = if n.cpu_usage > 0.0 && n.cpu_capacity > 0.0 {
                (cu + n.cpu_usage, cc + n.cpu_capacity)
            } else {
                (cu, cc)
            };
            let (mu, mc) = if n.memory_usage > 0.0 && n.memory_capacity > 0.0 {
                (mu + n.memory_usage, mc + n.memory_capacity)
            } else {
                (mu, mc)
            };
            (cu, cc, mu, mc)
        },
    );
    set_if_unset(&mut metrics.cpu_utilization_percent, percent_of(cpu_used, cpu_cap));
    set_if_unset(&mut metrics.memory_utilization_percent, percent_of(mem_used, mem_cap));
    applied
}

/// Sum container usage per pod, keyed `(namespace, pod)`.
pub fn build_pod_usage(items: &[PodMetricsItem]) -> BTreeMap<(String, String), UsageTotals> {
    let mut map = BTreeMap::new();
    for item in items {
        let namespace = match item.metadata.namespace.as_ref() {
            Some(ns) if !ns.is_empty() => ns.clone(),
            _ => continue,
        };
        let mut totals = UsageTotals::default();
        for c in &item.containers {
            if let Some(cpu_q) = c.usage.get("cpu") {
                totals.cpu += normalize_or_zero(cpu_q, "cpu");
            }
            if let Some(mem_q) = c.usage.get("memory") {
                totals.memory += normalize_or_zero(mem_q, "memory");
            }
        }
        map.insert((namespace, item.metadata.name.clone()), totals);
    }
    map
}

pub fn apply_pod_usage(metrics: &mut PerformanceMetrics, items: &[PodMetricsItem]) {
    let by_pod = build_pod_usage(items);
    let mut by_namespace: HashMap<&str, UsageTotals> = HashMap::new();

    for ((namespace, pod), usage) in &by_pod {
        let ns_totals = by_namespace.entry(namespace.as_str()).or_default();
        ns_totals.cpu += usage.cpu;
        ns_totals.memory += usage.memory;

        let entry = metrics.pod_mut(namespace, pod);
        set_if_unset(&mut entry.cpu_usage, usage.cpu);
        set_if_unset(&mut entry.memory_usage, usage.memory);
    }
    for (namespace, usage) in by_namespace {
        let ns = metrics.namespace_mut(namespace);
        set_if_unset(&mut ns.cpu_usage, usage.cpu);
        set_if_unset(&mut ns.memory_usage, usage.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeMetric;

    const POD_METRICS: &str = r#"{
        "kind": "PodMetricsList",
        "apiVersion": "metrics.k8s.io/v1beta1",
        "items": [
            {"metadata": {"name": "web-1", "namespace": "shop"},
             "containers": [
                {"name": "app", "usage": {"cpu": "250m", "memory": "128Mi"}},
                {"name": "sidecar", "usage": {"cpu": "250000000n", "memory": "64Mi"}}]},
            {"metadata": {"name": "web-2", "namespace": "shop"},
             "containers": [{"name": "app", "usage": {"cpu": "500m", "memory": "256Mi"}}]},
            {"metadata": {"name": "job-1", "namespace": "batch"},
             "containers": [{"name": "app", "usage": {"cpu": "bogus", "memory": "1Gi"}}]}
        ]
    }"#;

    #[test]
    fn test_pod_usage_sums_per_namespace() {
        let list: MetricsList<PodMetricsItem> = serde_json::from_str(POD_METRICS).unwrap();
        let mut metrics = PerformanceMetrics::default();
        apply_pod_usage(&mut metrics, &list.items);

        let shop = &metrics.namespaces["shop"];
        assert!((shop.cpu_usage - 1.0).abs() < 1e-9);
        assert_eq!(shop.memory_usage, 448.0 * 1024.0 * 1024.0);

        let batch = &metrics.namespaces["batch"];
        assert_eq!(batch.cpu_usage, 0.0);
        assert_eq!(batch.memory_usage, 1024.0 * 1024.0 * 1024.0);

        assert_eq!(metrics.pods.len(), 3);
        assert!((metrics.pods["shop/web-1"].cpu_usage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_node_usage_and_overall_utilization() {
        let mut metrics = PerformanceMetrics::default();
        for name in ["a", "b"] {
            let mut n = NodeMetric::new(name);
            n.cpu_capacity = 4.0;
            n.memory_capacity = 8.0 * 1024.0 * 1024.0 * 1024.0;
            metrics.nodes.insert(name.to_string(), n);
        }
        let list: MetricsList<NodeMetricsItem> = serde_json::from_str(
            r#"{"items": [
                {"metadata": {"name": "a"}, "usage": {"cpu": "2", "memory": "4Gi"}},
                {"metadata": {"name": "b"}, "usage": {"cpu": "2000m", "memory": "4Gi"}},
                {"metadata": {"name": "unknown"}, "usage": {"cpu": "1", "memory": "1Gi"}}]}"#,
        )
        .unwrap();

        assert_eq!(apply_node_usage(&mut metrics, &list.items), 2);
        assert_eq!(metrics.nodes["a"].cpu_usage, 2.0);
        assert_eq!(metrics.cpu_utilization_percent, 50.0);
        assert_eq!(metrics.memory_utilization_percent, 50.0);
        assert!(!metrics.nodes.contains_key("unknown"));
    }

    #[test]
    fn test_overall_utilization_not_overwritten() {
        let mut metrics = PerformanceMetrics::default();
        metrics.cpu_utilization_percent = 12.0;
        let mut n = NodeMetric::new("a");
        n.cpu_capacity = 4.0;
        n.cpu_usage = 4.0;
        metrics.nodes.insert("a".to_string(), n);
        apply_node_usage(&mut metrics, &[]);
        assert_eq!(metrics.cpu_utilization_percent, 12.0);
    }
}

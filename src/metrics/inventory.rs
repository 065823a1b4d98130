use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{api::ListParams, Api, Client};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::base::{set_if_unset, MetricsSource, SharedMetrics};
use crate::error::SourceError;
use crate::parsing::normalize_or_zero;
use crate::types::{NodeMetric, PerformanceMetrics};

/// Requests and limits summed over the containers of one namespace.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NamespaceResources {
    pub cpu_requests: f64,
    pub cpu_limits: f64,
    pub memory_requests: f64,
    pub memory_limits: f64,
}

/// Authoritative node listing. A failure here aborts the whole collection.
pub struct NodeInventoryClient {
    client: Client,
}

impl NodeInventoryClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsSource for NodeInventoryClient {
    fn name(&self) -> &str {
        "node-inventory"
    }

    async fn collect(&self, shared: &SharedMetrics) -> Result<(), SourceError> {
        let node_api: Api<Node> = Api::all(self.client.clone());
        let nodes = node_api.list(&ListParams::default()).await?;
        let applied = apply_nodes(&mut *shared.lock().await, &nodes.items);
        debug!(nodes = applied, "node inventory listed");

        // Requests/limits only feed the commitment ratios; losing them is not fatal
        let pod_api: Api<Pod> = Api::all(self.client.clone());
        match pod_api.list(&ListParams::default()).await {
            Ok(pods) => {
                let totals = sum_namespace_resources(&pods.items);
                apply_namespace_resources(&mut *shared.lock().await, &totals);
            }
            Err(e) => warn!(error = %e, "pod listing failed, commitment ratios will be empty"),
        }
        Ok(())
    }
}

/// Merge capacity and allocatable of each named node. Returns the number of nodes seen.
pub fn apply_nodes(metrics: &mut PerformanceMetrics, nodes: &[Node]) -> usize {
    let mut applied = 0;
    for node in nodes {
        let node_name = match node.metadata.name.as_ref() {
            Some(n) => n.clone(),
            None => continue,
        };
        let status = node.status.as_ref();
        let capacity = status.and_then(|s| s.capacity.as_ref());
        let allocatable = status.and_then(|s| s.allocatable.as_ref());

        let entry = metrics
            .nodes
            .entry(node_name.clone())
            .or_insert_with(|| NodeMetric::new(node_name));
        set_if_unset(&mut entry.cpu_capacity, quantity(capacity, "cpu"));
        set_if_unset(&mut entry.memory_capacity, quantity(capacity, "memory"));
        set_if_unset(&mut entry.cpu_allocatable, quantity(allocatable, "cpu"));
        set_if_unset(&mut entry.memory_allocatable, quantity(allocatable, "memory"));
        applied += 1;
    }
    applied
}

/// Sum container requests and limits per namespace, ignoring finished pods.
pub fn sum_namespace_resources(pods: &[Pod]) -> HashMap<String, NamespaceResources> {
    let mut totals: HashMap<String, NamespaceResources> = HashMap::new();
    for pod in pods {
        let namespace = match pod.metadata.namespace.as_ref() {
            Some(ns) => ns,
            None => continue,
        };
        if is_finished(pod) {
            continue;
        }
        let spec = match pod.spec.as_ref() {
            Some(s) => s,
            None => continue,
        };
        let ns_totals = totals.entry(namespace.clone()).or_default();
        for c in &spec.containers {
            if let Some(resources) = c.resources.as_ref() {
                let requests = resources.requests.as_ref();
                let limits = resources.limits.as_ref();
                ns_totals.cpu_requests += quantity(requests, "cpu");
                ns_totals.memory_requests += quantity(requests, "memory");
                ns_totals.cpu_limits += quantity(limits, "cpu");
                ns_totals.memory_limits += quantity(limits, "memory");
            }
        }
    }
    totals
}

pub fn apply_namespace_resources(
    metrics: &mut PerformanceMetrics,
    totals: &HashMap<String, NamespaceResources>,
) {
    for (name, res) in totals {
        let ns = metrics.namespace_mut(name);
        set_if_unset(&mut ns.cpu_requests, res.cpu_requests);
        set_if_unset(&mut ns.cpu_limits, res.cpu_limits);
        set_if_unset(&mut ns.memory_requests, res.memory_requests);
        set_if_unset(&mut ns.memory_limits, res.memory_limits);
    }
}

fn quantity(map: Option<&BTreeMap<String, Quantity>>, key: &str) -> f64 {
    map.and_then(|m| m.get(key))
        .map(|q| normalize_or_zero(&q.0, key))
        .unwrap_or(0.0)
}

fn is_finished(pod: &Pod) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("");
    matches!(phase, "Succeeded" | "Failed")
}

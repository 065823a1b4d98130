use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::base::{set_if_unset, set_option_if_unset, MetricsSource, SharedMetrics};
use crate::error::SourceError;
use crate::types::{Config, PerformanceMetrics};

/// Where the value of a query lands in the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTarget {
    ClusterCpuRatio,
    ClusterMemoryRatio,
    NamespaceCpu,
    NamespaceMemory,
    NodeCpu,
    NodeMemory,
    NamespaceReceive,
    NamespaceTransmit,
}

#[derive(Debug, Clone, Copy)]
pub struct NamedQuery {
    pub name: &'static str,
    pub promql: &'static str,
    pub target: QueryTarget,
}

pub const DEFAULT_QUERIES: &[NamedQuery] = &[
    NamedQuery {
        name: "cluster_cpu_ratio",
        promql: r#"1 - avg(rate(node_cpu_seconds_total{mode="idle"}[5m]))"#,
        target: QueryTarget::ClusterCpuRatio,
    },
    NamedQuery {
        name: "cluster_memory_ratio",
        promql: "1 - sum(node_memory_MemAvailable_bytes) / sum(node_memory_MemTotal_bytes)",
        target: QueryTarget::ClusterMemoryRatio,
    },
    NamedQuery {
        name: "namespace_cpu",
        promql: r#"sum by (namespace) (rate(container_cpu_usage_seconds_total{container!="",pod!=""}[5m]))"#,
        target: QueryTarget::NamespaceCpu,
    },
    NamedQuery {
        name: "namespace_memory",
        promql: r#"sum by (namespace) (container_memory_working_set_bytes{container!="",pod!=""})"#,
        target: QueryTarget::NamespaceMemory,
    },
    NamedQuery {
        name: "node_cpu",
        promql: r#"sum by (node) (rate(container_cpu_usage_seconds_total{id="/"}[5m]))"#,
        target: QueryTarget::NodeCpu,
    },
    NamedQuery {
        name: "node_memory",
        promql: r#"sum by (node) (container_memory_working_set_bytes{id="/"})"#,
        target: QueryTarget::NodeMemory,
    },
    NamedQuery {
        name: "namespace_network_receive",
        promql: "sum by (namespace) (rate(container_network_receive_bytes_total[5m]))",
        target: QueryTarget::NamespaceReceive,
    },
    NamedQuery {
        name: "namespace_network_transmit",
        promql: "sum by (namespace) (rate(container_network_transmit_bytes_total[5m]))",
        target: QueryTarget::NamespaceTransmit,
    },
];

/// The default query feeding `target`.
pub fn query_for(target: QueryTarget) -> Option<&'static NamedQuery> {
    DEFAULT_QUERIES.iter().find(|q| q.target == target)
}

// Prometheus HTTP API envelope

#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
pub struct QueryData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<QuerySeries>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuerySeries {
    #[serde(default)]
    pub metric: HashMap<String, String>,
    /// Instant queries
    #[serde(default)]
    pub value: Option<(f64, String)>,
    /// Range queries
    #[serde(default)]
    pub values: Option<Vec<(f64, String)>>,
}

impl QuerySeries {
    /// First label present among `keys`.
    pub fn label(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.metric.get(*k))
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn instant_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(|(_, v)| parse_sample(v))
    }

    /// `(unix seconds, value)` pairs, non-finite samples dropped.
    pub fn range_values(&self) -> Vec<(i64, f64)> {
        self.values
            .iter()
            .flatten()
            .filter_map(|(ts, v)| parse_sample(v).map(|v| (ts.floor() as i64, v)))
            .collect()
    }
}

fn parse_sample(v: &str) -> Option<f64> {
    v.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub const NAMESPACE_LABELS: &[&str] = &["namespace"];
pub const NODE_LABELS: &[&str] = &["node", "instance"];

/// Client for a Prometheus-compatible query endpoint.
pub struct TelemetryClient {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
    query_timeout: Duration,
    debug_payloads: bool,
    queries: Vec<NamedQuery>,
}

impl TelemetryClient {
    pub fn new(url: &str, token: Option<String>, query_timeout: Duration) -> Result<Self, SourceError> {
        Self::build(url, token, query_timeout, false)
    }

    /// `None` when no telemetry endpoint is configured.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>, SourceError> {
        let url = match cfg.telemetry_url.as_deref() {
            Some(u) => u,
            None => return Ok(None),
        };
        let client = Self::build(url, cfg.telemetry_token.clone(), cfg.query_timeout, cfg.telemetry_insecure)?
            .with_debug_payloads(cfg.debug_payloads);
        Ok(Some(client))
    }

    fn build(url: &str, token: Option<String>, query_timeout: Duration, insecure: bool) -> Result<Self, SourceError> {
        let base_url = url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(SourceError::Unavailable(format!(
                "telemetry URL must start with http:// or https://, got {}",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            base_url,
            http,
            token,
            query_timeout,
            debug_payloads: false,
            queries: DEFAULT_QUERIES.to_vec(),
        })
    }

    pub fn with_debug_payloads(mut self, enabled: bool) -> Self {
        self.debug_payloads = enabled;
        self
    }

    pub fn with_queries(mut self, queries: Vec<NamedQuery>) -> Self {
        self.queries = queries;
        self
    }

    /// Instant query. Returns the parsed series and the raw body.
    pub async fn query(&self, promql: &str) -> Result<(Vec<QuerySeries>, String), SourceError> {
        let params = [("query", promql.to_string())];
        let (data, body) = self.fetch("/api/v1/query", &params).await?;
        Ok((data.result, body))
    }

    pub async fn query_range(
        &self,
        promql: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<QuerySeries>, SourceError> {
        let params = [
            ("query", promql.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", step.as_secs().max(1).to_string()),
        ];
        let (data, _) = self.fetch("/api/v1/query_range", &params).await?;
        Ok(data.result)
    }

    async fn fetch(&self, path: &str, params: &[(&str, String)]) -> Result<(QueryData, String), SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.get(&url).query(params).timeout(self.query_timeout);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<QueryResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);
            return Err(SourceError::Query(format!("HTTP {}: {}", status, detail)));
        }

        let parsed: QueryResponse = serde_json::from_str(&body)
            .map_err(|e| SourceError::Query(format!("decode response: {}", e)))?;
        if parsed.status != "success" {
            return Err(SourceError::Query(
                parsed.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let data = parsed
            .data
            .ok_or_else(|| SourceError::Query("response carried no data".to_string()))?;
        Ok((data, body))
    }

    fn classify(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout {
                name: "telemetry query".to_string(),
                after: self.query_timeout,
            }
        } else {
            SourceError::Http(e)
        }
    }
}

#[async_trait]
impl MetricsSource for TelemetryClient {
    fn name(&self) -> &str {
        "telemetry"
    }

    async fn collect(&self, shared: &SharedMetrics) -> Result<(), SourceError> {
        let mut succeeded = 0usize;
        let mut last_error = None;

        for q in &self.queries {
            match self.query(q.promql).await {
                Ok((series, body)) => {
                    let mut metrics = shared.lock().await;
                    let merged = merge_series(&mut metrics, q.target, &series);
                    if self.debug_payloads {
                        metrics.raw_queries.insert(q.name.to_string(), body);
                    }
                    succeeded += 1;
                    debug!(query = q.name, series = series.len(), merged, "telemetry query complete");
                }
                Err(e) => {
                    warn!(query = q.name, error = %e, "telemetry query failed");
                    last_error = Some(e);
                }
            }
        }

        if succeeded == 0 {
            return Err(last_error
                .unwrap_or_else(|| SourceError::Unavailable("no telemetry queries configured".to_string())));
        }
        Ok(())
    }
}

/// Merge instant-query series into the aggregate. Returns how many fields were written.
pub fn merge_series(metrics: &mut PerformanceMetrics, target: QueryTarget, series: &[QuerySeries]) -> usize {
    let mut merged = 0;
    match target {
        QueryTarget::ClusterCpuRatio | QueryTarget::ClusterMemoryRatio => {
            if let Some(ratio) = series.iter().find_map(QuerySeries::instant_value) {
                let slot = if target == QueryTarget::ClusterCpuRatio {
                    &mut metrics.cpu_utilization_percent
                } else {
                    &mut metrics.memory_utilization_percent
                };
                merged += set_if_unset(slot, ratio * 100.0) as usize;
            }
        }
        QueryTarget::NamespaceCpu
        | QueryTarget::NamespaceMemory
        | QueryTarget::NamespaceReceive
        | QueryTarget::NamespaceTransmit => {
            for s in series {
                let (name, value) = match (s.label(NAMESPACE_LABELS), s.instant_value()) {
                    (Some(n), Some(v)) => (n, v),
                    _ => continue,
                };
                let ns = metrics.namespace_mut(name);
                let written = match target {
                    QueryTarget::NamespaceCpu => set_if_unset(&mut ns.cpu_usage, value),
                    QueryTarget::NamespaceMemory => set_if_unset(&mut ns.memory_usage, value),
                    QueryTarget::NamespaceReceive => {
                        set_option_if_unset(&mut ns.network_receive_bytes_per_sec, value)
                    }
                    _ => set_option_if_unset(&mut ns.network_transmit_bytes_per_sec, value),
                };
                merged += written as usize;
            }
        }
        QueryTarget::NodeCpu | QueryTarget::NodeMemory => {
            for s in series {
                let (name, value) = match (s.label(NODE_LABELS), s.instant_value()) {
                    (Some(n), Some(v)) => (n, v),
                    _ => continue,
                };
                // only nodes known to the inventory
                if let Some(node) = metrics.nodes.get_mut(name) {
                    let slot = if target == QueryTarget::NodeCpu {
                        &mut node.cpu_usage
                    } else {
                        &mut node.memory_usage
                    };
                    merged += set_if_unset(slot, value) as usize;
                }
            }
        }
    }
    merged
}

use serde::Serialize;
use std::fmt::Write as _;

use crate::types::{PerformanceMetrics, Thresholds};

pub const CHECK_ID: &str = "cluster-performance";

/// Number of ranked namespaces quoted in the detail text.
const DETAIL_TOP_NAMESPACES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Unknown,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Importance {
    Low,
    Normal,
    High,
}

/// Result shape handed to report renderers.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub id: String,
    pub status: Status,
    pub message: String,
    pub importance: Importance,
    pub detail: String,
    pub recommendations: Vec<String>,
}

struct Rule {
    status: Status,
    importance: Importance,
    matches: fn(&PerformanceMetrics, &Thresholds) -> bool,
    message: fn(&PerformanceMetrics, &Thresholds) -> String,
    recommendations: &'static [&'static str],
}

// Evaluated in order; the first match decides the status.
const RULES: &[Rule] = &[
    Rule {
        status: Status::Unknown,
        importance: Importance::Normal,
        matches: |m, _| !m.has_node_usage() && !m.has_namespace_usage() && !m.has_overall_utilization(),
        message: |_, _| "No utilization data could be collected from any source".to_string(),
        recommendations: &[
            "Install metrics-server or configure TELEMETRY_URL to point at a Prometheus endpoint",
            "Verify that the service account may read nodes, pods and metrics.k8s.io resources",
        ],
    },
    Rule {
        status: Status::Critical,
        importance: Importance::High,
        matches: |m, t| {
            m.cpu_utilization_percent >= t.cpu_critical_percent
                || m.memory_utilization_percent >= t.memory_critical_percent
        },
        message: |m, _| {
            format!(
                "Cluster utilization is critical (CPU {:.1}%, memory {:.1}%)",
                m.cpu_utilization_percent, m.memory_utilization_percent
            )
        },
        recommendations: &[
            "Add nodes or enable the cluster autoscaler before workloads are evicted",
            "Review the top consuming namespaces for runaway workloads",
        ],
    },
    Rule {
        status: Status::Warning,
        importance: Importance::Normal,
        matches: |m, t| {
            m.cpu_utilization_percent >= t.cpu_warning_percent
                || m.memory_utilization_percent >= t.memory_warning_percent
        },
        message: |m, _| {
            format!(
                "Cluster utilization is high (CPU {:.1}%, memory {:.1}%)",
                m.cpu_utilization_percent, m.memory_utilization_percent
            )
        },
        recommendations: &[
            "Plan additional capacity for the next growth period",
            "Right-size requests of the top consuming namespaces",
        ],
    },
    Rule {
        status: Status::Warning,
        importance: Importance::Normal,
        matches: |m, t| {
            m.cpu_limits_commitment >= t.commitment_warning_percent
                || m.memory_limits_commitment >= t.commitment_warning_percent
        },
        message: |m, _| {
            format!(
                "Resource limits are overcommitted (CPU {:.1}%, memory {:.1}% of allocatable)",
                m.cpu_limits_commitment, m.memory_limits_commitment
            )
        },
        recommendations: &[
            "Lower container limits or add capacity so bursts cannot exhaust nodes",
            "Apply LimitRange or ResourceQuota objects to namespaces without bounds",
        ],
    },
    Rule {
        status: Status::Ok,
        importance: Importance::Low,
        matches: |_, _| true,
        message: |m, _| {
            format!(
                "Cluster utilization is within limits (CPU {:.1}%, memory {:.1}%)",
                m.cpu_utilization_percent, m.memory_utilization_percent
            )
        },
        recommendations: &[],
    },
];

/// Map the aggregate onto a single check result.
pub fn evaluate(metrics: &PerformanceMetrics, thresholds: &Thresholds) -> CheckResult {
    let detail = build_detail(metrics);
    let rule = RULES.iter().find(|r| (r.matches)(metrics, thresholds));

    match rule {
        Some(rule) => CheckResult {
            id: CHECK_ID.to_string(),
            status: rule.status,
            message: (rule.message)(metrics, thresholds),
            importance: rule.importance,
            detail,
            recommendations: rule.recommendations.iter().map(|s| s.to_string()).collect(),
        },
        None => CheckResult {
            id: CHECK_ID.to_string(),
            status: Status::NotApplicable,
            message: "No rule applied".to_string(),
            importance: Importance::Low,
            detail,
            recommendations: Vec::new(),
        },
    }
}

fn build_detail(m: &PerformanceMetrics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Nodes: {}, namespaces: {}, pods: {}", m.nodes.len(), m.namespaces.len(), m.pods.len());
    let _ = writeln!(
        out,
        "Utilization: CPU {:.1}%, memory {:.1}%",
        m.cpu_utilization_percent, m.memory_utilization_percent
    );
    let _ = writeln!(
        out,
        "Requests commitment: CPU {:.1}%, memory {:.1}%",
        m.cpu_requests_commitment, m.memory_requests_commitment
    );
    let _ = writeln!(
        out,
        "Limits commitment: CPU {:.1}%, memory {:.1}%",
        m.cpu_limits_commitment, m.memory_limits_commitment
    );

    if !m.rankings.cpu_namespaces.is_empty() {
        let top: Vec<&str> = m
            .rankings
            .cpu_namespaces
            .iter()
            .take(DETAIL_TOP_NAMESPACES)
            .map(String::as_str)
            .collect();
        let _ = writeln!(out, "Top namespaces by CPU: {}", top.join(", "));
    }
    if !m.rankings.memory_namespaces.is_empty() {
        let top: Vec<&str> = m
            .rankings
            .memory_namespaces
            .iter()
            .take(DETAIL_TOP_NAMESPACES)
            .map(String::as_str)
            .collect();
        let _ = writeln!(out, "Top namespaces by memory: {}", top.join(", "));
    }

    for failure in &m.diagnostics.failed_sources {
        let _ = writeln!(out, "Source {} unavailable: {}", failure.source, failure.reason);
    }
    if m.history.any_approximated() {
        let _ = writeln!(
            out,
            "Note: some historical series are approximated from current usage and are not measured data"
        );
    }
    if m.diagnostics.incomplete {
        let _ = writeln!(out, "Note: metrics are incomplete, no source reported utilization");
    }
    out
}

//! Fixed-length utilization windows per node and namespace.
//!
//! Measured windows come from range queries against the telemetry backend.
//! When the backend has nothing for an entity, a window is synthesized from
//! its single current reading and marked [`SeriesOrigin::Approximated`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::metrics::telemetry::{query_for, QuerySeries, QueryTarget, NAMESPACE_LABELS, NODE_LABELS};
use crate::metrics::TelemetryClient;
use crate::parsing::percent_of;
use crate::types::{
    Config, HistoricalSeries, MetricSnapshot, NamespaceMetric, NodeMetric, PerformanceMetrics, SeriesOrigin,
};

/// Period of the approximation multiplier, in samples.
pub const OSCILLATION_PERIOD: usize = 6;

/// Current usage and capacity of one entity.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EntityState {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub cpu_capacity: f64,
    pub memory_capacity: f64,
}

impl EntityState {
    pub fn node(node: &NodeMetric) -> Self {
        Self {
            cpu_usage: node.cpu_usage,
            memory_usage: node.memory_usage,
            cpu_capacity: node.cpu_capacity,
            memory_capacity: node.memory_capacity,
        }
    }

    /// Namespaces are measured against the whole cluster's allocatable resources.
    pub fn namespace(ns: &NamespaceMetric, cluster_cpu: f64, cluster_memory: f64) -> Self {
        Self {
            cpu_usage: ns.cpu_usage,
            memory_usage: ns.memory_usage,
            cpu_capacity: cluster_cpu,
            memory_capacity: cluster_memory,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MeasuredPoint {
    pub cpu: f64,
    pub memory: f64,
}

/// Measured points per entity, keyed by unix seconds.
pub type MeasuredSeries = BTreeMap<i64, MeasuredPoint>;

#[derive(Debug, Default)]
pub struct MeasuredHistory {
    pub nodes: HashMap<String, MeasuredSeries>,
    pub namespaces: HashMap<String, MeasuredSeries>,
}

impl MeasuredHistory {
    /// Fold range-query series into per-entity points. A later value for the
    /// same timestamp replaces the earlier one.
    pub fn merge(
        target: &mut HashMap<String, MeasuredSeries>,
        series: &[QuerySeries],
        labels: &[&str],
        metric: Metric,
    ) {
        for s in series {
            let name = match s.label(labels) {
                Some(n) => n,
                None => continue,
            };
            let points = target.entry(name.to_string()).or_default();
            for (ts, value) in s.range_values() {
                let point = points.entry(ts).or_default();
                match metric {
                    Metric::Cpu => point.cpu = value,
                    Metric::Memory => point.memory = value,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cpu,
    Memory,
}

/// Deterministic multiplier in [0.8, 1.2] repeating every [`OSCILLATION_PERIOD`] samples.
pub fn oscillation(index: usize) -> f64 {
    let phase = (index % OSCILLATION_PERIOD) as f64 / OSCILLATION_PERIOD as f64;
    1.0 + 0.2 * (2.0 * PI * phase).sin()
}

/// Lazily yields an approximated window, oldest sample first.
#[derive(Debug, Clone)]
pub struct ApproximatedWindow {
    state: EntityState,
    start: i64,
    step: i64,
    index: usize,
    len: usize,
}

impl Iterator for ApproximatedWindow {
    type Item = MetricSnapshot;

    fn next(&mut self) -> Option<MetricSnapshot> {
        if self.index >= self.len {
            return None;
        }
        let i = self.index;
        self.index += 1;

        let factor = oscillation(i);
        let cpu = self.state.cpu_usage * factor;
        let memory = self.state.memory_usage * factor;
        let ts = self.start + self.step * i as i64;
        Some(MetricSnapshot {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
            cpu_usage: cpu,
            cpu_percent: percent_of(cpu, self.state.cpu_capacity),
            memory_usage: memory,
            memory_percent: percent_of(memory, self.state.memory_capacity),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.len - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ApproximatedWindow {}

/// Window of `samples` points ending at `end` (aligned down to `step`).
pub fn approximate_window(state: EntityState, end: DateTime<Utc>, step: Duration, samples: usize) -> ApproximatedWindow {
    let step = step_secs(step);
    let end = align_down(end.timestamp(), step);
    let span = step * samples.saturating_sub(1) as i64;
    ApproximatedWindow {
        state,
        start: end - span,
        step,
        index: 0,
        len: samples,
    }
}

fn step_secs(step: Duration) -> i64 {
    step.as_secs().max(1) as i64
}

fn align_down(ts: i64, step: i64) -> i64 {
    ts - ts.rem_euclid(step)
}

pub struct HistoryBuilder {
    telemetry: Option<Arc<TelemetryClient>>,
    samples: usize,
    step: Duration,
}

impl HistoryBuilder {
    pub fn new(telemetry: Option<Arc<TelemetryClient>>, samples: usize, step: Duration) -> Self {
        Self {
            telemetry,
            samples: samples.max(1),
            step,
        }
    }

    pub fn from_config(cfg: &Config, telemetry: Option<Arc<TelemetryClient>>) -> Self {
        Self::new(telemetry, cfg.history_samples, cfg.history_step)
    }

    /// `(start, end)` unix seconds of the window ending at `now`.
    fn bounds(&self, now: DateTime<Utc>) -> (i64, i64) {
        let step = step_secs(self.step);
        let end = align_down(now.timestamp(), step);
        (end - step * self.samples.saturating_sub(1) as i64, end)
    }

    /// Lay measured points onto the W-slot grid. A slot takes the latest point in
    /// `(slot - step, slot]`; empty slots repeat the previous slot, and slots before
    /// the first point hold zero usage. `None` when no point falls inside the window.
    fn measured_window(&self, state: &EntityState, now: DateTime<Utc>, points: &MeasuredSeries) -> Option<Vec<MetricSnapshot>> {
        let step = step_secs(self.step);
        let (start, _) = self.bounds(now);
        let mut last = MeasuredPoint::default();
        let mut hits = 0usize;
        let mut samples = Vec::with_capacity(self.samples);

        for i in 0..self.samples {
            let ts = start + step * i as i64;
            if let Some((_, p)) = points.range(ts - step + 1..=ts).next_back() {
                last = *p;
                hits += 1;
            }
            samples.push(MetricSnapshot {
                timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
                cpu_usage: last.cpu,
                cpu_percent: percent_of(last.cpu, state.cpu_capacity),
                memory_usage: last.memory,
                memory_percent: percent_of(last.memory, state.memory_capacity),
            });
        }
        (hits > 0).then_some(samples)
    }

    /// Build the window for one entity, preferring measured points.
    pub fn build_window(
        &self,
        state: &EntityState,
        now: DateTime<Utc>,
        measured: Option<&MeasuredSeries>,
    ) -> HistoricalSeries {
        match measured.and_then(|points| self.measured_window(state, now, points)) {
            Some(samples) => HistoricalSeries {
                origin: SeriesOrigin::Measured,
                samples,
            },
            None => HistoricalSeries {
                origin: SeriesOrigin::Approximated,
                samples: approximate_window(*state, now, self.step, self.samples).collect(),
            },
        }
    }

    /// Run the range queries, each bounded by `deadline`. Failed queries leave gaps
    /// that the approximation fills later.
    pub async fn fetch_measured(&self, now: DateTime<Utc>, deadline: Instant) -> MeasuredHistory {
        let mut history = MeasuredHistory::default();
        let telemetry = match &self.telemetry {
            Some(t) => t,
            None => return history,
        };

        let (start_ts, end_ts) = self.bounds(now);
        let end = DateTime::from_timestamp(end_ts, 0).unwrap_or(now);
        let start = DateTime::from_timestamp(start_ts, 0).unwrap_or(now);

        let range = |target: QueryTarget| async move {
            let query = query_for(target)?;
            match timeout_at(deadline, telemetry.query_range(query.promql, start, end, self.step)).await {
                Ok(Ok(series)) => Some(series),
                Ok(Err(e)) => {
                    warn!(query = query.name, error = %e, "range query failed");
                    None
                }
                Err(_) => {
                    warn!(query = query.name, "range query hit the collection deadline");
                    None
                }
            }
        };

        let (node_cpu, node_mem, ns_cpu, ns_mem) = tokio::join!(
            range(QueryTarget::NodeCpu),
            range(QueryTarget::NodeMemory),
            range(QueryTarget::NamespaceCpu),
            range(QueryTarget::NamespaceMemory),
        );

        let merges = [
            (node_cpu, Metric::Cpu, true),
            (node_mem, Metric::Memory, true),
            (ns_cpu, Metric::Cpu, false),
            (ns_mem, Metric::Memory, false),
        ];
        for (series, metric, is_node) in merges {
            if let Some(series) = series {
                if is_node {
                    MeasuredHistory::merge(&mut history.nodes, &series, NODE_LABELS, metric);
                } else {
                    MeasuredHistory::merge(&mut history.namespaces, &series, NAMESPACE_LABELS, metric);
                }
            }
        }
        history
    }

    /// Attach a window to every node and namespace of the aggregate.
    pub async fn populate(&self, metrics: &mut PerformanceMetrics, now: DateTime<Utc>, deadline: Instant) {
        let measured = self.fetch_measured(now, deadline).await;

        for node in metrics.nodes.values() {
            let series = self.build_window(&EntityState::node(node), now, measured.nodes.get(&node.name));
            metrics.history.nodes.insert(node.name.clone(), series);
        }

        let cluster_cpu = metrics.total_cpu_allocatable();
        let cluster_memory = metrics.total_memory_allocatable();
        for ns in metrics.namespaces.values() {
            let state = EntityState::namespace(ns, cluster_cpu, cluster_memory);
            let series = self.build_window(&state, now, measured.namespaces.get(&ns.name));
            metrics.history.namespaces.insert(ns.name.clone(), series);
        }

        let approximated = metrics
            .history
            .nodes
            .values()
            .chain(metrics.history.namespaces.values())
            .filter(|s| s.is_approximated())
            .count();
        if approximated > 0 {
            warn!(approximated, "some historical windows are approximated from current usage");
        }
        info!(
            nodes = metrics.history.nodes.len(),
            namespaces = metrics.history.namespaces.len(),
            "historical windows built"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_001_234, 0).unwrap()
    }

    fn state() -> EntityState {
        EntityState {
            cpu_usage: 2.0,
            memory_usage: 1024.0,
            cpu_capacity: 8.0,
            memory_capacity: 4096.0,
        }
    }

    #[test]
    fn test_oscillation_stays_in_band_and_repeats() {
        for i in 0..48 {
            let m = oscillation(i);
            assert!((0.8..=1.2).contains(&m), "multiplier {} out of band", m);
            assert_eq!(m, oscillation(i + OSCILLATION_PERIOD));
        }
        assert_eq!(oscillation(0), 1.0);
    }

    #[test]
    fn test_approximate_window_shape() {
        let window = approximate_window(state(), now(), Duration::from_secs(3600), 24);
        assert_eq!(window.len(), 24);

        let samples: Vec<_> = window.collect();
        assert_eq!(samples.len(), 24);
        for pair in samples.windows(2) {
            assert_eq!((pair[1].timestamp - pair[0].timestamp).num_seconds(), 3600);
        }
        // last sample sits on the aligned hour
        assert_eq!(samples[23].timestamp.timestamp() % 3600, 0);
        assert!(samples[23].timestamp <= now());
        assert_eq!(samples[0].cpu_usage, 2.0);
        assert_eq!(samples[0].cpu_percent, 25.0);
    }

    #[test]
    fn test_approximate_window_is_repeatable() {
        let a: Vec<_> = approximate_window(state(), now(), Duration::from_secs(600), 12).collect();
        let b: Vec<_> = approximate_window(state(), now(), Duration::from_secs(600), 12).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_build_window_prefers_measured_points() {
        // slots at 1_699_992_000, 1_699_995_600, 1_699_999_200
        let builder = HistoryBuilder::new(None, 3, Duration::from_secs(3600));
        let mut points = MeasuredSeries::new();
        points.insert(1_699_988_400, MeasuredPoint { cpu: 9.0, memory: 2048.0 });
        points.insert(1_699_992_000, MeasuredPoint { cpu: 1.0, memory: 2048.0 });
        points.insert(1_699_999_200, MeasuredPoint { cpu: 3.0, memory: 2048.0 });

        let series = builder.build_window(&state(), now(), Some(&points));
        assert_eq!(series.origin, SeriesOrigin::Measured);
        assert_eq!(series.samples.len(), 3);
        let cpu: Vec<f64> = series.samples.iter().map(|s| s.cpu_usage).collect();
        assert_eq!(cpu, vec![1.0, 1.0, 3.0]);
        assert_eq!(series.samples[2].timestamp.timestamp(), 1_699_999_200);
        assert_eq!(series.samples[2].cpu_percent, 37.5);
        assert_eq!(series.samples[2].memory_percent, 50.0);
    }

    #[test]
    fn test_measured_window_always_has_full_length() {
        let builder = HistoryBuilder::new(None, 24, Duration::from_secs(3600));
        let mut points = MeasuredSeries::new();
        // off-grid point lands in the slot that closes after it
        points.insert(1_699_994_000, MeasuredPoint { cpu: 4.0, memory: 512.0 });

        let series = builder.build_window(&state(), now(), Some(&points));
        assert_eq!(series.origin, SeriesOrigin::Measured);
        assert_eq!(series.samples.len(), 24);
        assert!(series.samples[..22].iter().all(|s| s.cpu_usage == 0.0 && s.memory_usage == 0.0));
        assert_eq!(series.samples[22].cpu_usage, 4.0);
        assert_eq!(series.samples[23].cpu_usage, 4.0);
        assert_eq!(series.samples[23].memory_percent, 12.5);
        for pair in series.samples.windows(2) {
            assert_eq!((pair[1].timestamp - pair[0].timestamp).num_seconds(), 3600);
        }
    }

    #[test]
    fn test_points_outside_window_fall_back_to_approximation() {
        let builder = HistoryBuilder::new(None, 3, Duration::from_secs(3600));
        let mut points = MeasuredSeries::new();
        points.insert(1_699_000_000, MeasuredPoint { cpu: 1.0, memory: 1.0 });
        points.insert(1_700_010_800, MeasuredPoint { cpu: 1.0, memory: 1.0 });

        let series = builder.build_window(&state(), now(), Some(&points));
        assert!(series.is_approximated());
        assert_eq!(series.samples.len(), 3);
        assert_eq!(series.samples[0].cpu_usage, 2.0);
    }

    #[test]
    fn test_build_window_falls_back_when_series_empty() {
        let builder = HistoryBuilder::new(None, 24, Duration::from_secs(3600));
        let empty = MeasuredSeries::new();
        let series = builder.build_window(&state(), now(), Some(&empty));
        assert!(series.is_approximated());
        assert_eq!(series.samples.len(), 24);
    }

    #[test]
    fn test_merge_coalesces_duplicate_timestamps() {
        let series: Vec<QuerySeries> = serde_json::from_str(
            r#"[{"metric":{"namespace":"shop"},"values":[[100,"1"],[200,"2"]]},
                {"metric":{"namespace":"shop"},"values":[[200,"5"]]}]"#,
        )
        .unwrap();
        let mut target = HashMap::new();
        MeasuredHistory::merge(&mut target, &series, NAMESPACE_LABELS, Metric::Cpu);
        let shop = &target["shop"];
        assert_eq!(shop.len(), 2);
        assert_eq!(shop[&200].cpu, 5.0);
    }

    #[tokio::test]
    async fn test_populate_without_telemetry_approximates_everything() {
        let mut metrics = PerformanceMetrics::default();
        let mut node = NodeMetric::new("worker-1");
        node.cpu_allocatable = 8.0;
        node.cpu_usage = 2.0;
        metrics.nodes.insert("worker-1".to_string(), node);
        metrics.namespace_mut("shop").cpu_usage = 1.0;

        let builder = HistoryBuilder::new(None, 24, Duration::from_secs(3600));
        builder
            .populate(&mut metrics, now(), Instant::now() + Duration::from_secs(1))
            .await;

        assert!(metrics.history.nodes["worker-1"].is_approximated());
        let shop = &metrics.history.namespaces["shop"];
        assert_eq!(shop.samples.len(), 24);
        assert_eq!(shop.samples[0].cpu_percent, 12.5);
        assert!(metrics.history.any_approximated());
    }
}

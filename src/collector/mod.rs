use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{CollectionError, SourceError};
use crate::history::HistoryBuilder;
use crate::metrics::{shared, MetricsSource, SharedMetrics};
use crate::parsing::percent_of;
use crate::ranking::RankingEngine;
use crate::types::{CollectionPhase, Config, PerformanceMetrics};

/// Upper bound on concurrently running derived sources.
pub const MAX_DERIVED_SOURCES: usize = 3;

/// Drives one collection cycle: inventory, concurrent derived sources,
/// optional fallback, then commitment ratios.
pub struct MetricsCollector {
    inventory: Arc<dyn MetricsSource>,
    derived: Vec<Arc<dyn MetricsSource>>,
    fallback: Option<Arc<dyn MetricsSource>>,
    history: Option<HistoryBuilder>,
    ranking: RankingEngine,
    collection_timeout: Duration,
    history_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(inventory: Arc<dyn MetricsSource>, config: &Config) -> Self {
        Self {
            inventory,
            derived: Vec::new(),
            fallback: None,
            history: None,
            ranking: RankingEngine::from_config(config),
            collection_timeout: config.collection_timeout,
            history_timeout: config.history_timeout,
        }
    }

    /// Register a derived source. Sources beyond [`MAX_DERIVED_SOURCES`] are ignored.
    pub fn with_derived(mut self, source: Arc<dyn MetricsSource>) -> Self {
        if self.derived.len() >= MAX_DERIVED_SOURCES {
            warn!(source = source.name(), "derived source limit reached, ignoring");
            return self;
        }
        self.derived.push(source);
        self
    }

    pub fn with_fallback(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.fallback = Some(source);
        self
    }

    pub fn with_history(mut self, history: HistoryBuilder) -> Self {
        self.history = Some(history);
        self
    }

    pub fn derived_count(&self) -> usize {
        self.derived.len()
    }

    /// Collect under the fast-path deadline.
    pub async fn collect(&self) -> Result<PerformanceMetrics, CollectionError> {
        self.collect_until(Instant::now() + self.collection_timeout).await
    }

    pub async fn collect_until(&self, deadline: Instant) -> Result<PerformanceMetrics, CollectionError> {
        let shared = shared(PerformanceMetrics::default());
        enter(&shared, CollectionPhase::Idle).await;

        enter(&shared, CollectionPhase::CollectingNodes).await;
        let inventory = match timeout_at(deadline, self.inventory.collect(&shared)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout {
                name: self.inventory.name().to_string(),
                after: self.collection_timeout,
            }),
        };
        if let Err(e) = inventory {
            error!(source = self.inventory.name(), error = %e, "node inventory failed");
            enter(&shared, CollectionPhase::Failed).await;
            return Err(CollectionError::NodeInventory(e));
        }

        enter(&shared, CollectionPhase::CollectingDerived).await;
        self.fan_out(&shared, deadline).await;

        if needs_fallback(&shared).await {
            enter(&shared, CollectionPhase::ConditionalFallback).await;
            self.run_fallback(&shared, deadline).await;
            if needs_fallback(&shared).await {
                warn!("no source produced utilization or namespace usage, aggregate is incomplete");
                shared.lock().await.diagnostics.incomplete = true;
            }
        }

        enter(&shared, CollectionPhase::ComputingRatios).await;
        let mut guard = shared.lock().await;
        compute_commitment(&mut guard);
        guard.enter_phase(CollectionPhase::Done);
        debug!(phase = ?CollectionPhase::Done, "collection phase");
        Ok(std::mem::take(&mut *guard))
    }

    async fn fan_out(&self, shared: &SharedMetrics, deadline: Instant) {
        let budget = deadline.saturating_duration_since(Instant::now());
        let mut tasks = JoinSet::new();

        for source in &self.derived {
            let source = Arc::clone(source);
            let shared = Arc::clone(shared);
            tasks.spawn(async move {
                let name = source.name().to_string();
                let outcome = match timeout_at(deadline, source.collect(&shared)).await {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Timeout {
                        name: name.clone(),
                        after: budget,
                    }),
                };
                (name, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(source = %name, "source finished"),
                Ok((name, Err(e))) => {
                    warn!(source = %name, error = %e, "source failed, continuing without it");
                    shared.lock().await.record_failure(&name, e.to_string());
                }
                Err(e) => {
                    error!(error = %e, "source task aborted");
                    shared.lock().await.record_failure("unknown", e.to_string());
                }
            }
        }
    }

    async fn run_fallback(&self, shared: &SharedMetrics, deadline: Instant) {
        let source = match &self.fallback {
            Some(s) => s,
            None => {
                debug!("no fallback source configured");
                return;
            }
        };
        shared.lock().await.diagnostics.fallback_attempted = true;
        info!(source = source.name(), "running fallback source");

        let outcome = match timeout_at(deadline, source.collect(shared)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout {
                name: source.name().to_string(),
                after: self.collection_timeout,
            }),
        };
        if let Err(e) = outcome {
            warn!(source = source.name(), error = %e, "fallback source failed");
            shared.lock().await.record_failure(source.name(), e.to_string());
        }
    }

    /// Full cycle: collection, optional history, rankings.
    pub async fn run(&self) -> Result<PerformanceMetrics, CollectionError> {
        let started = Instant::now();
        let mut metrics = self.collect_until(started + self.collection_timeout).await?;

        if let Some(history) = &self.history {
            let deadline = started + self.history_timeout.max(self.collection_timeout);
            history.populate(&mut metrics, Utc::now(), deadline).await;
        }

        metrics.rankings = self.ranking.rank(&metrics);
        info!(
            nodes = metrics.nodes.len(),
            namespaces = metrics.namespaces.len(),
            pods = metrics.pods.len(),
            failed_sources = metrics.diagnostics.failed_sources.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collection finished"
        );
        Ok(metrics)
    }
}

async fn enter(shared: &SharedMetrics, phase: CollectionPhase) {
    debug!(?phase, "collection phase");
    shared.lock().await.enter_phase(phase);
}

async fn needs_fallback(shared: &SharedMetrics) -> bool {
    let metrics = shared.lock().await;
    !metrics.has_overall_utilization() && !metrics.has_namespace_usage()
}

/// Requests and limits over allocatable, in percent. Zero allocatable gives 0.
pub fn compute_commitment(metrics: &mut PerformanceMetrics) {
    let cpu_allocatable = metrics.total_cpu_allocatable();
    let memory_allocatable = metrics.total_memory_allocatable();

    let (cpu_requests, cpu_limits, memory_requests, memory_limits) = metrics.namespaces.values().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(cr, cl, mr, ml), ns| {
            (
                cr + ns.cpu_requests,
                cl + ns.cpu_limits,
                mr + ns.memory_requests,
                ml + ns.memory_limits,
            )
        },
    );

    metrics.cpu_requests_commitment = percent_of(cpu_requests, cpu_allocatable);
    metrics.cpu_limits_commitment = percent_of(cpu_limits, cpu_allocatable);
    metrics.memory_requests_commitment = percent_of(memory_requests, memory_allocatable);
    metrics.memory_limits_commitment = percent_of(memory_limits, memory_allocatable);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NamespaceMetric, NodeMetric};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Applies a closure to the aggregate, optionally after a delay.
    struct StubSource {
        name: &'static str,
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
        apply: fn(&mut PerformanceMetrics),
    }

    impl StubSource {
        fn new(name: &'static str, apply: fn(&mut PerformanceMetrics)) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::ZERO,
                fail: false,
                calls: AtomicUsize::new(0),
                apply,
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::ZERO,
                fail: true,
                calls: AtomicUsize::new(0),
                apply: |_| {},
            })
        }
    }

    #[async_trait]
    impl MetricsSource for StubSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn collect(&self, shared: &SharedMetrics) -> Result<(), SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(SourceError::Unavailable(format!("{} is down", self.name)));
            }
            (self.apply)(&mut *shared.lock().await);
            Ok(())
        }
    }

    fn two_nodes(m: &mut PerformanceMetrics) {
        for name in ["worker-1", "worker-2"] {
            let mut n = NodeMetric::new(name);
            n.cpu_capacity = 8.0;
            n.cpu_allocatable = 8.0;
            n.memory_allocatable = 16.0;
            m.nodes.insert(name.to_string(), n);
        }
    }

    #[tokio::test]
    async fn test_phases_on_happy_path() {
        let collector = MetricsCollector::new(StubSource::new("inventory", two_nodes), &Config::default())
            .with_derived(StubSource::new("usage", |m| m.cpu_utilization_percent = 40.0));

        let metrics = collector.collect().await.unwrap();
        assert_eq!(
            metrics.diagnostics.phases,
            vec![
                CollectionPhase::Idle,
                CollectionPhase::CollectingNodes,
                CollectionPhase::CollectingDerived,
                CollectionPhase::ComputingRatios,
                CollectionPhase::Done,
            ]
        );
        assert!(!metrics.diagnostics.fallback_attempted);
        assert_eq!(metrics.cpu_utilization_percent, 40.0);
    }

    #[tokio::test]
    async fn test_derived_failure_is_recorded_not_propagated() {
        let collector = MetricsCollector::new(StubSource::new("inventory", two_nodes), &Config::default())
            .with_derived(StubSource::failing("telemetry"))
            .with_derived(StubSource::new("metrics-api", |m| m.namespace_mut("shop").cpu_usage = 1.0));

        let metrics = collector.collect().await.unwrap();
        assert_eq!(metrics.diagnostics.failed_sources.len(), 1);
        assert_eq!(metrics.diagnostics.failed_sources[0].source, "telemetry");
        assert_eq!(metrics.namespaces["shop"].cpu_usage, 1.0);
    }

    #[tokio::test]
    async fn test_fallback_runs_only_when_aggregate_empty() {
        let fallback = StubSource::new("kubectl-top", |m| m.memory_utilization_percent = 33.0);
        let collector = MetricsCollector::new(StubSource::new("inventory", two_nodes), &Config::default())
            .with_derived(StubSource::failing("telemetry"))
            .with_fallback(fallback.clone());

        let metrics = collector.collect().await.unwrap();
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        assert!(metrics.diagnostics.fallback_attempted);
        assert!(!metrics.diagnostics.incomplete);
        assert!(metrics.diagnostics.phases.contains(&CollectionPhase::ConditionalFallback));
        assert_eq!(metrics.memory_utilization_percent, 33.0);

        let skipped = StubSource::new("kubectl-top", |_| {});
        let collector = MetricsCollector::new(StubSource::new("inventory", two_nodes), &Config::default())
            .with_derived(StubSource::new("usage", |m| m.cpu_utilization_percent = 10.0))
            .with_fallback(skipped.clone());
        collector.collect().await.unwrap();
        assert_eq!(skipped.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_after_fallback_is_flagged_incomplete() {
        let collector = MetricsCollector::new(StubSource::new("inventory", two_nodes), &Config::default())
            .with_fallback(StubSource::failing("kubectl-top"));

        let metrics = collector.collect().await.unwrap();
        assert!(metrics.diagnostics.incomplete);
        assert_eq!(metrics.diagnostics.phases.last(), Some(&CollectionPhase::Done));
    }

    #[tokio::test]
    async fn test_derived_sources_are_capped() {
        let mut collector = MetricsCollector::new(StubSource::new("inventory", two_nodes), &Config::default());
        for name in ["a", "b", "c", "d"] {
            collector = collector.with_derived(StubSource::new(name, |_| {}));
        }
        assert_eq!(collector.derived_count(), MAX_DERIVED_SOURCES);
    }

    #[test]
    fn test_commitment_over_allocatable() {
        let mut metrics = PerformanceMetrics::default();
        two_nodes(&mut metrics);
        metrics.namespaces.insert(
            "shop".to_string(),
            NamespaceMetric {
                name: "shop".to_string(),
                cpu_requests: 4.0,
                cpu_limits: 24.0,
                memory_requests: 8.0,
                ..Default::default()
            },
        );
        compute_commitment(&mut metrics);
        assert_eq!(metrics.cpu_requests_commitment, 25.0);
        assert_eq!(metrics.cpu_limits_commitment, 150.0);
        assert_eq!(metrics.memory_requests_commitment, 25.0);
        assert_eq!(metrics.memory_limits_commitment, 0.0);
    }

    #[test]
    fn test_commitment_with_no_nodes_is_zero() {
        let mut metrics = PerformanceMetrics::default();
        metrics.namespace_mut("shop").cpu_requests = 2.0;
        compute_commitment(&mut metrics);
        assert_eq!(metrics.cpu_requests_commitment, 0.0);
    }
}

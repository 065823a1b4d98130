use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::types::{Config, PerformanceMetrics, Rankings};

/// Below this many active survivors the noise filter is skipped entirely.
pub const MIN_RANKED: usize = 3;

/// Names ordered by usage descending, ties broken by name ascending.
pub fn top_k(usage: &HashMap<String, f64>, k: usize) -> Vec<String> {
    let mut entries: Vec<(&String, f64)> = usage.iter().map(|(n, v)| (n, *v)).collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    entries.into_iter().take(k).map(|(n, _)| n.clone()).collect()
}

#[derive(Debug, Clone)]
struct Candidate<'a> {
    name: String,
    namespace: &'a str,
    cpu: f64,
    memory: f64,
}

#[derive(Debug, Clone)]
pub struct RankingEngine {
    k: usize,
    noise_floor_cpu: f64,
    noise_floor_memory: f64,
    system_prefixes: Vec<String>,
}

impl RankingEngine {
    pub fn new(k: usize, noise_floor_cpu: f64, noise_floor_memory: f64, system_prefixes: Vec<String>) -> Self {
        Self {
            k,
            noise_floor_cpu,
            noise_floor_memory,
            system_prefixes,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.top_k,
            cfg.noise_floor_cpu_cores,
            cfg.noise_floor_memory_bytes,
            cfg.system_namespace_prefixes.clone(),
        )
    }

    pub fn is_system_namespace(&self, namespace: &str) -> bool {
        self.system_prefixes.iter().any(|p| namespace.starts_with(p.as_str()))
    }

    fn is_noise(&self, c: &Candidate<'_>) -> bool {
        self.is_system_namespace(c.namespace) && c.cpu < self.noise_floor_cpu && c.memory < self.noise_floor_memory
    }

    pub fn rank(&self, metrics: &PerformanceMetrics) -> Rankings {
        let namespaces = metrics.namespaces.values().map(|ns| Candidate {
            name: ns.name.clone(),
            namespace: ns.name.as_str(),
            cpu: ns.cpu_usage,
            memory: ns.memory_usage,
        });
        let pods = metrics.pods.iter().map(|(key, pod)| Candidate {
            name: key.clone(),
            namespace: pod.namespace.as_str(),
            cpu: pod.cpu_usage,
            memory: pod.memory_usage,
        });

        let (cpu_namespaces, memory_namespaces) = self.rank_candidates(namespaces.collect());
        let (cpu_pods, memory_pods) = self.rank_candidates(pods.collect());
        debug!(
            cpu_namespaces = cpu_namespaces.len(),
            memory_namespaces = memory_namespaces.len(),
            cpu_pods = cpu_pods.len(),
            memory_pods = memory_pods.len(),
            "rankings computed"
        );
        Rankings {
            cpu_namespaces,
            memory_namespaces,
            cpu_pods,
            memory_pods,
        }
    }

    fn rank_candidates(&self, candidates: Vec<Candidate<'_>>) -> (Vec<String>, Vec<String>) {
        // idle candidates never rank, so they must not count as survivors
        let active: Vec<&Candidate<'_>> = candidates.iter().filter(|c| c.cpu > 0.0 || c.memory > 0.0).collect();
        let kept: Vec<&Candidate<'_>> = active.iter().copied().filter(|c| !self.is_noise(c)).collect();
        let pool = if kept.len() < MIN_RANKED { active } else { kept };

        let cpu: HashMap<String, f64> = pool
            .iter()
            .filter(|c| c.cpu > 0.0)
            .map(|c| (c.name.clone(), c.cpu))
            .collect();
        let memory: HashMap<String, f64> = pool
            .iter()
            .filter(|c| c.memory > 0.0)
            .map(|c| (c.name.clone(), c.memory))
            .collect();

        let mut by_cpu = top_k(&cpu, self.k);
        let by_memory = top_k(&memory, self.k);
        if by_cpu.len() < MIN_RANKED && by_memory.len() > by_cpu.len() {
            backfill(&mut by_cpu, &by_memory, self.k);
        }
        (by_cpu, by_memory)
    }
}

/// Append names from `donor` not already in `list`, up to `k` entries.
fn backfill(list: &mut Vec<String>, donor: &[String], k: usize) {
    let mut seen: HashSet<String> = list.iter().cloned().collect();
    for name in donor {
        if list.len() >= k {
            break;
        }
        if seen.insert(name.clone()) {
            list.push(name.clone());
        }
    }
}

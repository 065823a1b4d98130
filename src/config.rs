use anyhow::{Context, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::parsing::normalize_quantity;
use crate::types::{Config, Thresholds};

/// Source of environment variables, swappable in tests.
pub trait EnvironmentProvider {
    fn get_var(&self, key: &str) -> Option<String>;
}

pub struct SystemEnvironment;

impl EnvironmentProvider for SystemEnvironment {
    fn get_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Debug, Default)]
pub struct MockEnvironment {
    vars: HashMap<String, String>,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_var<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_var<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.set_var(key, value);
        self
    }
}

impl EnvironmentProvider for MockEnvironment {
    fn get_var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

const MIN_QUERY_TIMEOUT_SECS: u64 = 5;
const MAX_QUERY_TIMEOUT_SECS: u64 = 30;

pub fn load_config() -> Result<Config> {
    load_config_with_env(&SystemEnvironment)
}

pub fn load_config_with_env<E: EnvironmentProvider>(env: &E) -> Result<Config> {
    let defaults = Config::default();

    let telemetry_url = non_empty(env, "TELEMETRY_URL");
    let telemetry_token = non_empty(env, "TELEMETRY_TOKEN");

    let query_timeout_secs: u64 = parse_or(env, "QUERY_TIMEOUT_SECS", 10)?;
    let query_timeout_secs = query_timeout_secs.clamp(MIN_QUERY_TIMEOUT_SECS, MAX_QUERY_TIMEOUT_SECS);

    let noise_floor_memory_bytes = match non_empty(env, "NOISE_FLOOR_MEMORY") {
        Some(q) => normalize_quantity(&q).context("Invalid NOISE_FLOOR_MEMORY")?,
        None => defaults.noise_floor_memory_bytes,
    };

    let system_namespace_prefixes = match env.get_var("SYSTEM_NAMESPACE_PREFIXES") {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => defaults.system_namespace_prefixes,
    };

    let thresholds = Thresholds {
        cpu_warning_percent: parse_or(env, "CPU_WARNING_PERCENT", 75.0)?,
        cpu_critical_percent: parse_or(env, "CPU_CRITICAL_PERCENT", 90.0)?,
        memory_warning_percent: parse_or(env, "MEMORY_WARNING_PERCENT", 80.0)?,
        memory_critical_percent: parse_or(env, "MEMORY_CRITICAL_PERCENT", 95.0)?,
        commitment_warning_percent: parse_or(env, "COMMITMENT_WARNING_PERCENT", 150.0)?,
    };

    Ok(Config {
        telemetry_url,
        telemetry_token,
        telemetry_insecure: parse_bool(env, "TELEMETRY_INSECURE", false),
        query_timeout: Duration::from_secs(query_timeout_secs),
        command_timeout: Duration::from_secs(parse_or(env, "COMMAND_TIMEOUT_SECS", 15)?),
        kubectl_path: non_empty(env, "KUBECTL_PATH").unwrap_or(defaults.kubectl_path),
        collection_timeout: Duration::from_secs(parse_or(env, "COLLECTION_TIMEOUT_SECS", 30)?),
        history_timeout: Duration::from_secs(parse_or(env, "HISTORY_TIMEOUT_SECS", 120)?),
        include_history: parse_bool(env, "INCLUDE_HISTORY", false),
        history_samples: parse_or(env, "HISTORY_SAMPLES", 24)?,
        history_step: Duration::from_secs(parse_or(env, "HISTORY_STEP_SECS", 3600)?),
        top_k: parse_or(env, "TOP_K", 10)?,
        noise_floor_cpu_cores: parse_or(env, "NOISE_FLOOR_CPU_CORES", 0.01)?,
        noise_floor_memory_bytes,
        system_namespace_prefixes,
        debug_payloads: parse_bool(env, "DEBUG_PAYLOADS", false),
        thresholds,
    })
}

fn non_empty<E: EnvironmentProvider>(env: &E, key: &str) -> Option<String> {
    env.get_var(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<E, T>(env: &E, key: &str, default: T) -> Result<T>
where
    E: EnvironmentProvider,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(env, key) {
        Some(raw) => raw.parse().with_context(|| format!("Invalid {}", key)),
        None => Ok(default),
    }
}

fn parse_bool<E: EnvironmentProvider>(env: &E, key: &str, default: bool) -> bool {
    env.get_var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_loading_defaults() {
        let config = load_config_with_env(&MockEnvironment::new()).unwrap();

        assert_eq!(config.telemetry_url, None);
        assert_eq!(config.query_timeout, Duration::from_secs(10));
        assert_eq!(config.collection_timeout, Duration::from_secs(30));
        assert_eq!(config.history_timeout, Duration::from_secs(120));
        assert_eq!(config.history_samples, 24);
        assert_eq!(config.top_k, 10);
        assert_eq!(config.kubectl_path, "kubectl");
        assert_eq!(config.noise_floor_memory_bytes, 50.0 * 1024.0 * 1024.0);
        assert_eq!(config.system_namespace_prefixes, vec!["kube-", "openshift"]);
        assert!(!config.include_history);
        assert_eq!(config.thresholds.cpu_critical_percent, 90.0);
    }

    #[test]
    fn test_config_loading_with_env() {
        let env = MockEnvironment::new()
            .with_var("TELEMETRY_URL", "https://prometheus.monitoring:9090")
            .with_var("TELEMETRY_TOKEN", "s3cret")
            .with_var("TELEMETRY_INSECURE", "true")
            .with_var("INCLUDE_HISTORY", "1")
            .with_var("HISTORY_SAMPLES", "12")
            .with_var("HISTORY_STEP_SECS", "1800")
            .with_var("TOP_K", "5")
            .with_var("NOISE_FLOOR_MEMORY", "100Mi")
            .with_var("SYSTEM_NAMESPACE_PREFIXES", " kube- , istio-system ,")
            .with_var("MEMORY_WARNING_PERCENT", "70");

        let config = load_config_with_env(&env).unwrap();

        assert_eq!(config.telemetry_url.as_deref(), Some("https://prometheus.monitoring:9090"));
        assert_eq!(config.telemetry_token.as_deref(), Some("s3cret"));
        assert!(config.telemetry_insecure);
        assert!(config.include_history);
        assert_eq!(config.history_samples, 12);
        assert_eq!(config.history_step, Duration::from_secs(1800));
        assert_eq!(config.top_k, 5);
        assert_eq!(config.noise_floor_memory_bytes, 100.0 * 1024.0 * 1024.0);
        assert_eq!(config.system_namespace_prefixes, vec!["kube-", "istio-system"]);
        assert_eq!(config.thresholds.memory_warning_percent, 70.0);
    }

    #[test]
    fn test_query_timeout_is_clamped() {
        let low = load_config_with_env(&MockEnvironment::new().with_var("QUERY_TIMEOUT_SECS", "1")).unwrap();
        assert_eq!(low.query_timeout, Duration::from_secs(5));

        let high = load_config_with_env(&MockEnvironment::new().with_var("QUERY_TIMEOUT_SECS", "300")).unwrap();
        assert_eq!(high.query_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_numbers_name_the_variable() {
        for key in ["TOP_K", "COLLECTION_TIMEOUT_SECS", "CPU_WARNING_PERCENT", "NOISE_FLOOR_MEMORY"] {
            let env = MockEnvironment::new().with_var(key, "plenty");
            let err = load_config_with_env(&env).unwrap_err();
            assert!(err.to_string().contains(key), "error for {} was {}", key, err);
        }
    }

    #[test]
    fn test_boolean_parsing() {
        for val in ["1", "true", "TRUE", "True"] {
            let env = MockEnvironment::new().with_var("DEBUG_PAYLOADS", val);
            assert!(load_config_with_env(&env).unwrap().debug_payloads, "Failed for value: {}", val);
        }
        for val in ["0", "false", "FALSE", "no", ""] {
            let env = MockEnvironment::new().with_var("DEBUG_PAYLOADS", val);
            assert!(!load_config_with_env(&env).unwrap().debug_payloads, "Failed for value: {}", val);
        }
    }

    #[test]
    fn test_blank_url_disables_telemetry() {
        let env = MockEnvironment::new().with_var("TELEMETRY_URL", "   ");
        assert_eq!(load_config_with_env(&env).unwrap().telemetry_url, None);
    }
}

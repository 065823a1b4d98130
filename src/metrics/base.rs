use async_trait::async_trait;
use kube::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::SourceError;
use crate::types::PerformanceMetrics;

/// The aggregate while sources are still writing to it.
pub type SharedMetrics = Arc<Mutex<PerformanceMetrics>>;

pub fn shared(metrics: PerformanceMetrics) -> SharedMetrics {
    Arc::new(Mutex::new(metrics))
}

/// A best-effort provider of cluster metrics.
///
/// Implementations fetch without holding the lock, then lock briefly to merge.
/// Whatever was merged before an error (or before the caller's deadline drops
/// the future) stays in the aggregate.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    fn name(&self) -> &str;

    async fn collect(&self, shared: &SharedMetrics) -> Result<(), SourceError>;
}

/// Write `value` only while `slot` still holds the zero sentinel.
/// Returns whether the write happened.
pub fn set_if_unset(slot: &mut f64, value: f64) -> bool {
    if *slot == 0.0 && value != 0.0 && value.is_finite() {
        *slot = value;
        true
    } else {
        false
    }
}

pub fn set_option_if_unset(slot: &mut Option<f64>, value: f64) -> bool {
    if slot.is_none() && value.is_finite() {
        *slot = Some(value);
        true
    } else {
        false
    }
}

/// GET a metrics.k8s.io (or any raw) API path through the kube client.
pub async fn get_raw<T: DeserializeOwned>(client: &Client, path: &str) -> Result<T, SourceError> {
    use http::Request as HttpRequest;
    let req = HttpRequest::builder()
        .method("GET")
        .uri(path)
        .body(Vec::new())
        .map_err(|e| SourceError::Query(format!("build request: {}", e)))?;
    Ok(client.request(req).await?)
}

// Metrics source clients
pub mod base;
pub mod inventory;
pub mod telemetry;
pub mod metrics_api;
pub mod cli_top;

// Re-export commonly used items
pub use base::{set_if_unset, set_option_if_unset, shared, MetricsSource, SharedMetrics};
pub use inventory::NodeInventoryClient;
pub use telemetry::{TelemetryClient, QueryTarget, NamedQuery, DEFAULT_QUERIES};
pub use metrics_api::AggregatedMetricsClient;
pub use cli_top::{CliFallbackClient, CommandRunner, ProcessRunner};

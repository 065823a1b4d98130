// Public modules
pub mod types;
pub mod error;
pub mod config;
pub mod parsing;
pub mod kubernetes;
pub mod metrics;
pub mod collector;
pub mod history;
pub mod ranking;
pub mod report;

// Re-export commonly used items
pub use types::*;
pub use error::{CollectionError, NormalizationError, SourceError};
pub use config::{load_config, load_config_with_env, EnvironmentProvider, SystemEnvironment, MockEnvironment};
pub use parsing::{normalize_quantity, normalize_or_zero, percent_of};
pub use kubernetes::build_collector;
pub use metrics::*;
pub use collector::{compute_commitment, MetricsCollector};
pub use history::{approximate_window, ApproximatedWindow, HistoryBuilder};
pub use ranking::{top_k, RankingEngine};
pub use report::{evaluate, CheckResult, Status};

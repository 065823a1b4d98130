use std::time::Duration;

/// A quantity token that could not be turned into a number.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    #[error("invalid quantity: {0:?}")]
    InvalidQuantity(String),
}

/// Failure of a single metrics source. Never fatal on its own except for
/// the node inventory.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("query failed: {0}")]
    Query(String),

    #[error("{name} timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// The only error a collection run surfaces to its caller.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("node inventory failed, no capacity available: {0}")]
    NodeInventory(#[source] SourceError),
}

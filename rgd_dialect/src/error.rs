//! Errors raised while rendering a resource graph to the cluster-side wire dialect.

use thiserror::Error;

/// Result alias using [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by [`crate::document::render`].
#[derive(Debug, Error)]
pub enum Error {
    /// The graph's dependency structure could not be resolved (unknown resource, cycle).
    #[error(transparent)]
    Graph(#[from] graph_builder::Error),
    /// The rendered document failed to serialize as JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The rendered document failed to serialize as YAML.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

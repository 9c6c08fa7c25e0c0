//! Error type shared by the reference/expression primitives and the resource-graph data model.

use thiserror::Error;

use crate::value::{FieldPath, ResourceId};

/// Result alias using [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building or walking a resource graph's value tree.
#[derive(Debug, Error)]
pub enum Error {
    /// A field path string could not be parsed.
    #[error("malformed field path {path:?}: {reason}")]
    MalformedFieldPath {
        /// The offending text.
        path: String,
        /// Why it failed to parse.
        reason: &'static str,
    },

    /// Two resources were registered under the same id.
    #[error("duplicate resource id {0:?}")]
    DuplicateResourceId(ResourceId),

    /// A reference named a resource id that does not exist in the graph.
    #[error("reference to unknown resource {resource_id:?} at {field_path}")]
    UnknownResource {
        /// The dangling id.
        resource_id: ResourceId,
        /// Where it was referenced from.
        field_path: FieldPath,
    },

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

//! Errors raised while composing or resolving a resource graph.

use api::{FieldPath, ResourceId};
use thiserror::Error;

/// Result alias using [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the graph builder, composition context, and dependency resolver.
#[derive(Debug, Error)]
pub enum Error {
    /// Two resources (or a resource and a deferred step) were registered under the same id.
    #[error(
        "duplicate resource id {id:?}: drop the explicit id, rename the resource, or use a distinct kind"
    )]
    ContextRegistration {
        /// The colliding id.
        id: ResourceId,
    },

    /// A manifest referenced a resource id that has no entry in the graph.
    #[error("reference to unknown resource {resource_id:?} at {field_path}")]
    UnknownResource {
        /// The dangling id.
        resource_id: ResourceId,
        /// Where it was referenced from.
        field_path: FieldPath,
    },

    /// The dependency graph contains a cycle.
    #[error("circular dependency: {}", cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))]
    CircularDependency {
        /// The ids forming the cycle, in order, with the first id repeated at the end.
        cycle: Vec<ResourceId>,
    },

    /// Propagated from the underlying data-model crate.
    #[error(transparent)]
    Api(#[from] api::Error),
}

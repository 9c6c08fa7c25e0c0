//! The resource-graph data model: resource entries, the graph itself, deployed-resource records,
//! and watch-connection state (§3 of the accompanying design document).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::{ResourceId, Value};

/// A predicate deciding whether a live object (its manifest, re-read from the cluster, as a plain
/// JSON value) is "ready". Kind-specific predicates are supplied by callers; the default is
/// "object exists and has non-error status", applied by the engine when `None`.
pub type ReadinessPredicate = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// A single entry in a [`ResourceGraph`]: a manifest, possibly containing embedded
/// [`crate::value::Reference`]s and [`crate::value::Expression`]s anywhere within it.
#[derive(Clone)]
pub struct ResourceEntry {
    /// Stable id, either user-supplied or deterministically assigned (see `graph_builder::dag`).
    pub id: ResourceId,
    /// The Kubernetes kind, e.g. `Deployment`.
    pub kind: String,
    /// The Kubernetes apiVersion, e.g. `apps/v1`.
    pub api_version: String,
    /// The full manifest, as a [`Value`] tree.
    pub manifest: Value,
    /// An optional kind-specific readiness predicate; `None` uses the engine's default.
    pub readiness: Option<ReadinessPredicate>,
}

impl std::fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("api_version", &self.api_version)
            .field("manifest", &self.manifest)
            .field("readiness", &self.readiness.is_some())
            .finish()
    }
}

/// The user-provided spec/status schema shapes for a graph, plus the group/version/kind under
/// which instances of the graph are addressed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    /// The apiVersion instances of this graph's kind are addressed under, e.g. `example.com/v1alpha1`.
    pub api_version: String,
    /// The kind name instances of this graph are addressed as.
    pub kind: String,
    /// The shape of the user-supplied spec (a `Value` tree whose leaves describe expected types;
    /// concrete instance values are supplied separately at deploy time).
    pub spec: Value,
    /// The shape of the aggregate status as *declared* (before evaluation); leaves are literals,
    /// [`crate::value::Reference`]s, or [`crate::value::Expression`]s.
    pub status: Value,
}

/// A function computing the aggregate status shape from the schema and the graph's resources.
/// Read-only: it must not mutate the resources it is given.
pub type StatusClosure =
    Arc<dyn Fn(&Schema, &IndexMap<ResourceId, ResourceEntry>) -> Value + Send + Sync>;

/// An ordered collection of [`ResourceEntry`] values plus the schema and status closure that
/// together make up a complete resource graph definition.
#[derive(Clone)]
pub struct ResourceGraph {
    /// Resources, keyed by id, in insertion (= declaration) order.
    pub resources: IndexMap<ResourceId, ResourceEntry>,
    /// The graph's schema.
    pub schema: Schema,
    /// The status closure.
    pub status: StatusClosure,
}

impl std::fmt::Debug for ResourceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGraph")
            .field("resources", &self.resources)
            .field("schema", &self.schema)
            .finish()
    }
}

impl ResourceGraph {
    /// Evaluates the status closure against the graph's own resources.
    pub fn status_shape(&self) -> Value {
        (self.status)(&self.schema, &self.resources)
    }
}

/// The lifecycle state of a single deployed resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeployedStatus {
    /// Applied but not yet confirmed ready.
    Pending,
    /// Applied and confirmed ready.
    Deployed,
    /// Apply or readiness-wait failed terminally.
    Failed,
}

/// A record of one resource's deployment within a single [`crate::model::ResourceGraph`] instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployedResource {
    /// The graph-internal id.
    pub id: ResourceId,
    /// Kubernetes kind.
    pub kind: String,
    /// The resource's name on the cluster.
    pub name: String,
    /// The resource's namespace, if namespaced.
    pub namespace: Option<String>,
    /// The manifest as applied (post-materialization, post-resolution).
    pub manifest: Value,
    /// Current lifecycle status.
    pub status: DeployedStatus,
    /// When the resource was first applied.
    pub created_at: DateTime<Utc>,
    /// When the resource's record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Per-`(kind, namespace, field-selector)` watch bookkeeping (component C7).
#[derive(Clone, Debug, Default)]
pub struct WatchConnectionState {
    /// The resource-version cursor from the last successful list/watch event.
    pub resource_version: Option<String>,
    /// The set of resource ids this connection is following.
    pub followed: HashSet<ResourceId>,
    /// Consecutive reconnect attempts since the last success.
    pub reconnect_attempts: u32,
    /// Whether a reconnect is currently in flight.
    pub reconnecting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_shape_sees_resources() {
        let schema = Schema {
            api_version: "example.com/v1alpha1".into(),
            kind: "Widget".into(),
            spec: Value::Null,
            status: Value::Null,
        };
        let graph = ResourceGraph {
            resources: IndexMap::new(),
            schema,
            status: Arc::new(|_schema, resources| Value::Int(i64::try_from(resources.len()).unwrap())),
        };
        assert_eq!(graph.status_shape(), Value::Int(0));
    }
}

//! Runtime bookkeeping shared across the deployment engine, the watch pipeline, and the status
//! hydrator: the per-instance view of "what's on the cluster right now" that `api::DeployedResource`
//! (the public, serializable record) is projected from.

use api::{DeployedResource, DeployedStatus, ResourceId};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;

/// One resource's live bookkeeping within a single deployed graph instance.
///
/// Distinct from [`api::DeployedResource`]: that type is the public, serializable status record
/// (holding the applied [`api::Value`] manifest); this one additionally carries the full live
/// object as last observed on the cluster (status subresource included), which is what the
/// resolver and status hydrator read fields out of.
#[derive(Clone, Debug)]
pub struct DeployedRecord {
    /// The graph-internal id.
    pub id: ResourceId,
    /// Kubernetes kind.
    pub kind: String,
    /// Kubernetes apiVersion.
    pub api_version: String,
    /// The resource's name on the cluster.
    pub name: String,
    /// The resource's namespace, if namespaced.
    pub namespace: Option<String>,
    /// The full object as last observed (get, apply response, or watch event).
    pub live: Json,
    /// Current lifecycle status.
    pub status: DeployedStatus,
    /// When this resource was first applied.
    pub created_at: DateTime<Utc>,
    /// When this record was last updated (reapply, readiness change, watch event).
    pub updated_at: DateTime<Utc>,
}

impl DeployedRecord {
    /// Projects this record into the public, serializable [`DeployedResource`] shape.
    pub fn to_public(&self, manifest: api::Value) -> DeployedResource {
        DeployedResource {
            id: self.id.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            manifest,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// The full live bookkeeping for one deployed graph instance, keyed by graph-internal id.
pub type DeployedMap = indexmap::IndexMap<ResourceId, DeployedRecord>;

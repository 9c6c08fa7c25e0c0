//! The status hydrator (component C8): rereads the live objects a graph's status closure depends
//! on, evaluates the closure (C4) field by field, and publishes the result — per-field isolation
//! means one bad field never blocks the rest (§4.8).

use std::collections::BTreeMap;

use api::{ResourceGraph, Value};
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde_json::Value as Json;
use tracing::{instrument, warn};

use crate::resolve::Resolver;
use crate::state::DeployedMap;
use crate::{Error, Result};

/// A hydrated status value: the graph's declared status shape with every top-level field
/// evaluated independently. Preserves `BTreeMap` ordering so two hydrations of the same status
/// shape compare equal regardless of evaluation order.
pub type StatusValue = BTreeMap<String, Json>;

/// Rereads deployed objects and evaluates a graph's status closure against them.
pub struct Hydrator {
    client: Option<Client>,
    namespace: String,
    field_manager: String,
}

impl Hydrator {
    /// Builds a hydrator. `client` is `None` for dry-run rendering that never reaches the cluster;
    /// callers in that mode should expect every status field to resolve from the deployed snapshot
    /// already held in `deployed`, never from a live re-read.
    pub fn new(client: Option<Client>, namespace: impl Into<String>, field_manager: impl Into<String>) -> Self {
        Hydrator {
            client,
            namespace: namespace.into(),
            field_manager: field_manager.into(),
        }
    }

    /// Evaluates the graph's status closure against `deployed`, independently per top-level field.
    /// A field whose evaluation errors is logged and omitted from the result — the caller merges
    /// the result over the previous published status so omitted fields retain their prior value,
    /// matching "that field is left at its previous value; other fields still update".
    #[instrument(skip(self, graph, deployed))]
    pub async fn hydrate(&self, graph: &ResourceGraph, deployed: &DeployedMap) -> StatusValue {
        let schema_instance = Json::Object(serde_json::Map::new());
        let resolver = Resolver::new(schema_instance, deployed, self.namespace.clone(), self.client.clone());

        let Value::Object(fields) = graph.status_shape() else {
            warn!("status shape is not an object; nothing to hydrate");
            return StatusValue::new();
        };

        let mut out = StatusValue::new();
        for (name, value) in fields {
            match resolver.resolve_value(&value).await {
                Ok(json) => {
                    out.insert(name, json);
                }
                Err(err) => {
                    warn!(field = %name, %err, "status field evaluation failed; leaving previous value");
                }
            }
        }
        out
    }

    /// Publishes a hydrated status to the graph's instance object via a status-subresource patch,
    /// mirroring the `Patch::Apply` idiom the teacher uses for `ClairStatus`.
    #[instrument(skip(self, status))]
    pub async fn publish(&self, api_version: &str, kind: &str, name: &str, status: &StatusValue) -> Result<()> {
        let Some(client) = self.client.clone() else {
            return Ok(()); // dry-run / no cluster client: nothing to publish against.
        };
        let gvk = crate::util::parse_gvk(api_version, kind)?;
        let ar = ApiResource::from_gvk_with_plural(&gvk, &crate::util::guess_plural(kind));
        let api: Api<DynamicObject> = Api::namespaced_with(client, &self.namespace, &ar);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(&self.field_manager), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(kind, name, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{Reference, Schema, TypeTag};
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::Arc;

    fn graph_with_status(status: Value) -> ResourceGraph {
        ResourceGraph {
            resources: IndexMap::new(),
            schema: Schema {
                api_version: "example.com/v1alpha1".into(),
                kind: "Widget".into(),
                spec: Value::Null,
                status: Value::Null,
            },
            status: Arc::new(move |_s, _r| status.clone()),
        }
    }

    #[tokio::test]
    async fn hydrates_literal_fields() {
        let mut fields = IndexMap::new();
        fields.insert("ready".to_string(), Value::Bool(true));
        fields.insert("replicas".to_string(), Value::Int(2));
        let graph = graph_with_status(Value::Object(fields));
        let hydrator = Hydrator::new(None, "default", "test");
        let deployed = DeployedMap::new();
        let status = hydrator.hydrate(&graph, &deployed).await;
        assert_eq!(status.get("ready"), Some(&json!(true)));
        assert_eq!(status.get("replicas"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn unresolvable_field_is_omitted_not_fatal() {
        let mut fields = IndexMap::new();
        fields.insert("ok".to_string(), Value::Int(1));
        fields.insert(
            "missing".to_string(),
            Value::Ref(Reference::new(api::ResourceId::from("nowhere"), "status.x".parse().unwrap(), TypeTag::String)),
        );
        let graph = graph_with_status(Value::Object(fields));
        let hydrator = Hydrator::new(None, "default", "test");
        let deployed = DeployedMap::new();
        let status = hydrator.hydrate(&graph, &deployed).await;
        assert_eq!(status.get("ok"), Some(&json!(1)));
        assert!(!status.contains_key("missing"));
    }
}

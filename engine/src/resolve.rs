//! Reference resolution and expression evaluation against live/deployed resource state (the
//! runtime half of component C4 — `engine::eval` is the expression parser/evaluator proper).
//!
//! The walk here is the selective clone described in §4.4: scalars and containers are copied
//! field-by-field, but a [`Value::Ref`]/[`Value::Expr`] leaf is never structurally decomposed —
//! it is handed to [`Resolver::resolve_reference`]/[`Resolver::resolve_expression`] instead and
//! the *result* of that call takes the leaf's place in the output tree.

use std::cell::RefCell;
use std::collections::HashMap;

use api::{FieldPath, PathSegment, Reference, ResourceId, Value};
use indexmap::IndexMap;
use serde_json::Value as Json;
use tracing::{instrument, trace};

use crate::eval::{self, Bindings};
use crate::{Error, Result};

/// Resolves [`Reference`]s and evaluates [`api::Expression`]s against a fixed snapshot of
/// deployed-resource state, optionally falling back to a live cluster read when a resource's
/// snapshot doesn't yet have the requested field (e.g. a status field not populated at apply
/// time, only observed later by the watch pipeline or a follow-up read).
///
/// Scoped to a single resolution session: the cache is never shared across sessions and is
/// cleared by dropping the `Resolver`, matching the scoping rule in §4.4.
pub struct Resolver {
    bindings: RefCell<Bindings>,
    client: Option<kube::Client>,
    namespace: String,
    api_versions: HashMap<ResourceId, (String, String, String)>, // (kind, api_version, name)
    cache: RefCell<HashMap<(ResourceId, FieldPath), Json>>,
}

impl Resolver {
    /// Builds a resolver over the schema instance (spec merged with whatever status has been
    /// hydrated so far) and the current deployed-resource snapshot. `client` is `None` for
    /// dry-run/cluster-side rendering paths that never need a live read.
    pub fn new(
        schema_instance: Json,
        deployed: &IndexMap<ResourceId, crate::DeployedRecord>,
        namespace: impl Into<String>,
        client: Option<kube::Client>,
    ) -> Self {
        let mut bindings = Bindings::new();
        bindings.insert(ResourceId::schema(), schema_instance);
        let mut api_versions = HashMap::new();
        for (id, rec) in deployed {
            bindings.insert(id.clone(), rec.live.clone());
            api_versions.insert(id.clone(), (rec.kind.clone(), rec.api_version.clone(), rec.name.clone()));
        }
        Resolver {
            bindings: RefCell::new(bindings),
            client,
            namespace: namespace.into(),
            api_versions,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Clears the resolution cache, forcing the next lookup of any field to re-derive it from
    /// bindings or a fresh live read.
    pub fn invalidate(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Resolves an entire [`Value`] tree, substituting every embedded placeholder with its
    /// concrete value. Non-placeholder structure is preserved exactly (Testable Property 6).
    #[instrument(skip(self, value))]
    pub async fn resolve_value(&self, value: &Value) -> Result<Json> {
        match value {
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Int(i) => Ok(Json::Number((*i).into())),
            Value::String(s) => Ok(Json::String(s.clone())),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Box::pin(self.resolve_value(item)).await?);
                }
                Ok(Json::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), Box::pin(self.resolve_value(v)).await?);
                }
                Ok(Json::Object(out))
            }
            Value::Ref(r) => self.resolve_reference(r).await,
            Value::Expr(e) => self.resolve_expression(&e.body).await,
        }
    }

    /// Resolves a single [`Reference`] to its concrete value.
    #[instrument(skip(self), fields(resource_id = %r.resource_id, field_path = %r.field_path))]
    pub async fn resolve_reference(&self, r: &Reference) -> Result<Json> {
        let key = (r.resource_id.clone(), r.field_path.clone());
        if let Some(v) = self.cache.borrow().get(&key) {
            return Ok(v.clone());
        }

        let found = {
            let bindings = self.bindings.borrow();
            bindings.get(&r.resource_id).and_then(|root| extract_path(root, &r.field_path))
        };
        let value = match found {
            Some(v) => v,
            None if r.is_schema() => {
                return Err(Error::ReferenceResolution {
                    resource_id: r.resource_id.clone(),
                    field_path: r.field_path.clone(),
                    reason: "no such schema field".to_string(),
                })
            }
            None => {
                self.ensure_live(&r.resource_id).await?;
                let bindings = self.bindings.borrow();
                let root = bindings.get(&r.resource_id).ok_or_else(|| Error::ReferenceResolution {
                    resource_id: r.resource_id.clone(),
                    field_path: r.field_path.clone(),
                    reason: candidate_hint(&self.api_versions, &r.resource_id),
                })?;
                extract_path(root, &r.field_path).ok_or_else(|| Error::ReferenceResolution {
                    resource_id: r.resource_id.clone(),
                    field_path: r.field_path.clone(),
                    reason: "field not present on live object".to_string(),
                })?
            }
        };
        self.cache.borrow_mut().insert(key, value.clone());
        Ok(value)
    }

    /// Parses and evaluates an expression body against the current bindings snapshot.
    ///
    /// Expressions are evaluated against whatever bindings are already resident — they never
    /// trigger a live read themselves, since an expression can reference any number of resources
    /// and eagerly fetching all of them defeats the point of batching applies by level. Callers
    /// that need fresh data call [`Resolver::ensure_live`] (directly, or indirectly via
    /// [`Resolver::resolve_reference`]) before evaluating an expression that depends on it.
    pub async fn resolve_expression(&self, body: &str) -> Result<Json> {
        let ast = eval::parse(body)?;
        let bindings = self.bindings.borrow();
        Ok(eval::eval(&ast, &bindings)?)
    }

    /// Fetches a resource's live object from the cluster and merges it into the bindings, so
    /// subsequent lookups (including the one currently in progress) see it.
    #[instrument(skip(self))]
    async fn ensure_live(&self, id: &ResourceId) -> Result<()> {
        let Some(client) = self.client.clone() else {
            return Err(Error::ReferenceResolution {
                resource_id: id.clone(),
                field_path: FieldPath::root(),
                reason: "no cluster client available for a live read".to_string(),
            });
        };
        let (kind, api_version, name) = self.api_versions.get(id).cloned().ok_or_else(|| Error::ReferenceResolution {
            resource_id: id.clone(),
            field_path: FieldPath::root(),
            reason: candidate_hint(&self.api_versions, id),
        })?;
        let api = crate::util::dynamic_api(client, &self.namespace, &api_version, &kind).map_err(|_| {
            Error::ReferenceResolution {
                resource_id: id.clone(),
                field_path: FieldPath::root(),
                reason: format!("malformed apiVersion/kind: {api_version}/{kind}"),
            }
        })?;
        trace!(%kind, %name, "live read for reference resolution");
        let obj = api.get(&name).await.map_err(|e| Error::from_kube(&kind, &name, e))?;
        let json = serde_json::to_value(&obj.data)?;
        self.bindings.borrow_mut().insert(id.clone(), json);
        Ok(())
    }
}

fn candidate_hint(known: &HashMap<ResourceId, (String, String, String)>, missing: &ResourceId) -> String {
    let candidates: Vec<String> = known.keys().map(ToString::to_string).collect();
    format!("unknown resource id {missing:?}; known ids: [{}]", candidates.join(", "))
}

/// Extracts a dotted/indexed field path from a plain JSON value.
pub(crate) fn extract_path(root: &Json, path: &FieldPath) -> Option<Json> {
    let mut current = root;
    for seg in path.segments() {
        current = match seg {
            PathSegment::Field(name) => current.get(name)?,
            PathSegment::Index(i) => current.get(i)?,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::TypeTag;
    use serde_json::json;

    fn resolver_with(bindings: Vec<(ResourceId, Json)>) -> Resolver {
        let deployed = IndexMap::new();
        let mut r = Resolver::new(json!({}), &deployed, "default", None);
        for (id, v) in bindings {
            r.bindings.borrow_mut().insert(id, v);
        }
        r
    }

    #[tokio::test]
    async fn resolves_concrete_reference() {
        let r = resolver_with(vec![(ResourceId::from("db"), json!({"status": {"podIP": "10.0.0.5"}}))]);
        let reference = Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::String);
        let got = r.resolve_reference(&reference).await.unwrap();
        assert_eq!(got, json!("10.0.0.5"));
    }

    #[tokio::test]
    async fn missing_field_without_client_errors() {
        let r = resolver_with(vec![(ResourceId::from("db"), json!({"status": {}}))]);
        let reference = Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::String);
        let err = r.resolve_reference(&reference).await.unwrap_err();
        assert!(matches!(err, Error::ReferenceResolution { .. }));
    }

    #[tokio::test]
    async fn resolve_value_preserves_container_shape() {
        let r = resolver_with(vec![(ResourceId::from("db"), json!({"status": {"podIP": "10.0.0.5"}}))]);
        let mut obj = indexmap::IndexMap::new();
        obj.insert("literal".to_string(), Value::Int(1));
        obj.insert(
            "ip".to_string(),
            Value::Ref(Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::String)),
        );
        let tree = Value::Object(obj);
        let resolved = r.resolve_value(&tree).await.unwrap();
        assert_eq!(resolved, json!({"literal": 1, "ip": "10.0.0.5"}));
    }

    #[tokio::test]
    async fn expression_evaluates_against_bindings() {
        let r = resolver_with(vec![(ResourceId::schema(), json!({"spec": {"port": 5432}}))]);
        let got = r.resolve_expression("schema.spec.port > 1024").await.unwrap();
        assert_eq!(got, json!(true));
    }
}

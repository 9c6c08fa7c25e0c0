//! The factory surface (component C9): two thin facades over the rest of the engine, one per
//! deployment mode, sharing a common trait for the four operations both modes support.
//!
//! Grounded on the teacher's split between distinct per-kind controllers (`clairs.rs`,
//! `indexers.rs`, `matchers.rs`) that share helper functions but are never unified into one
//! mode-parameterized type: here the two modes are `ClusterFactory` and `DirectFactory`, sharing
//! the [`Factory`] trait for `deploy`/`delete`/`list`/`get_status`, with mode-only operations
//! (`rollback`/`dry_run` on the direct side, the zero-arg `to_yaml()` on the cluster side) kept as
//! inherent methods so calling them on the wrong mode is a compile error, not a runtime one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api::{ResourceGraph, ResourceId};
use kube::api::{Api, DynamicObject};
use kube::Client;
use rgd_dialect::{ClusterDialect, SchemaDialect};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backoff::RetryPolicy;
use crate::deploy::{DeployFailure, DeployOptions, Deployer, Instance, RollbackOutcome};
use crate::progress::ProgressSink;
use crate::state::DeployedMap;
use crate::status::StatusValue;
use crate::{Error, Result};

/// The opaque "external orchestrator scope" of §6: an optional hook letting an embedder register
/// deployed resources under its own ownership bookkeeping. Semantics beyond method presence are
/// opaque to the engine — it only ever calls these four methods, never inspects what they do.
pub trait OrchestratorScope: Send + Sync {
    /// Registers (or overwrites) a value under `id` in the external scope.
    fn set(&self, id: &ResourceId, value: Json);
    /// Reads back a previously-registered value, if any.
    fn get(&self, id: &ResourceId) -> Option<Json>;
    /// Removes a previously-registered value.
    fn delete(&self, id: &ResourceId);
    /// Runs an arbitrary closure within the scope (e.g. a transaction boundary the embedder
    /// wants applies to happen inside).
    fn run(&self, f: Box<dyn FnOnce() + Send + '_>);
}

/// An in-memory [`OrchestratorScope`] good enough for embedders that just want `deploy`'s
/// bookkeeping mirrored somewhere they control, and for tests.
#[derive(Default)]
pub struct InMemoryOrchestratorScope {
    values: Mutex<HashMap<ResourceId, Json>>,
}

impl OrchestratorScope for InMemoryOrchestratorScope {
    fn set(&self, id: &ResourceId, value: Json) {
        self.values.lock().expect("orchestrator scope lock poisoned").insert(id.clone(), value);
    }

    fn get(&self, id: &ResourceId) -> Option<Json> {
        self.values.lock().expect("orchestrator scope lock poisoned").get(id).cloned()
    }

    fn delete(&self, id: &ResourceId) {
        self.values.lock().expect("orchestrator scope lock poisoned").remove(id);
    }

    fn run(&self, f: Box<dyn FnOnce() + Send + '_>) {
        f();
    }
}

/// Tunables shared by both factory modes (§4.9): namespace, timeouts, readiness-wait toggle,
/// retry policy, progress callback, and an optional external orchestrator scope.
#[derive(Clone)]
pub struct FactoryOptions {
    /// Namespace instances are addressed (and, in direct mode, applied) into.
    pub namespace: String,
    /// Field manager name stamped on server-side applies/patches.
    pub field_manager: String,
    /// Maximum resources within one dependency level applied concurrently (direct mode only).
    pub parallelism: usize,
    /// Whether direct-mode deploys wait for readiness before returning.
    pub readiness_wait: bool,
    /// Per-resource readiness wait timeout (direct mode only).
    pub readiness_timeout: Duration,
    /// Interval between readiness polls (direct mode only).
    pub readiness_poll_interval: Duration,
    /// Retry policy for apply conflicts and transient errors (direct mode only).
    pub retry: RetryPolicy,
    /// Progress sink, invoked from whichever task produced the event.
    pub progress: ProgressSink,
    /// An optional external orchestrator scope; when present, both factories register deployed
    /// instances under it in addition to their own bookkeeping.
    pub orchestrator: Option<Arc<dyn OrchestratorScope>>,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        FactoryOptions {
            namespace: "default".to_string(),
            field_manager: "resource-graph-engine".to_string(),
            parallelism: 4,
            readiness_wait: true,
            readiness_timeout: Duration::from_secs(120),
            readiness_poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            progress: crate::progress::noop_sink(),
            orchestrator: None,
        }
    }
}

impl FactoryOptions {
    fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            namespace: self.namespace.clone(),
            field_manager: self.field_manager.clone(),
            parallelism: self.parallelism,
            retry: self.retry.clone(),
            readiness_wait: self.readiness_wait,
            readiness_timeout: self.readiness_timeout,
            readiness_poll_interval: self.readiness_poll_interval,
            progress: self.progress.clone(),
        }
    }
}

/// The four operations common to both factory modes (§4.9).
pub trait Factory {
    /// Deploys an instance of the graph against `spec`.
    async fn deploy(&self, spec: Json, cancel: CancellationToken) -> Result<DeployedMap>;
    /// Deletes a previously deployed instance by its cluster-side name.
    async fn delete(&self, name: &str) -> Result<()>;
    /// Lists instance names known to this factory's backing store.
    async fn list(&self) -> Result<Vec<String>>;
    /// Fetches the hydrated aggregate status of a deployed instance.
    async fn get_status(&self, name: &str) -> Result<StatusValue>;
}

/// Cluster-side factory: hands deployment off to an external controller by submitting the
/// cluster's `ResourceGraphDefinition` instance document rather than applying anything itself.
pub struct ClusterFactory {
    client: Client,
    graph: ResourceGraph,
    dialect: ClusterDialect,
    options: FactoryOptions,
}

impl ClusterFactory {
    pub(crate) fn new(client: Client, graph: ResourceGraph, options: FactoryOptions) -> Self {
        ClusterFactory {
            client,
            graph,
            dialect: ClusterDialect,
            options,
        }
    }

    /// Emits the `ResourceGraphDefinition` document describing the whole graph (no instance
    /// spec involved) — the zero-argument form of §4.9's `toYaml()`.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(self.dialect.to_yaml(&self.graph)?)
    }

    /// Emits a single instance document for `spec`, referencing the graph's own `kind` — the
    /// one-argument form of §4.9's `toYaml(spec)`.
    pub fn to_instance_yaml(&self, spec: &Json) -> Result<String> {
        let doc = serde_json::json!({
            "apiVersion": self.graph.schema.api_version,
            "kind": self.graph.schema.kind,
            "spec": spec,
        });
        Ok(serde_yaml::to_string(&doc)?)
    }

    fn instance_api(&self) -> Result<Api<DynamicObject>> {
        crate::util::dynamic_api(self.client.clone(), &self.options.namespace, &self.graph.schema.api_version, &self.graph.schema.kind)
    }
}

impl Factory for ClusterFactory {
    /// Submits the instance document and returns immediately; the cluster controller owns
    /// execution from here. The engine never creates the graph's underlying resources in this
    /// mode, so the returned map is always empty — callers that need live state should watch the
    /// instance's own status via [`Factory::get_status`].
    #[instrument(skip(self, spec, cancel), fields(kind = %self.graph.schema.kind))]
    async fn deploy(&self, spec: Json, cancel: CancellationToken) -> Result<DeployedMap> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let name = spec.get("name").and_then(Json::as_str).map(str::to_string).unwrap_or_else(|| self.graph.schema.kind.to_lowercase());
        let manifest = serde_json::json!({
            "apiVersion": self.graph.schema.api_version,
            "kind": self.graph.schema.kind,
            "metadata": { "name": name },
            "spec": spec,
        });
        let api = self.instance_api()?;
        crate::util::apply(&api, &name, &self.options.field_manager, manifest).await?;
        if let Some(scope) = &self.options.orchestrator {
            scope.set(&ResourceId::from(name.as_str()), Json::Bool(true));
        }
        (self.options.progress)(crate::progress::ProgressEvent::progress(format!("submitted instance {name}")));
        Ok(DeployedMap::new())
    }

    #[instrument(skip(self), fields(name = %name))]
    async fn delete(&self, name: &str) -> Result<()> {
        let api = self.instance_api()?;
        crate::util::delete_idempotent(&api, name).await?;
        if let Some(scope) = &self.options.orchestrator {
            scope.delete(&ResourceId::from(name));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let api = self.instance_api()?;
        let list = api.list(&Default::default()).await.map_err(|e| Error::from_kube(&self.graph.schema.kind, "*", e))?;
        Ok(list.items.into_iter().filter_map(|obj| obj.metadata.name).collect())
    }

    #[instrument(skip(self), fields(name = %name))]
    async fn get_status(&self, name: &str) -> Result<StatusValue> {
        let api = self.instance_api()?;
        let obj = api.get(name).await.map_err(|e| Error::from_kube(&self.graph.schema.kind, name, e))?;
        let status = obj.data.get("status").cloned().unwrap_or(Json::Object(serde_json::Map::new()));
        match status {
            Json::Object(map) => Ok(map.into_iter().collect()),
            _ => Ok(StatusValue::new()),
        }
    }
}

/// Direct factory: runs C6's deployment engine itself, with no intervening cluster controller.
pub struct DirectFactory {
    client: Client,
    deployer: Deployer,
    graph: ResourceGraph,
    options: FactoryOptions,
    instances: Mutex<HashMap<String, DeployedMap>>,
    deferred: Vec<graph_builder::DeferredStep>,
}

impl DirectFactory {
    pub(crate) fn new(client: Client, graph: ResourceGraph, options: FactoryOptions) -> Self {
        Self::with_deferred(client, graph, Vec::new(), options)
    }

    /// Builds a direct factory that also runs a [`Composer`](graph_builder::Composer)'s deferred
    /// post-apply steps, in registration order, once a `deploy` call's resources are all deployed
    /// and its status is hydrated (§4.10).
    pub(crate) fn with_deferred(
        client: Client,
        graph: ResourceGraph,
        deferred: Vec<graph_builder::DeferredStep>,
        options: FactoryOptions,
    ) -> Self {
        let deployer = Deployer::new(client.clone(), options.deploy_options());
        DirectFactory {
            client,
            deployer,
            graph,
            options,
            instances: Mutex::new(HashMap::new()),
            deferred,
        }
    }

    fn instance_name(spec: &Json, fallback: &str) -> String {
        spec.get("name").and_then(Json::as_str).map(str::to_string).unwrap_or_else(|| fallback.to_string())
    }

    /// Materializes the manifests a [`DirectFactory::deploy`] call would apply, without
    /// contacting the cluster — the direct-mode form of §4.9's `toYaml(spec)`, emitting the raw
    /// manifests rather than a `ResourceGraphDefinition` wrapper.
    pub fn dry_run(&self, spec: &Json) -> Result<Vec<(ResourceId, Json)>> {
        self.deployer.dry_run(&self.graph, spec)
    }

    /// Rolls back a previously deployed instance, reversing applies in strict reverse
    /// topological order.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn rollback(&self, name: &str) -> Result<Vec<RollbackOutcome>> {
        let deployed = {
            let instances = self.instances.lock().expect("factory instance map lock poisoned");
            instances.get(name).cloned().ok_or_else(|| Error::NotFound {
                kind: self.graph.schema.kind.clone(),
                name: name.to_string(),
            })?
        };
        let dag = graph_builder::DependencyGraph::build(&self.graph.resources)?;
        let outcomes = self.deployer.rollback(&dag, &deployed).await;
        if outcomes.iter().all(|o| o.result.is_ok()) {
            self.instances.lock().expect("factory instance map lock poisoned").remove(name);
        }
        Ok(outcomes)
    }
}

impl Factory for DirectFactory {
    /// Runs C6 end-to-end and remembers the resulting deployed map under the spec's `name` (or
    /// the graph's kind, lowercased, if none was supplied) for later `delete`/`get_status`/
    /// `rollback` calls.
    #[instrument(skip(self, spec, cancel), fields(kind = %self.graph.schema.kind))]
    async fn deploy(&self, spec: Json, cancel: CancellationToken) -> Result<DeployedMap> {
        let name = Self::instance_name(&spec, &self.graph.schema.kind.to_lowercase());
        let instance = self
            .deployer
            .deploy(&self.graph, spec, cancel, &self.deferred)
            .await
            .map_err(|failure: DeployFailure| failure.cause)?;
        if let Some(scope) = &self.options.orchestrator {
            scope.set(&ResourceId::from(name.as_str()), serde_json::to_value(&instance.status).unwrap_or(Json::Null));
        }
        let Instance { deployed, .. } = instance;
        self.instances.lock().expect("factory instance map lock poisoned").insert(name, deployed.clone());
        Ok(deployed)
    }

    /// Deletes every resource of the named instance via a best-effort rollback and forgets it.
    #[instrument(skip(self), fields(name = %name))]
    async fn delete(&self, name: &str) -> Result<()> {
        let outcomes = self.rollback(name).await?;
        if let Some(failed) = outcomes.into_iter().find(|o| o.result.is_err()) {
            return failed.result;
        }
        if let Some(scope) = &self.options.orchestrator {
            scope.delete(&ResourceId::from(name));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.instances.lock().expect("factory instance map lock poisoned").keys().cloned().collect())
    }

    #[instrument(skip(self), fields(name = %name))]
    async fn get_status(&self, name: &str) -> Result<StatusValue> {
        let deployed = {
            let instances = self.instances.lock().expect("factory instance map lock poisoned");
            instances.get(name).cloned().ok_or_else(|| Error::NotFound {
                kind: self.graph.schema.kind.clone(),
                name: name.to_string(),
            })?
        };
        let hydrator = crate::status::Hydrator::new(Some(self.client.clone()), self.options.namespace.clone(), self.options.field_manager.clone());
        Ok(hydrator.hydrate(&self.graph, &deployed).await)
    }
}

/// Extension trait constructing factories from a built graph; the two construction paths named
/// in §4.9 (`into_cluster_factory`/`into_direct_factory`), both taking the same [`FactoryOptions`].
pub trait IntoFactory {
    /// Builds a [`ClusterFactory`] that hands deployment off to an external cluster controller.
    fn into_cluster_factory(self, client: Client, options: FactoryOptions) -> ClusterFactory;
    /// Builds a [`DirectFactory`] that runs C6's deployment engine directly.
    fn into_direct_factory(self, client: Client, options: FactoryOptions) -> DirectFactory;
}

impl IntoFactory for ResourceGraph {
    fn into_cluster_factory(self, client: Client, options: FactoryOptions) -> ClusterFactory {
        ClusterFactory::new(client, self, options)
    }

    fn into_direct_factory(self, client: Client, options: FactoryOptions) -> DirectFactory {
        DirectFactory::new(client, self, options)
    }
}

/// Builds factories from the pair [`graph_builder::compose::build_graph`] returns, so a
/// composition context's deferred steps survive into the direct factory that runs them. Cluster
/// mode hands deployment off to an external controller entirely, so the deferred steps (which
/// this process would run locally) have no counterpart there and are discarded.
impl IntoFactory for (ResourceGraph, Vec<graph_builder::DeferredStep>) {
    fn into_cluster_factory(self, client: Client, options: FactoryOptions) -> ClusterFactory {
        ClusterFactory::new(client, self.0, options)
    }

    fn into_direct_factory(self, client: Client, options: FactoryOptions) -> DirectFactory {
        DirectFactory::with_deferred(client, self.0, self.1, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{Schema, Value};
    use indexmap::IndexMap;

    fn empty_graph() -> ResourceGraph {
        ResourceGraph {
            resources: IndexMap::new(),
            schema: Schema {
                api_version: "example.com/v1alpha1".into(),
                kind: "Widget".into(),
                spec: Value::Null,
                status: Value::Null,
            },
            status: Arc::new(|_s, _r| Value::Object(IndexMap::new())),
        }
    }

    #[test]
    fn orchestrator_scope_roundtrips() {
        let scope = InMemoryOrchestratorScope::default();
        let id = ResourceId::from("widget-a");
        assert!(scope.get(&id).is_none());
        scope.set(&id, Json::Bool(true));
        assert_eq!(scope.get(&id), Some(Json::Bool(true)));
        scope.delete(&id);
        assert!(scope.get(&id).is_none());
    }

    #[test]
    fn factory_options_defaults_have_no_orchestrator() {
        let options = FactoryOptions::default();
        assert!(options.orchestrator.is_none());
        assert!(options.readiness_wait);
    }

    #[test]
    fn cluster_factory_to_yaml_emits_graph_definition() {
        let graph = empty_graph();
        let dialect = ClusterDialect;
        let yaml = dialect.to_yaml(&graph).unwrap();
        assert!(yaml.contains("ResourceGraphDefinition"));
    }
}

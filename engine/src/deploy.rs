//! The direct-mode deployment engine (component C6): materializes a graph against a concrete
//! spec, applies it level by level with bounded parallelism, gates on readiness, hydrates status,
//! and rolls back on unrecoverable failure.

use std::sync::Arc;
use std::time::Duration;

use api::{DeployedStatus, ReadinessPredicate, ResourceGraph, ResourceId, Value};
use graph_builder::DependencyGraph;
use indexmap::IndexMap;
use kube::Client;
use serde_json::Value as Json;
use thiserror::Error as ThisError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::backoff::{self, RetryPolicy};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::resolve::Resolver;
use crate::state::{DeployedMap, DeployedRecord};
use crate::status::{Hydrator, StatusValue};
use crate::{Error, Result};

/// Tunables for a single [`Deployer`], shared across every `deploy`/`dry_run`/`rollback` call it
/// performs.
#[derive(Clone)]
pub struct DeployOptions {
    /// Namespace resources are applied into when their manifest doesn't specify one.
    pub namespace: String,
    /// The field manager name stamped on every server-side apply.
    pub field_manager: String,
    /// Maximum number of resources within a single level applied concurrently.
    pub parallelism: usize,
    /// Retry policy for apply conflicts and transient errors.
    pub retry: RetryPolicy,
    /// Whether to wait for each applied resource's readiness predicate before moving on.
    pub readiness_wait: bool,
    /// Per-resource readiness wait timeout.
    pub readiness_timeout: Duration,
    /// Interval between readiness polls.
    pub readiness_poll_interval: Duration,
    /// Progress sink, invoked from whichever task produced the event.
    pub progress: ProgressSink,
}

impl Default for DeployOptions {
    fn default() -> Self {
        DeployOptions {
            namespace: "default".to_string(),
            field_manager: "resource-graph-engine".to_string(),
            parallelism: 4,
            retry: RetryPolicy::default(),
            readiness_wait: true,
            readiness_timeout: Duration::from_secs(120),
            readiness_poll_interval: Duration::from_secs(2),
            progress: crate::progress::noop_sink(),
        }
    }
}

/// The result of a completed deployment: every resource's final record plus the hydrated
/// aggregate status.
#[derive(Debug)]
pub struct Instance {
    /// Per-resource deployment records, in dependency (topological) order.
    pub deployed: DeployedMap,
    /// The hydrated aggregate status.
    pub status: StatusValue,
}

/// One resource's outcome during a best-effort rollback.
#[derive(Debug)]
pub struct RollbackOutcome {
    /// The resource's graph-internal id.
    pub id: ResourceId,
    /// `Ok` if the delete succeeded or the resource was already gone.
    pub result: Result<()>,
}

/// Returned when [`Deployer::deploy`] fails: the terminal cause plus the best-effort outcome of
/// rolling back whatever had already been applied.
#[derive(Debug, ThisError)]
#[error("deployment failed: {cause}")]
pub struct DeployFailure {
    /// The error that aborted the deployment.
    #[source]
    pub cause: Error,
    /// Per-resource rollback outcomes, in rollback (reverse topological) order.
    pub rollback: Vec<RollbackOutcome>,
}

/// Applies and manages a [`ResourceGraph`] directly against a cluster.
///
/// Generic over nothing — resources are untyped `DynamicObject`s applied via `crate::util::apply`,
/// the same shape as the teacher's `check_owned_resource<T, R, B>` but parameterized at the value
/// level (a `kind`/`apiVersion` pair) instead of at the type level, since the engine never knows
/// resource kinds until a graph is built at runtime.
pub struct Deployer {
    client: Client,
    options: DeployOptions,
}

impl Deployer {
    /// Builds a deployer against a live cluster client.
    pub fn new(client: Client, options: DeployOptions) -> Self {
        Deployer { client, options }
    }

    /// Runs C6 end-to-end: materialize, order, apply each level, gate on readiness, hydrate
    /// status, then run `deferred` (the composition context's post-apply steps, §4.10) in
    /// registration order. On unrecoverable error, rolls back everything applied so far in
    /// reverse topological order and returns [`DeployFailure`]; `deferred` never runs in that case.
    #[instrument(skip(self, graph, spec, cancel, deferred))]
    pub async fn deploy(
        &self,
        graph: &ResourceGraph,
        spec: Json,
        cancel: CancellationToken,
        deferred: &[graph_builder::DeferredStep],
    ) -> std::result::Result<Instance, DeployFailure> {
        let dag = match DependencyGraph::build(&graph.resources) {
            Ok(dag) => dag,
            Err(e) => {
                return Err(DeployFailure {
                    cause: Error::Graph(e),
                    rollback: Vec::new(),
                })
            }
        };
        let levels = dag.levels();
        let schema_instance = Json::Object(serde_json::Map::from_iter([("spec".to_string(), spec), ("status".to_string(), Json::Null)]));

        let mut deployed: DeployedMap = DeployedMap::new();
        let mut applied_order: Vec<ResourceId> = Vec::new();

        for level in &levels {
            if cancel.is_cancelled() {
                return Err(self.fail(&dag, deployed, applied_order, Error::Cancelled).await);
            }
            let resolver = Arc::new(Resolver::new(schema_instance.clone(), &deployed, self.options.namespace.clone(), Some(self.client.clone())));
            let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
            let mut set = tokio::task::JoinSet::new();

            for id in level {
                let entry = graph.resources[id].clone();
                let resolver = Arc::clone(&resolver);
                let semaphore = Arc::clone(&semaphore);
                let client = self.client.clone();
                let options = self.options.clone();
                let cancel = cancel.clone();
                set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                    let id = entry.id.clone();
                    match apply_one(client, &entry, &resolver, &options, cancel).await {
                        Ok(record) => (id, Ok(record)),
                        Err(failure) => (id, Err(failure)),
                    }
                });
            }

            let mut level_failure: Option<Error> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((id, Ok(record))) => {
                        applied_order.push(id.clone());
                        deployed.insert(id, record);
                    }
                    Ok((id, Err(ApplyOneFailure { record, error }))) => {
                        // Even on failure, a resource that was actually created on the cluster
                        // (e.g. readiness timed out after a successful apply) must still be
                        // reachable by rollback.
                        if let Some(record) = record {
                            applied_order.push(id.clone());
                            deployed.insert(id, record);
                        }
                        level_failure.get_or_insert(error);
                    }
                    Err(join_err) => {
                        level_failure.get_or_insert(Error::Tokio(join_err));
                    }
                }
            }

            if let Some(err) = level_failure {
                return Err(self.fail(&dag, deployed, applied_order, err).await);
            }
        }

        let hydrator = Hydrator::new(Some(self.client.clone()), self.options.namespace.clone(), self.options.field_manager.clone());
        let status = hydrator.hydrate(graph, &deployed).await;

        for step in deferred {
            if cancel.is_cancelled() {
                break;
            }
            (step.run)();
            (self.options.progress)(ProgressEvent::progress(format!("ran deferred step {}", step.id)));
        }

        (self.options.progress)(ProgressEvent::progress("deployment complete"));
        Ok(Instance { deployed, status })
    }

    /// Materializes the manifests a [`Deployer::deploy`] call would apply, without contacting the
    /// cluster: schema references are substituted from `spec`; references to other resources
    /// (which don't exist yet in a dry run) are left as `${...}` tokens, matching the cluster-side
    /// dialect so a caller can eyeball what would be sent.
    pub fn dry_run(&self, graph: &ResourceGraph, spec: &Json) -> Result<Vec<(ResourceId, Json)>> {
        let dag = DependencyGraph::build(&graph.resources)?;
        let schema_instance = Json::Object(serde_json::Map::from_iter([("spec".to_string(), spec.clone()), ("status".to_string(), Json::Null)]));
        let mut out = Vec::new();
        for id in dag.topological_order() {
            let entry = &graph.resources[&id];
            out.push((id, materialize_dry_run(&entry.manifest, &schema_instance)));
        }
        Ok(out)
    }

    /// Deletes every resource in `deployed` in reverse topological (rollback) order, best-effort:
    /// a failure deleting one resource does not stop the rest from being attempted.
    pub async fn rollback(&self, dag: &DependencyGraph, deployed: &DeployedMap) -> Vec<RollbackOutcome> {
        let mut outcomes = Vec::new();
        for id in dag.rollback_order() {
            let Some(record) = deployed.get(&id) else { continue };
            let result = self.delete_record(record).await;
            if let Err(e) = &result {
                warn!(%id, %e, "rollback delete failed");
            }
            metrics::counter!("resource_graph_engine_resources_rolled_back_total", "kind" => record.kind.clone()).increment(1);
            outcomes.push(RollbackOutcome { id, result });
        }
        outcomes
    }

    async fn delete_record(&self, record: &DeployedRecord) -> Result<()> {
        let api = crate::util::dynamic_api(self.client.clone(), record.namespace.as_deref().unwrap_or(&self.options.namespace), &record.api_version, &record.kind)?;
        crate::util::delete_idempotent(&api, &record.name).await
    }

    async fn fail(&self, dag: &DependencyGraph, deployed: DeployedMap, _applied_order: Vec<ResourceId>, cause: Error) -> DeployFailure {
        (self.options.progress)(ProgressEvent::error(format!("deployment aborted: {cause}")));
        let rollback = self.rollback(dag, &deployed).await;
        DeployFailure { cause, rollback }
    }
}

/// The outcome of a failed [`apply_one`]: the error, plus the partially-built record when the
/// resource was actually created on the cluster before the failure (e.g. a readiness timeout) —
/// such a record must still reach rollback, since the object it describes really exists.
struct ApplyOneFailure {
    record: Option<DeployedRecord>,
    error: Error,
}

/// Applies, then (if enabled) waits for readiness of, a single resource.
async fn apply_one(
    client: Client,
    entry: &api::ResourceEntry,
    resolver: &Resolver,
    options: &DeployOptions,
    cancel: CancellationToken,
) -> std::result::Result<DeployedRecord, ApplyOneFailure> {
    let manifest = resolver
        .resolve_value(&entry.manifest)
        .await
        .map_err(|error| ApplyOneFailure { record: None, error })?;
    let (name, namespace) = extract_identity(&manifest, &options.namespace);
    let api = crate::util::dynamic_api(client.clone(), &namespace, &entry.api_version, &entry.kind)
        .map_err(|error| ApplyOneFailure { record: None, error })?;

    let mut attempt = 0u32;
    let mut rng = rand::thread_rng();
    let live = loop {
        if cancel.is_cancelled() {
            return Err(ApplyOneFailure { record: None, error: Error::Cancelled });
        }
        match crate::util::apply(&api, &name, &options.field_manager, manifest.clone()).await {
            Ok(obj) => break obj,
            Err(e) if e.is_retryable() && attempt < options.retry.max_retries => {
                attempt = attempt.saturating_add(1);
                warn!(kind = %entry.kind, %name, attempt, %e, "apply failed, retrying");
                tokio::time::sleep(backoff::retry_delay(&options.retry, attempt, &mut rng)).await;
            }
            Err(e) => return Err(ApplyOneFailure { record: None, error: e }),
        }
    };

    metrics::counter!("resource_graph_engine_resources_applied_total", "kind" => entry.kind.clone()).increment(1);
    (options.progress)(ProgressEvent::progress(format!("applied {}/{}", entry.kind, name)).with_resource(&entry.id, &entry.kind, Some(&namespace), &name));

    let now = chrono::Utc::now();
    let mut record = DeployedRecord {
        id: entry.id.clone(),
        kind: entry.kind.clone(),
        api_version: entry.api_version.clone(),
        name: name.clone(),
        namespace: Some(namespace.clone()),
        live: live.data.clone(),
        status: DeployedStatus::Pending,
        created_at: now,
        updated_at: now,
    };

    if options.readiness_wait {
        let predicate = entry.readiness.clone().unwrap_or_else(default_readiness);
        match wait_ready(&api, &name, &predicate, options.readiness_timeout, options.readiness_poll_interval, &cancel).await {
            Ok(live) => {
                record.live = live;
                record.status = DeployedStatus::Deployed;
                record.updated_at = chrono::Utc::now();
                (options.progress)(ProgressEvent::ready(&entry.id, &entry.kind, Some(&namespace), &name));
            }
            Err(e) => {
                record.status = DeployedStatus::Failed;
                record.updated_at = chrono::Utc::now();
                return Err(ApplyOneFailure { record: Some(record), error: e });
            }
        }
    } else {
        record.status = DeployedStatus::Deployed;
    }

    Ok(record)
}

/// The default readiness predicate: the object exists (always true here — this runs only once the
/// object has already been fetched) and its status doesn't carry an obvious error condition.
fn default_readiness() -> ReadinessPredicate {
    Arc::new(|live: &Json| {
        let Some(status) = live.get("status") else {
            return true;
        };
        if let Some(conditions) = status.get("conditions").and_then(Json::as_array) {
            let has_failure = conditions.iter().any(|c| {
                c.get("type").and_then(Json::as_str) == Some("Failed") && c.get("status").and_then(Json::as_str) == Some("True")
            });
            if has_failure {
                return false;
            }
        }
        if let (Some(desired), Some(ready)) = (
            status.get("replicas").and_then(Json::as_i64),
            status.get("readyReplicas").and_then(Json::as_i64),
        ) {
            return ready >= desired;
        }
        true
    })
}

async fn wait_ready(
    api: &kube::api::Api<kube::api::DynamicObject>,
    name: &str,
    predicate: &ReadinessPredicate,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<Json> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let obj = api.get(name).await.map_err(|e| Error::from_kube("resource", name, e))?;
        let live = obj.data.clone();
        if predicate(&live) {
            return Ok(live);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::ReadinessTimeout(ResourceId::from(name)));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Pulls `metadata.name`/`metadata.namespace` out of a resolved manifest, falling back to the
/// deployer's configured namespace when the manifest doesn't specify one.
fn extract_identity(manifest: &Json, default_namespace: &str) -> (String, String) {
    let name = manifest.pointer("/metadata/name").and_then(Json::as_str).unwrap_or_default().to_string();
    let namespace = manifest
        .pointer("/metadata/namespace")
        .and_then(Json::as_str)
        .unwrap_or(default_namespace)
        .to_string();
    (name, namespace)
}

fn materialize_dry_run(value: &Value, schema_instance: &Json) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::String(s) => Json::String(s.clone()),
        Value::Array(items) => Json::Array(items.iter().map(|v| materialize_dry_run(v, schema_instance)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), materialize_dry_run(v, schema_instance));
            }
            Json::Object(out)
        }
        Value::Ref(r) if r.is_schema() => crate::resolve::extract_path(schema_instance, &r.field_path).unwrap_or(Json::Null),
        Value::Expr(e) if e.refs.iter().all(|r| r.is_schema()) => {
            let mut bindings = crate::eval::Bindings::new();
            bindings.insert(api::ResourceId::schema(), schema_instance.clone());
            crate::eval::parse(&e.body)
                .and_then(|ast| crate::eval::eval(&ast, &bindings))
                .unwrap_or_else(|_| rgd_dialect::expr::render_value(value))
        }
        Value::Ref(_) | Value::Expr(_) => rgd_dialect::expr::render_value(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{Reference, Schema, TypeTag};
    use indexmap::IndexMap as Map;
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn sample_graph() -> ResourceGraph {
        let mut resources = Map::new();
        let mut manifest = Map::new();
        manifest.insert("metadata".to_string(), Value::Object(Map::from([("name".to_string(), Value::String("postgres".into()))])));
        manifest.insert(
            "spec".to_string(),
            Value::Object(Map::from([(
                "host".to_string(),
                Value::Ref(Reference::schema("spec.host".parse().unwrap(), TypeTag::String)),
            )])),
        );
        resources.insert(
            ResourceId::from("deploymentPostgres"),
            api::ResourceEntry {
                id: ResourceId::from("deploymentPostgres"),
                kind: "Deployment".into(),
                api_version: "apps/v1".into(),
                manifest: Value::Object(manifest),
                readiness: None,
            },
        );
        ResourceGraph {
            resources,
            schema: Schema {
                api_version: "example.com/v1alpha1".into(),
                kind: "Widget".into(),
                spec: Value::Null,
                status: Value::Null,
            },
            status: StdArc::new(|_s, _r| Value::Null),
        }
    }

    #[test]
    fn dry_run_substitutes_schema_references() {
        let deployer_options = DeployOptions::default();
        let graph = sample_graph();
        let dag = DependencyGraph::build(&graph.resources).unwrap();
        let schema_instance = json!({"spec": {"host": "db.local"}, "status": null});
        let rendered: Vec<(ResourceId, Json)> = dag
            .topological_order()
            .into_iter()
            .map(|id| {
                let entry = &graph.resources[&id];
                (id, materialize_dry_run(&entry.manifest, &schema_instance))
            })
            .collect();
        let (_, manifest) = &rendered[0];
        assert_eq!(manifest["spec"]["host"], json!("db.local"));
        let _ = deployer_options;
    }

    #[test]
    fn dry_run_renders_resource_references_as_tokens() {
        let mut manifest = Map::new();
        manifest.insert(
            "env".to_string(),
            Value::Ref(Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::String)),
        );
        let value = Value::Object(manifest);
        let schema_instance = json!({"spec": {}, "status": null});
        let rendered = materialize_dry_run(&value, &schema_instance);
        assert_eq!(rendered["env"], json!("${db.status.podIP}"));
    }

    #[test]
    fn extract_identity_falls_back_to_default_namespace() {
        let manifest = json!({"metadata": {"name": "web"}});
        let (name, ns) = extract_identity(&manifest, "default");
        assert_eq!(name, "web");
        assert_eq!(ns, "default");
    }

    #[test]
    fn extract_identity_prefers_manifest_namespace() {
        let manifest = json!({"metadata": {"name": "web", "namespace": "prod"}});
        let (name, ns) = extract_identity(&manifest, "default");
        assert_eq!(name, "web");
        assert_eq!(ns, "prod");
    }

    #[test]
    fn default_readiness_accepts_object_with_no_status() {
        let predicate = default_readiness();
        assert!(predicate(&json!({"metadata": {"name": "x"}})));
    }

    #[test]
    fn default_readiness_checks_ready_replicas() {
        let predicate = default_readiness();
        assert!(!predicate(&json!({"status": {"replicas": 3, "readyReplicas": 1}})));
        assert!(predicate(&json!({"status": {"replicas": 3, "readyReplicas": 3}})));
    }
}

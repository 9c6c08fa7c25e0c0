//! Test-only harness for exercising this crate's cluster-facing code without a live cluster:
//! a mock `kube::Client` paired with a scenario-driven verifier, grounded on the teacher's
//! `ClairServerVerifier`/`tower_test::mock::pair` pattern but retargeted at arbitrary
//! `DynamicObject` manifests instead of one typed CRD, since this engine never knows resource
//! kinds until a graph is built at runtime.
#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::future::Future;

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use tower_test::mock::SendResponse;

pub use test_log::test;

/// Builds a mock `kube::Client` paired with a [`MockApiServer`] that drives its requests.
pub fn mock_client() -> (Client, MockApiServer) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");
    (client, MockApiServer::new(handle))
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// Waits up to one second for a scenario task to finish, the same bound the teacher's
/// `timeout_after_1s` uses so a missing expected call fails the test instead of hanging it.
pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario completed without errors")
}

/// Drives a sequence of expected requests against a mocked apiserver, keeping a small in-memory
/// object store so GET/apply/delete calls round-trip the way a real apiserver would.
///
/// Unlike the teacher's verifier (one method per typed CRD + operation pair), every handler here
/// takes the request path explicitly, since the engine only ever deals in `DynamicObject`s and
/// has no compile-time `R::plural()`/`R::api_version()` to derive paths from.
pub struct MockApiServer {
    handle: ApiServerHandle,
    state: BTreeMap<String, Value>,
}

impl MockApiServer {
    fn new(handle: ApiServerHandle) -> Self {
        MockApiServer {
            handle,
            state: BTreeMap::new(),
        }
    }

    #[inline]
    fn next_request(&mut self) -> impl Future<Output = Option<(Request<Body>, SendResponse<Response<Body>>)>> + '_ {
        self.handle.next_request()
    }

    /// Seeds the mock store with an object as if it had already been created, keyed by its full
    /// object path (e.g. `/api/v1/namespaces/default/configmaps/widget-config`).
    pub fn seed(&mut self, object_path: impl Into<String>, object: Value) {
        self.state.insert(object_path.into(), object);
    }

    /// Expects a GET for `object_path`; responds with the seeded object, or a 404 if there isn't
    /// one.
    pub async fn handle_get(&mut self, object_path: &str) {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        assert_eq!(*request.method(), Method::GET, "unexpected method for {uri}");
        assert!(uri.starts_with(object_path), "unexpected path: {uri}");
        let response = match self.state.get(object_path) {
            Some(v) => Response::builder().body(Body::from(serde_json::to_vec(v).unwrap())).unwrap(),
            None => not_found(object_path),
        };
        send.send_response(response);
    }

    /// Expects a server-side-apply PATCH (an existing object) or a create POST (a new one)
    /// against `collection_path`; responds with the object merged over whatever was already
    /// stored under `object_path`.
    pub async fn handle_apply(&mut self, collection_path: &str, object_path: &str) {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        let method = request.method().clone();
        assert!(matches!(method, Method::PATCH | Method::POST), "unexpected method for {uri}: {method}");
        assert!(uri.starts_with(collection_path), "unexpected path: {uri}");
        let req_body = request.into_body().collect_bytes().await.expect("request body readable");
        let obj: Value = serde_json::from_slice(&req_body).expect("object is json");
        let merged = self
            .state
            .entry(object_path.to_string())
            .and_modify(|stored| merge(stored, obj.clone()))
            .or_insert(obj)
            .clone();
        send.send_response(Response::builder().body(Body::from(serde_json::to_vec(&merged).unwrap())).unwrap());
    }

    /// Expects a status-subresource PATCH to `object_path`; responds with the merged object.
    pub async fn handle_status_patch(&mut self, object_path: &str) {
        let status_path = format!("{object_path}/status");
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        assert_eq!(*request.method(), Method::PATCH, "unexpected method for {uri}");
        assert!(uri.starts_with(&status_path), "unexpected path: {uri}");
        let req_body = request.into_body().collect_bytes().await.expect("request body readable");
        let patch: Value = serde_json::from_slice(&req_body).expect("status patch is json");
        let merged = self
            .state
            .entry(object_path.to_string())
            .and_modify(|stored| merge(stored, patch.clone()))
            .or_insert(patch)
            .clone();
        send.send_response(Response::builder().body(Body::from(serde_json::to_vec(&merged).unwrap())).unwrap());
    }

    /// Expects a DELETE for `object_path`; responds 200 and forgets the object, treating a
    /// missing one as already gone (mirrors the idempotent-delete contract of §7).
    pub async fn handle_delete(&mut self, object_path: &str) {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        assert_eq!(*request.method(), Method::DELETE, "unexpected method for {uri}");
        assert!(uri.starts_with(object_path), "unexpected path: {uri}");
        self.state.remove(object_path);
        let body = serde_json::to_vec(&json!({"status": "Success"})).unwrap();
        send.send_response(Response::builder().body(Body::from(body)).unwrap());
    }
}

/// Recursive JSON merge mirroring a Kubernetes strategic merge patch closely enough for test
/// fixtures: a `null` leaf deletes the key, anything else overwrites or merges recursively.
fn merge(a: &mut Value, b: Value) {
    if let Value::Object(a) = a {
        if let Value::Object(b) = b {
            for (k, v) in b {
                if v.is_null() {
                    a.remove(&k);
                } else {
                    merge(a.entry(k).or_insert(Value::Null), v);
                }
            }
            return;
        }
    }
    *a = b;
}

fn not_found(object_path: &str) -> Response<Body> {
    let err = json!({
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "message": format!("{object_path} not found"),
    });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(serde_json::to_vec(&err).unwrap()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{DeployOptions, Deployer};
    use api::{ResourceEntry, ResourceGraph, ResourceId, Schema, Value as GraphValue};
    use indexmap::IndexMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn single_resource_graph() -> ResourceGraph {
        let mut manifest = IndexMap::new();
        manifest.insert("apiVersion".to_string(), GraphValue::String("v1".into()));
        manifest.insert("kind".to_string(), GraphValue::String("ConfigMap".into()));
        manifest.insert(
            "metadata".to_string(),
            GraphValue::Object(IndexMap::from([("name".to_string(), GraphValue::String("widget-config".into()))])),
        );
        manifest.insert(
            "data".to_string(),
            GraphValue::Object(IndexMap::from([("key".to_string(), GraphValue::String("value".into()))])),
        );

        let mut resources = IndexMap::new();
        resources.insert(
            ResourceId::from("config"),
            ResourceEntry {
                id: ResourceId::from("config"),
                kind: "ConfigMap".into(),
                api_version: "v1".into(),
                manifest: GraphValue::Object(manifest),
                readiness: None,
            },
        );
        ResourceGraph {
            resources,
            schema: Schema {
                api_version: "example.com/v1alpha1".into(),
                kind: "Widget".into(),
                spec: GraphValue::Null,
                status: GraphValue::Null,
            },
            status: Arc::new(|_s, _r| GraphValue::Null),
        }
    }

    #[tokio::test]
    async fn deploy_applies_a_single_resource_against_the_mock_apiserver() {
        let (client, mut server) = mock_client();
        let scenario = tokio::spawn(async move {
            server.handle_get("/api/v1/namespaces/default/configmaps/widget-config").await;
            server.handle_apply("/api/v1/namespaces/default/configmaps", "/api/v1/namespaces/default/configmaps/widget-config").await;
        });

        let options = DeployOptions {
            readiness_wait: false,
            ..Default::default()
        };
        let deployer = Deployer::new(client, options);
        let graph = single_resource_graph();
        let instance = deployer.deploy(&graph, json!({}), CancellationToken::new(), &[]).await.expect("deploy succeeds");
        assert_eq!(instance.deployed.len(), 1);
        assert!(instance.deployed.contains_key(&ResourceId::from("config")));

        timeout_after_1s(scenario).await;
    }

    #[tokio::test]
    async fn rollback_deletes_every_deployed_resource() {
        let (client, mut server) = mock_client();
        let scenario = tokio::spawn(async move {
            server.handle_get("/api/v1/namespaces/default/configmaps/widget-config").await;
            server.handle_apply("/api/v1/namespaces/default/configmaps", "/api/v1/namespaces/default/configmaps/widget-config").await;
            server.handle_delete("/api/v1/namespaces/default/configmaps/widget-config").await;
        });

        let options = DeployOptions {
            readiness_wait: false,
            ..Default::default()
        };
        let deployer = Deployer::new(client, options);
        let graph = single_resource_graph();
        let cancel = CancellationToken::new();
        let instance = deployer.deploy(&graph, json!({}), cancel.clone(), &[]).await.expect("deploy succeeds");
        let dag = graph_builder::DependencyGraph::build(&graph.resources).unwrap();
        let outcomes = deployer.rollback(&dag, &instance.deployed).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());

        timeout_after_1s(scenario).await;
    }

    /// A resource whose apply succeeds but whose readiness predicate never passes must still be
    /// reachable by rollback: it was actually created on the cluster, so "deployment failed"
    /// cannot mean "we silently leaked an object".
    #[tokio::test]
    async fn readiness_timeout_still_rolls_back_the_created_resource() {
        let (client, mut server) = mock_client();
        let scenario = tokio::spawn(async move {
            server.handle_get("/api/v1/namespaces/default/configmaps/widget-config").await;
            server.handle_apply("/api/v1/namespaces/default/configmaps", "/api/v1/namespaces/default/configmaps/widget-config").await;
            // wait_ready's own poll, whose predicate never passes.
            server.handle_get("/api/v1/namespaces/default/configmaps/widget-config").await;
            server.handle_delete("/api/v1/namespaces/default/configmaps/widget-config").await;
        });

        let mut graph = single_resource_graph();
        graph.resources.get_mut(&ResourceId::from("config")).unwrap().readiness = Some(Arc::new(|_live| false));

        let options = DeployOptions {
            readiness_wait: true,
            readiness_timeout: std::time::Duration::ZERO,
            readiness_poll_interval: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let deployer = Deployer::new(client, options);
        let failure = deployer
            .deploy(&graph, json!({}), CancellationToken::new(), &[])
            .await
            .expect_err("readiness never passes, deploy must fail");
        assert_eq!(failure.rollback.len(), 1);
        assert_eq!(failure.rollback[0].id, ResourceId::from("config"));
        assert!(failure.rollback[0].result.is_ok(), "the created resource must be deleted during rollback");

        timeout_after_1s(scenario).await;
    }

    #[tokio::test]
    async fn deferred_steps_run_after_status_hydration() {
        let (client, mut server) = mock_client();
        let scenario = tokio::spawn(async move {
            server.handle_get("/api/v1/namespaces/default/configmaps/widget-config").await;
            server.handle_apply("/api/v1/namespaces/default/configmaps", "/api/v1/namespaces/default/configmaps/widget-config").await;
        });

        let options = DeployOptions {
            readiness_wait: false,
            ..Default::default()
        };
        let deployer = Deployer::new(client, options);
        let graph = single_resource_graph();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        let steps = vec![graph_builder::DeferredStep {
            id: ResourceId::from("notify"),
            run: Arc::new(move || ran_clone.store(true, std::sync::atomic::Ordering::SeqCst)),
        }];
        let instance = deployer.deploy(&graph, json!({}), CancellationToken::new(), &steps).await.expect("deploy succeeds");
        assert_eq!(instance.deployed.len(), 1);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst), "deferred step must run once resources are deployed");

        timeout_after_1s(scenario).await;
    }
}

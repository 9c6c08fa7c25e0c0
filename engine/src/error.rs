//! The error type shared by every component in this crate (§7 of the accompanying design
//! document): named error kinds rather than bare propagation, with a pure classification function
//! deciding which are retryable.

use api::{FieldPath, ResourceId};
use thiserror::Error;

/// Result alias using [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building, resolving, deploying, or monitoring a resource graph.
#[derive(Debug, Error)]
pub enum Error {
    /// A user-supplied spec failed a structural check before materialization.
    #[error("validation failed at {field_path}: {reason}")]
    Validation {
        /// The offending field.
        field_path: String,
        /// Why it failed, including an example of an acceptable value where useful.
        reason: String,
    },

    /// A [`api::Reference`] could not be resolved against the deployed-resource map.
    #[error("unresolvable reference {resource_id}.{field_path}: {reason}")]
    ReferenceResolution {
        /// The target resource id.
        resource_id: ResourceId,
        /// The field path inside it.
        field_path: FieldPath,
        /// Why resolution failed (resource not deployed, field missing, unknown id).
        reason: String,
    },

    /// Expression evaluation failed (component C4's evaluator).
    #[error("expression evaluation error: {0}")]
    Eval(#[from] crate::eval::EvalError),

    /// The dependency graph (or the document the graph builder assembled) is invalid.
    #[error(transparent)]
    Graph(#[from] graph_builder::Error),

    /// The data model crate reported an error (malformed field path, duplicate id).
    #[error(transparent)]
    Api(#[from] api::Error),

    /// Serialization to the cluster-side dialect failed.
    #[error(transparent)]
    Dialect(#[from] rgd_dialect::Error),

    /// A server-side update conflicted (HTTP 409); retried up to the caller's retry policy.
    #[error("conflict applying {kind}/{name}: {source}")]
    Conflict {
        /// The resource's kind.
        kind: String,
        /// The resource's name.
        name: String,
        /// The underlying client error.
        #[source]
        source: kube::Error,
    },

    /// HTTP 404; terminal for reads, ignored for idempotent deletes.
    #[error("{kind}/{name} not found")]
    NotFound {
        /// The resource's kind.
        kind: String,
        /// The resource's name.
        name: String,
    },

    /// A transient network condition (connection reset, timeout, 408/429/5xx); retryable.
    #[error("transient error: {0}")]
    Transient(#[source] kube::Error),

    /// HTTP 401/403; terminal.
    #[error("not authorized: {0}")]
    Authorization(#[source] kube::Error),

    /// HTTP 400/422 from the API server; terminal.
    #[error("server rejected request: {0}")]
    ServerValidation(#[source] kube::Error),

    /// A readiness wait or overall deployment timeout elapsed.
    #[error("timed out waiting for {0} to become ready")]
    ReadinessTimeout(ResourceId),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The dependency graph contains a cycle (surfaced again here so callers matching on
    /// `engine::Error` don't have to reach into `graph_builder::Error`).
    #[error("circular dependency: {}", cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))]
    CircularDependency {
        /// The ids forming the cycle.
        cycle: Vec<ResourceId>,
    },

    /// A watch could not be re-established after exhausting its reconnect budget. Monitoring for
    /// the affected `(kind, namespace)` is degraded but the deployment is not failed solely
    /// because of it.
    #[error("watch reconnection exhausted for {kind} in {namespace}")]
    ReconnectExhausted {
        /// The watched kind.
        kind: String,
        /// The watched namespace.
        namespace: String,
    },

    /// A status leaf's evaluated type didn't match its declared schema type; the leaf is omitted
    /// (left at its previous value) rather than failing the whole hydration.
    #[error("status field {field_path} expected {expected}, got {got}")]
    StatusBuilding {
        /// The field that mismatched.
        field_path: FieldPath,
        /// The declared type.
        expected: String,
        /// What was actually produced.
        got: String,
    },

    /// A generic `kube` client error not otherwise classified above.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML serialization failure.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// A spawned task panicked or was cancelled.
    #[error(transparent)]
    Tokio(#[from] tokio::task::JoinError),

    /// The `RUST_LOG`-style filter passed to [`crate::init_tracing`] failed to parse.
    #[error("tracing filter error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),

    /// Installing the global `tracing` subscriber failed (e.g. one was already installed).
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl Error {
    /// Classifies an error per §7's propagation policy: `true` means C6/C7 should retry locally
    /// under the caller's backoff policy; `false` means the current operation should abort and
    /// (for C6) trigger rollback.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::Transient(_))
    }

    /// Classifies a raw `kube::Error` from an API call into one of this crate's named kinds.
    /// Any error shape other than a structured `kube::Error::Api` response (dropped connections,
    /// hyper/service errors surfaced by the underlying transport) is treated as transient, since
    /// those are exactly the conditions §7 lists as retryable network failures.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Error {
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => Error::NotFound {
                    kind: kind.to_string(),
                    name: name.to_string(),
                },
                409 => Error::Conflict {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    source: err,
                },
                401 | 403 => Error::Authorization(err),
                400 | 422 => Error::ServerValidation(err),
                408 | 429 => Error::Transient(err),
                code if code >= 500 => Error::Transient(err),
                _ => Error::Kube(err),
            },
            _ => Error::Transient(err),
        }
    }
}

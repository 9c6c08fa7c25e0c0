//! The progress callback contract (§6): a thread-safe sink fed from whichever task produced the
//! event, never from a single owning thread.

use std::sync::Arc;

use api::ResourceId;

/// The kind of a [`ProgressEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressKind {
    /// Routine forward progress (a resource applied, a level completed).
    Progress,
    /// A resource or the whole deployment reached its ready state.
    Ready,
    /// Monitoring for some part of the deployment is degraded (e.g. a watch gave up
    /// reconnecting) but the deployment itself has not failed.
    Degraded,
    /// A terminal error occurred.
    Error,
}

/// One event delivered to a caller-supplied progress sink.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    /// The event kind.
    pub kind: ProgressKind,
    /// A human-readable message.
    pub message: String,
    /// The graph-internal id this event concerns, if any.
    pub resource_id: Option<ResourceId>,
    /// The Kubernetes kind this event concerns, if any.
    pub resource_kind: Option<String>,
    /// The namespace this event concerns, if any.
    pub namespace: Option<String>,
    /// The cluster-side name this event concerns, if any.
    pub name: Option<String>,
}

impl ProgressEvent {
    /// Builds a bare progress message with no resource context.
    pub fn progress(message: impl Into<String>) -> Self {
        ProgressEvent {
            kind: ProgressKind::Progress,
            message: message.into(),
            resource_id: None,
            resource_kind: None,
            namespace: None,
            name: None,
        }
    }

    /// Builds a ready event scoped to a single resource.
    pub fn ready(id: &ResourceId, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        ProgressEvent {
            kind: ProgressKind::Ready,
            message: format!("{kind}/{name} is ready"),
            resource_id: Some(id.clone()),
            resource_kind: Some(kind.to_string()),
            namespace: namespace.map(str::to_string),
            name: Some(name.to_string()),
        }
    }

    /// Builds a degraded-monitoring event.
    pub fn degraded(message: impl Into<String>) -> Self {
        ProgressEvent {
            kind: ProgressKind::Degraded,
            message: message.into(),
            resource_id: None,
            resource_kind: None,
            namespace: None,
            name: None,
        }
    }

    /// Builds an error event.
    pub fn error(message: impl Into<String>) -> Self {
        ProgressEvent {
            kind: ProgressKind::Error,
            message: message.into(),
            resource_id: None,
            resource_kind: None,
            namespace: None,
            name: None,
        }
    }

    /// Attaches resource context to an already-built event (builder-style, for events that start
    /// out bare like [`ProgressEvent::progress`]/[`ProgressEvent::error`]).
    pub fn with_resource(mut self, id: &ResourceId, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        self.resource_id = Some(id.clone());
        self.resource_kind = Some(kind.to_string());
        self.namespace = namespace.map(str::to_string);
        self.name = Some(name.to_string());
        self
    }
}

/// The callback contract itself: invoked from arbitrary tasks, so consumers must be thread-safe.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A sink that discards every event, for callers that don't need progress reporting.
pub fn noop_sink() -> ProgressSink {
    Arc::new(|_| {})
}

//! The event/watch pipeline (component C7): one connection per `(kind, namespace)` pair among the
//! resources a deployment is following, watching the cluster's own `Event` objects (not the
//! followed resources themselves — state for those is read directly by C6's readiness gate and
//! C8's status hydrator) and forwarding filtered, deduplicated, priority-ordered events to a
//! [`crate::progress::ProgressSink`].
//!
//! Grounded on the teacher's use of `kube::runtime::events::{Event, EventType, Recorder}` for
//! *publishing* reconciler events; this module adds the consumption side the teacher never needed,
//! since the teacher only ever emits its own events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use api::ResourceId;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event as K8sEvent;
use kube::api::Api;
use kube::runtime::watcher::{self, Config, Event as WatchEvent};
use kube::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backoff::{self, BackoffPolicy};
use crate::events::{Dedup, DedupKey, EventKind, Priority};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::state::DeployedMap;

/// Tunables for a [`WatchSet`], independent of any one connection's `(kind, namespace)` identity.
#[derive(Clone)]
pub struct WatchOptions {
    /// Reconnect backoff policy.
    pub backoff: BackoffPolicy,
    /// Window within which identical events are coalesced to a single dispatch.
    pub dedup_window: Duration,
    /// Number of recent event keys retained by the dedup ring buffer.
    pub dedup_capacity: usize,
    /// Event types accepted for dispatch.
    pub allowed_types: Vec<EventKind>,
    /// Warning reasons promoted to [`Priority::CriticalWarning`].
    pub critical_reasons: Vec<String>,
    /// Normal reasons promoted to [`Priority::ImportantNormal`].
    pub important_reasons: Vec<String>,
    /// When set, an involved object whose name is `"<followed-name>-..."` is treated as a
    /// recognized child of the followed resource (e.g. pods of a workload) even if its kind
    /// differs from the one being followed.
    pub track_children: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            backoff: BackoffPolicy::default(),
            dedup_window: Duration::from_secs(30),
            dedup_capacity: 256,
            allowed_types: vec![EventKind::Normal, EventKind::Warning, EventKind::Error],
            critical_reasons: vec!["BackOff".into(), "Failed".into(), "FailedScheduling".into()],
            important_reasons: vec!["Scheduled".into(), "Pulled".into(), "Started".into()],
            track_children: true,
        }
    }
}

/// One `(kind, namespace)` connection's set of followed resources: cluster-side name to
/// graph-internal id.
#[derive(Clone, Debug, Default)]
struct Followed(HashMap<String, ResourceId>);

/// Why a watch stream's inner loop broke: an actual error, or a clean end-of-stream (the
/// server's own watch timeout, expected per §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamBreak {
    Timeout,
    Error,
}

/// The reconnect attempt counter and degraded-signal latch, isolated from `Connection::run`'s
/// I/O so the reset-on-expected-timeout behavior (S6) is directly testable.
#[derive(Clone, Copy, Debug, Default)]
struct ReconnectState {
    attempt: u32,
    degraded_signaled: bool,
}

impl ReconnectState {
    /// A successful event (or an expected timeout) resets the counter and the degraded latch.
    fn on_success(&mut self) {
        self.attempt = 0;
        self.degraded_signaled = false;
    }

    /// Applies one stream break. Returns `true` exactly once per degraded episode: the moment
    /// `max_attempts` consecutive errors is first reached. A [`StreamBreak::Timeout`] is treated
    /// as a success for counter purposes, never triggers degraded, and always returns `false`.
    fn on_break(&mut self, reason: StreamBreak, max_attempts: u32) -> bool {
        match reason {
            StreamBreak::Timeout => {
                self.on_success();
                false
            }
            StreamBreak::Error => {
                self.attempt = self.attempt.saturating_add(1);
                if self.attempt >= max_attempts && !self.degraded_signaled {
                    self.degraded_signaled = true;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// A single watch connection over one `(kind, namespace)` pair's `Event` stream.
pub struct Connection {
    kind: String,
    namespace: String,
    followed: Followed,
    field_selector: Option<String>,
}

impl Connection {
    fn new(kind: String, namespace: String, followed: HashMap<String, ResourceId>) -> Self {
        let field_selector = match followed.len() {
            1 => followed.keys().next().map(|name| format!("involvedObject.kind={kind},involvedObject.name={name}")),
            _ => Some(format!("involvedObject.kind={kind}")),
        };
        Connection {
            kind,
            namespace,
            followed: Followed(followed),
            field_selector,
        }
    }

    /// True if an event's involved object should be forwarded: either it names a resource we
    /// follow directly, or (when child tracking is on) its name looks like a child of one.
    fn matches(&self, involved_kind: &str, involved_name: &str, track_children: bool) -> bool {
        if involved_kind == self.kind && self.followed.0.contains_key(involved_name) {
            return true;
        }
        if track_children {
            return self.followed.0.keys().any(|name| involved_name.starts_with(&format!("{name}-")));
        }
        false
    }

    /// Runs this connection until `cancel` fires, reconnecting with backoff on stream errors and
    /// emitting a degraded-monitoring progress event after `opts.backoff.max_attempts` consecutive
    /// failures (the connection keeps retrying afterward; it is never given up on entirely).
    #[instrument(skip(self, client, sink, cancel, opts), fields(kind = %self.kind, namespace = %self.namespace))]
    pub async fn run(&self, client: Client, sink: ProgressSink, cancel: CancellationToken, opts: WatchOptions) {
        let api: Api<K8sEvent> = Api::namespaced(client, &self.namespace);
        let mut dedup = Dedup::new(opts.dedup_window, opts.dedup_capacity);
        let mut state = ReconnectState::default();
        let mut rng = rand::thread_rng();

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let selector = self.field_selector.clone().unwrap_or_else(|| format!("involvedObject.kind={}", self.kind));
            let cfg = Config::default().fields(&selector);
            let stream = watcher::watcher(api.clone(), cfg);
            tokio::pin!(stream);

            let mut broke: Option<StreamBreak> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = stream.next() => {
                        match next {
                            Some(Ok(WatchEvent::Applied(ev))) => {
                                self.dispatch(&ev, &opts, &mut dedup, &sink);
                                state.on_success();
                            }
                            Some(Ok(WatchEvent::Restarted(evs))) => {
                                for ev in evs {
                                    self.dispatch(&ev, &opts, &mut dedup, &sink);
                                }
                                state.on_success();
                            }
                            Some(Ok(WatchEvent::Deleted(_))) => {}
                            Some(Err(err)) => {
                                warn!(kind = %self.kind, namespace = %self.namespace, %err, "watch stream error, reconnecting");
                                broke = Some(StreamBreak::Error);
                                break;
                            }
                            None => {
                                // A clean stream end is the server closing the watch on its own
                                // timeout — expected, not a failure. Reset the reconnect counter
                                // per §4.7 rather than treating it as a broken connection.
                                broke = Some(StreamBreak::Timeout);
                                break;
                            }
                        }
                    }
                }
            }

            let Some(reason) = broke else { continue };
            if matches!(reason, StreamBreak::Timeout) {
                state.on_break(reason, opts.backoff.max_attempts);
                continue;
            }
            metrics::counter!("resource_graph_engine_watch_reconnects_total", "kind" => self.kind.clone()).increment(1);
            if state.on_break(reason, opts.backoff.max_attempts) {
                metrics::counter!("resource_graph_engine_watch_degraded_total", "kind" => self.kind.clone()).increment(1);
                sink(ProgressEvent::degraded(format!(
                    "monitoring degraded for {}/{}: watch reconnection exhausted after {} attempts",
                    self.kind, self.namespace, state.attempt
                )));
            }
            let delay = backoff::reconnect_delay(&opts.backoff, state.attempt, &mut rng);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn dispatch(&self, ev: &K8sEvent, opts: &WatchOptions, dedup: &mut Dedup, sink: &ProgressSink) {
        let Some(involved) = ev.involved_object.name.as_deref() else {
            return;
        };
        let involved_kind = ev.involved_object.kind.as_deref().unwrap_or_default();
        if !self.matches(involved_kind, involved, opts.track_children) {
            return;
        }
        let kind = match ev.type_.as_deref() {
            Some("Warning") => EventKind::Warning,
            _ => EventKind::Normal,
        };
        if !opts.allowed_types.contains(&kind) {
            return;
        }
        let reason = ev.reason.clone().unwrap_or_default();
        let message = ev.message.clone().unwrap_or_default();
        let critical: Vec<&str> = opts.critical_reasons.iter().map(String::as_str).collect();
        let important: Vec<&str> = opts.important_reasons.iter().map(String::as_str).collect();
        let priority = Priority::classify(kind, &reason, &critical, &important);
        let key = DedupKey {
            kind: involved_kind.to_string(),
            namespace: self.namespace.clone(),
            name: involved.to_string(),
            reason: reason.clone(),
            message: message.clone(),
        };
        if !dedup.should_dispatch(&key) {
            metrics::counter!("resource_graph_engine_events_deduped_total", "kind" => involved_kind.to_string()).increment(1);
            return;
        }
        metrics::counter!("resource_graph_engine_events_dispatched_total", "kind" => involved_kind.to_string()).increment(1);
        let progress_kind = match priority {
            Priority::Error => crate::progress::ProgressKind::Error,
            _ => crate::progress::ProgressKind::Progress,
        };
        let id = self.followed.0.get(involved).cloned();
        let mut event = ProgressEvent {
            kind: progress_kind,
            message: format!("{reason}: {message}"),
            resource_id: id,
            resource_kind: Some(involved_kind.to_string()),
            namespace: Some(self.namespace.clone()),
            name: Some(involved.to_string()),
        };
        if matches!(kind, EventKind::Warning) {
            event.message = format!("[{priority:?}] {}", event.message);
        }
        sink(event);
    }
}

/// A collection of watch connections, one per `(kind, namespace)` pair among the resources a
/// deployment is following.
pub struct WatchSet {
    connections: Vec<Arc<Connection>>,
}

impl WatchSet {
    /// Groups a deployed-resource snapshot into one connection per `(kind, namespace)`.
    /// Cluster-scoped resources (no namespace) are not watched via this path — their readiness is
    /// observed directly by C6's readiness gate.
    pub fn for_deployed(deployed: &DeployedMap) -> Self {
        let mut grouped: HashMap<(String, String), HashMap<String, ResourceId>> = HashMap::new();
        for record in deployed.values() {
            let Some(ns) = &record.namespace else { continue };
            grouped
                .entry((record.kind.clone(), ns.clone()))
                .or_default()
                .insert(record.name.clone(), record.id.clone());
        }
        let connections = grouped
            .into_iter()
            .map(|((kind, ns), followed)| Arc::new(Connection::new(kind, ns, followed)))
            .collect();
        WatchSet { connections }
    }

    /// True if no connections were derived (nothing namespaced to watch).
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Runs every connection concurrently until `cancel` fires. Each connection manages its own
    /// reconnection; one connection's exhaustion never stops the others (§4.7: "do not fail the
    /// overall deployment solely because monitoring is degraded").
    pub async fn run(&self, client: Client, sink: ProgressSink, cancel: CancellationToken, opts: WatchOptions) {
        let mut set = tokio::task::JoinSet::new();
        for conn in &self.connections {
            let conn = Arc::clone(conn);
            let client = client.clone();
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            let opts = opts.clone();
            set.spawn(async move { conn.run(client, sink, cancel, opts).await });
        }
        while set.join_next().await.is_some() {}
    }
}

/// Shared, lock-protected watch-connection bookkeeping as described in §3's data model
/// (`WatchConnectionState`), for callers that want to inspect reconnect/follow state externally
/// (e.g. a status endpoint) rather than only observing it via progress events.
pub type SharedWatchState = Arc<Mutex<HashMap<(String, String), api::WatchConnectionState>>>;

//! Event classification and deduplication for the watch pipeline (C7): priority ordering so a
//! slow consumer can be handed the most important events first, and a dedup ring buffer so a
//! noisy controller re-emitting the same event doesn't flood consumers.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// The three event types the cluster API server itself distinguishes, plus the pipeline's own
/// synthetic `Error` tier for conditions the server never reports as an event (e.g. a watch that
/// gave up reconnecting).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A `kube::runtime::events::EventType::Normal` event.
    Normal,
    /// A `kube::runtime::events::EventType::Warning` event.
    Warning,
    /// Synthesized by the pipeline itself, not the server.
    Error,
}

/// Dispatch priority, highest first: `Error > critical Warning > Warning > important Normal >
/// Normal`. `Ord` is derived from declaration order, so `Priority::Error < Priority::Normal` in
/// the derived comparison — callers sort descending (`sort_by(|a, b| b.cmp(a))`) or use
/// [`Priority::rank`] directly when a larger number means "more important".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// A terminal/synthetic error.
    Error,
    /// A Warning whose `reason` is in the caller's critical-reasons set.
    CriticalWarning,
    /// Any other Warning.
    Warning,
    /// A Normal whose `reason` is in the caller's important-reasons set.
    ImportantNormal,
    /// Any other Normal.
    Normal,
}

impl Priority {
    /// Classifies an event kind and reason into a dispatch priority. `critical_reasons` and
    /// `important_reasons` are caller-supplied, matching the spec's "critical-reason Warnings"/
    /// "important Normals" carve-outs without hard-coding a fixed reason vocabulary.
    pub fn classify(kind: EventKind, reason: &str, critical_reasons: &[&str], important_reasons: &[&str]) -> Priority {
        match kind {
            EventKind::Error => Priority::Error,
            EventKind::Warning if critical_reasons.contains(&reason) => Priority::CriticalWarning,
            EventKind::Warning => Priority::Warning,
            EventKind::Normal if important_reasons.contains(&reason) => Priority::ImportantNormal,
            EventKind::Normal => Priority::Normal,
        }
    }

    /// A numeric rank where larger means more important, for callers that want to sort ascending
    /// and read the last element as highest priority.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Error => 4,
            Priority::CriticalWarning => 3,
            Priority::Warning => 2,
            Priority::ImportantNormal => 1,
            Priority::Normal => 0,
        }
    }
}

/// An event as tracked by the dedup/priority layer, carrying only what's needed to key and
/// prioritize it — the full object payload lives in whatever the caller derived this from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// The involved object's kind.
    pub kind: String,
    /// The involved object's namespace.
    pub namespace: String,
    /// The involved object's name.
    pub name: String,
    /// The event's reason.
    pub reason: String,
    /// The event's message.
    pub message: String,
}

/// A tracked event, ready for dispatch decisions.
#[derive(Clone, Debug)]
pub struct TrackedEvent {
    /// The dedup key.
    pub key: DedupKey,
    /// Its classified priority.
    pub priority: Priority,
}

struct Entry {
    key: DedupKey,
    seen_at: Instant,
}

/// A ring buffer tracking recently-dispatched `(kind, namespace, name, reason, message)` tuples,
/// coalescing duplicates within a configurable window (Testable Property 8).
pub struct Dedup {
    window: Duration,
    capacity: usize,
    seen: VecDeque<Entry>,
}

impl Dedup {
    /// Builds a dedup tracker with the given coalescing window and a bound on how many recent
    /// keys it retains (oldest entries are pruned both by age and by capacity).
    pub fn new(window: Duration, capacity: usize) -> Self {
        Dedup {
            window,
            capacity,
            seen: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns `true` (and records the key) if this event should be dispatched: either it hasn't
    /// been seen within the window, or the window has since elapsed for the prior sighting.
    pub fn should_dispatch(&mut self, key: &DedupKey) -> bool {
        self.should_dispatch_at(key, Instant::now())
    }

    /// Same as [`Dedup::should_dispatch`] but takes an explicit "now", for deterministic tests.
    pub fn should_dispatch_at(&mut self, key: &DedupKey, now: Instant) -> bool {
        self.prune(now);
        if self.seen.iter().any(|e| &e.key == key) {
            return false;
        }
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(Entry {
            key: key.clone(),
            seen_at: now,
        });
        true
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.seen.front() {
            if now.saturating_duration_since(front.seen_at) >= self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(message: &str) -> DedupKey {
        DedupKey {
            kind: "Pod".into(),
            namespace: "default".into(),
            name: "web-1".into(),
            reason: "Pulled".into(),
            message: message.into(),
        }
    }

    #[test]
    fn identical_event_within_window_dispatches_once() {
        let mut dedup = Dedup::new(Duration::from_millis(100), 16);
        let start = Instant::now();
        assert!(dedup.should_dispatch_at(&key("pulled image"), start));
        assert!(!dedup.should_dispatch_at(&key("pulled image"), start + Duration::from_millis(10)));
    }

    #[test]
    fn identical_event_after_window_dispatches_again() {
        let mut dedup = Dedup::new(Duration::from_millis(50), 16);
        let start = Instant::now();
        assert!(dedup.should_dispatch_at(&key("pulled image"), start));
        assert!(dedup.should_dispatch_at(&key("pulled image"), start + Duration::from_millis(60)));
    }

    #[test]
    fn priority_orders_error_above_everything() {
        let mut priorities = vec![Priority::Normal, Priority::Error, Priority::Warning];
        priorities.sort();
        assert_eq!(priorities, vec![Priority::Error, Priority::Warning, Priority::Normal]);
    }

    #[test]
    fn critical_warning_ranks_between_error_and_plain_warning() {
        assert!(Priority::Error < Priority::CriticalWarning);
        assert!(Priority::CriticalWarning < Priority::Warning);
    }

    #[test]
    fn classify_uses_caller_supplied_reason_sets() {
        let p = Priority::classify(EventKind::Warning, "BackOff", &["BackOff"], &[]);
        assert_eq!(p, Priority::CriticalWarning);
        let p = Priority::classify(EventKind::Normal, "Scheduled", &[], &["Scheduled"]);
        assert_eq!(p, Priority::ImportantNormal);
        let p = Priority::classify(EventKind::Normal, "Pulling", &[], &["Scheduled"]);
        assert_eq!(p, Priority::Normal);
    }
}

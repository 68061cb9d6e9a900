//! Context bus shared by the agents of one session.
//!
//! The bus is an append-only store of [`ContextEntry`] values plus a few
//! side channels: per-role insights, named shared assets, and a diagnostic
//! event log. All state sits behind one `parking_lot::Mutex`; no I/O happens
//! while it is held.
//!
//! Subscribers never run on the publisher's stack. Each one owns a bounded
//! queue drained by its own task, and publication uses `try_send`, so a slow
//! subscriber loses notifications instead of stalling the pipeline.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scene_agents::AgentRole;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::telemetry::Telemetry;

/// Default queue capacity per subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Kind of knowledge a context entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// Scene concept prose
    Concept,
    /// A Blender script applied to the scene
    Script,
    /// An agent's explanation of its output
    Reasoning,
    /// A critique verdict
    Critique,
    /// Output of a script execution
    Execution,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::Script => "script",
            Self::Reasoning => "reasoning",
            Self::Critique => "critique",
            Self::Execution => "execution",
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One published piece of context. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub source_role: AgentRole,
    pub context_type: ContextType,
    pub content: String,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Clamped to `[0, 1]`
    pub confidence: f64,
    pub tags: BTreeSet<String>,
    /// Position in the `(source_role, context_type)` series, starting at 1
    pub sequence: u64,
    /// Position across the whole bus
    pub insertion: u64,
    pub timestamp: DateTime<Utc>,
}

/// Arguments for a publication.
#[derive(Debug, Clone)]
pub struct Publication {
    pub role: AgentRole,
    pub context_type: ContextType,
    pub content: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub confidence: f64,
    pub tags: BTreeSet<String>,
}

impl Publication {
    pub fn new(role: AgentRole, context_type: ContextType, content: impl Into<String>) -> Self {
        Self {
            role,
            context_type,
            content: content.into(),
            metadata: HashMap::new(),
            confidence: 1.0,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Value of a shared asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AssetValue {
    Path(PathBuf),
    Text(String),
    Json(serde_json::Value),
}

/// A named handle passed between stages. Last writer wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedAsset {
    pub name: String,
    pub value: AssetValue,
    pub producer: AgentRole,
    pub updated_at: DateTime<Utc>,
}

/// Diagnostic event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StageStarted,
    StageCompleted,
    StageFailed,
    StageSkipped,
    StageCancelled,
    Retry,
    Substitution,
    Refine,
    ValidationDeferred,
    ContextCommitted,
    ContextDiscarded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::StageCancelled => "stage_cancelled",
            Self::Retry => "retry",
            Self::Substitution => "substitution",
            Self::Refine => "refine",
            Self::ValidationDeferred => "validation_deferred",
            Self::ContextCommitted => "context_committed",
            Self::ContextDiscarded => "context_discarded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only diagnostic log entry. Never read for control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationEvent {
    pub event_type: EventType,
    pub actor_role: Option<AgentRole>,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// Identifier returned by `subscribe` and `register_observer`.
pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    role: AgentRole,
    /// `None` observes every type
    filter: Option<ContextType>,
    sender: mpsc::Sender<ContextEntry>,
}

impl Subscriber {
    fn wants(&self, entry: &ContextEntry) -> bool {
        entry.source_role != self.role && self.filter.map_or(true, |t| t == entry.context_type)
    }
}

#[derive(Default)]
struct BusState {
    entries: Vec<ContextEntry>,
    series: HashMap<(AgentRole, ContextType), u64>,
    insights: HashMap<AgentRole, serde_json::Value>,
    assets: HashMap<String, SharedAsset>,
    events: Vec<CollaborationEvent>,
    subscribers: Vec<Subscriber>,
    next_subscription: SubscriptionId,
}

impl BusState {
    fn append(&mut self, publication: Publication, now: DateTime<Utc>) -> ContextEntry {
        let sequence = {
            let counter = self
                .series
                .entry((publication.role, publication.context_type))
                .or_insert(0);
            *counter += 1;
            *counter
        };
        let entry = ContextEntry {
            source_role: publication.role,
            context_type: publication.context_type,
            content: publication.content,
            metadata: publication.metadata,
            confidence: if publication.confidence.is_nan() {
                0.0
            } else {
                publication.confidence.clamp(0.0, 1.0)
            },
            tags: publication.tags,
            sequence,
            insertion: self.entries.len() as u64 + 1,
            timestamp: now,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Queue `entry` for matching subscribers, pruning dead ones.
    fn notify(&mut self, entry: &ContextEntry, telemetry: &Telemetry) {
        self.subscribers.retain(|sub| {
            if !sub.wants(entry) {
                return true;
            }
            match sub.sender.try_send(entry.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {} ({}) queue full, dropping {} notification",
                        sub.id, sub.role, entry.context_type
                    );
                    telemetry.dropped_notification();
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Pruning closed subscriber {}", sub.id);
                    false
                }
            }
        });
    }
}

/// Per-session context store.
pub struct ContextBus {
    state: Mutex<BusState>,
    clock: Arc<dyn Clock>,
    queue_capacity: usize,
    telemetry: Telemetry,
}

impl Default for ContextBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ContextBus")
            .field("entries", &state.entries.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl ContextBus {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            clock,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            telemetry: Telemetry::disabled(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Append an entry and notify subscribers.
    pub fn publish(&self, publication: Publication) -> ContextEntry {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let entry = state.append(publication, now);
        state.notify(&entry, &self.telemetry);
        entry
    }

    /// Apply a branch's buffered writes in one critical section.
    pub fn commit(&self, pending: PendingContext) -> Vec<ContextEntry> {
        let now = self.clock.now();
        let role = pending.role;
        let mut state = self.state.lock();

        let mut committed = Vec::with_capacity(pending.publications.len());
        for publication in pending.publications {
            let entry = state.append(publication, now);
            state.notify(&entry, &self.telemetry);
            committed.push(entry);
        }
        for (name, value) in pending.assets {
            state.assets.insert(
                name.clone(),
                SharedAsset {
                    name,
                    value,
                    producer: role,
                    updated_at: now,
                },
            );
        }
        if let Some(insight) = pending.insight {
            state.insights.insert(role, insight);
        }
        state.events.push(CollaborationEvent {
            event_type: EventType::ContextCommitted,
            actor_role: Some(role),
            details: format!("{} entries", committed.len()),
            timestamp: now,
        });
        committed
    }

    /// Record that a branch's buffered writes were thrown away.
    pub fn discard(&self, pending: PendingContext) {
        if pending.is_empty() {
            return;
        }
        self.log_event(
            EventType::ContextDiscarded,
            Some(pending.role),
            format!("{} entries", pending.publications.len()),
        );
    }

    /// Up to `top_k` entries of `context_type` from roles other than
    /// `consumer`, newest first, ties broken by confidence.
    pub fn related_context(
        &self,
        consumer: AgentRole,
        context_type: ContextType,
        top_k: usize,
    ) -> Vec<ContextEntry> {
        let state = self.state.lock();
        let mut related: Vec<&ContextEntry> = state
            .entries
            .iter()
            .filter(|e| e.context_type == context_type && e.source_role != consumer)
            .collect();
        related.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| b.insertion.cmp(&a.insertion))
        });
        related.into_iter().take(top_k).cloned().collect()
    }

    /// Most recent entry for exactly `(role, context_type)`.
    pub fn latest(&self, role: AgentRole, context_type: ContextType) -> Option<ContextEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.source_role == role && e.context_type == context_type)
            .max_by_key(|e| e.sequence)
            .cloned()
    }

    /// Entries from other roles inserted after `since`, in insertion order.
    ///
    /// Entries committed together share a timestamp, so pollers that feed
    /// back the last timestamp they saw should use [`updates_after`] instead.
    ///
    /// [`updates_after`]: ContextBus::updates_after
    pub fn updates_since(&self, role: AgentRole, since: DateTime<Utc>) -> Vec<ContextEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.source_role != role && e.timestamp > since)
            .cloned()
            .collect()
    }

    /// Entries from other roles whose insertion number is above `cursor`.
    ///
    /// Pass the `insertion` of the last entry seen, or 0 for everything.
    pub fn updates_after(&self, role: AgentRole, cursor: u64) -> Vec<ContextEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.source_role != role && e.insertion > cursor)
            .cloned()
            .collect()
    }

    /// All entries, in insertion order.
    pub fn entries(&self) -> Vec<ContextEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Notify `callback` of new `context_type` entries from other roles.
    ///
    /// Must be called within a Tokio runtime.
    pub fn subscribe<F>(&self, role: AgentRole, context_type: ContextType, callback: F) -> SubscriptionId
    where
        F: Fn(ContextEntry) + Send + Sync + 'static,
    {
        self.add_subscriber(role, Some(context_type), callback)
    }

    /// Notify `callback` of every new entry from other roles.
    ///
    /// Must be called within a Tokio runtime.
    pub fn register_observer<F>(&self, role: AgentRole, callback: F) -> SubscriptionId
    where
        F: Fn(ContextEntry) + Send + Sync + 'static,
    {
        self.add_subscriber(role, None, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn add_subscriber<F>(&self, role: AgentRole, filter: Option<ContextType>, callback: F) -> SubscriptionId
    where
        F: Fn(ContextEntry) + Send + Sync + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<ContextEntry>(self.queue_capacity);
        tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                callback(entry);
            }
        });

        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscribers.push(Subscriber {
            id,
            role,
            filter,
            sender,
        });
        debug!("Subscriber {} registered for {}", id, role);
        id
    }

    pub fn set_shared_asset(&self, producer: AgentRole, name: impl Into<String>, value: AssetValue) {
        let name = name.into();
        let updated_at = self.clock.now();
        self.state.lock().assets.insert(
            name.clone(),
            SharedAsset {
                name,
                value,
                producer,
                updated_at,
            },
        );
    }

    pub fn shared_asset(&self, name: &str) -> Option<SharedAsset> {
        self.state.lock().assets.get(name).cloned()
    }

    /// Replace `role`'s insight wholesale.
    pub fn set_insight(&self, role: AgentRole, insight: serde_json::Value) {
        self.state.lock().insights.insert(role, insight);
    }

    pub fn insight(&self, role: AgentRole) -> Option<serde_json::Value> {
        self.state.lock().insights.get(&role).cloned()
    }

    pub fn log_event(&self, event_type: EventType, actor_role: Option<AgentRole>, details: impl Into<String>) {
        let timestamp = self.clock.now();
        self.state.lock().events.push(CollaborationEvent {
            event_type,
            actor_role,
            details: details.into(),
            timestamp,
        });
    }

    pub fn events(&self) -> Vec<CollaborationEvent> {
        self.state.lock().events.clone()
    }

    pub fn events_of(&self, event_type: EventType) -> Vec<CollaborationEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

/// Writes buffered by one concurrent branch.
///
/// Nothing is visible on the bus until [`ContextBus::commit`]; dropping the
/// buffer discards everything.
#[derive(Debug, Clone)]
pub struct PendingContext {
    role: AgentRole,
    publications: Vec<Publication>,
    assets: Vec<(String, AssetValue)>,
    insight: Option<serde_json::Value>,
}

impl PendingContext {
    pub fn new(role: AgentRole) -> Self {
        Self {
            role,
            publications: Vec::new(),
            assets: Vec::new(),
            insight: None,
        }
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn publish(&mut self, publication: Publication) {
        self.publications.push(publication);
    }

    pub fn set_shared_asset(&mut self, name: impl Into<String>, value: AssetValue) {
        self.assets.push((name.into(), value));
    }

    pub fn set_insight(&mut self, insight: serde_json::Value) {
        self.insight = Some(insight);
    }

    pub fn len(&self) -> usize {
        self.publications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publications.is_empty() && self.assets.is_empty() && self.insight.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::clock::ManualClock;

    fn bus() -> (ContextBus, Arc<ManualClock>) {
        let clock = ManualClock::at_minute_start().shared();
        (ContextBus::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_sequence_per_series() {
        let (bus, _) = bus();
        let a1 = bus.publish(Publication::new(AgentRole::Structure, ContextType::Script, "s1"));
        let b1 = bus.publish(Publication::new(AgentRole::Structure, ContextType::Reasoning, "r1"));
        let a2 = bus.publish(Publication::new(AgentRole::Structure, ContextType::Script, "s2"));

        assert_eq!((a1.sequence, a2.sequence, b1.sequence), (1, 2, 1));
        assert_eq!(a2.insertion, 3);
    }

    #[test]
    fn test_latest_is_monotonic() {
        let (bus, clock) = bus();
        let mut last_sequence = 0;
        for i in 0..10 {
            bus.publish(Publication::new(AgentRole::Surface, ContextType::Script, format!("v{}", i)));
            bus.publish(Publication::new(AgentRole::LightCamera, ContextType::Script, "noise"));
            let latest = bus.latest(AgentRole::Surface, ContextType::Script).unwrap();
            assert!(latest.sequence > last_sequence);
            assert_eq!(latest.content, format!("v{}", i));
            last_sequence = latest.sequence;
            if i % 3 == 0 {
                clock.advance(Duration::from_millis(10));
            }
        }
        assert!(bus.latest(AgentRole::Motion, ContextType::Script).is_none());
    }

    #[test]
    fn test_confidence_clamped() {
        let (bus, _) = bus();
        let high = bus.publish(
            Publication::new(AgentRole::Concept, ContextType::Concept, "c").with_confidence(3.0),
        );
        let low = bus.publish(
            Publication::new(AgentRole::Concept, ContextType::Concept, "c").with_confidence(-1.0),
        );
        assert_eq!(high.confidence, 1.0);
        assert_eq!(low.confidence, 0.0);
    }

    #[test]
    fn test_related_context_ranking() {
        let (bus, clock) = bus();
        bus.publish(Publication::new(AgentRole::Structure, ContextType::Reasoning, "old"));
        clock.advance(Duration::from_secs(1));
        bus.publish(
            Publication::new(AgentRole::Surface, ContextType::Reasoning, "new-low").with_confidence(0.2),
        );
        bus.publish(
            Publication::new(AgentRole::Motion, ContextType::Reasoning, "new-high").with_confidence(0.9),
        );
        bus.publish(Publication::new(AgentRole::LightCamera, ContextType::Reasoning, "own"));
        bus.publish(Publication::new(AgentRole::Concept, ContextType::Concept, "other type"));

        let related = bus.related_context(AgentRole::LightCamera, ContextType::Reasoning, 3);
        let contents: Vec<_> = related.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["new-high", "new-low", "old"]);

        let top1 = bus.related_context(AgentRole::LightCamera, ContextType::Reasoning, 1);
        assert_eq!(top1.len(), 1);
    }

    #[test]
    fn test_updates_since_excludes_own_and_older() {
        let (bus, clock) = bus();
        bus.publish(Publication::new(AgentRole::Concept, ContextType::Concept, "before"));
        let mark = clock.now();
        clock.advance(Duration::from_millis(5));
        bus.publish(Publication::new(AgentRole::Structure, ContextType::Script, "s"));
        bus.publish(Publication::new(AgentRole::Surface, ContextType::Script, "own"));
        bus.publish(Publication::new(AgentRole::Concept, ContextType::Reasoning, "r"));

        let updates = bus.updates_since(AgentRole::Surface, mark);
        let contents: Vec<_> = updates.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["s", "r"]);
    }

    #[test]
    fn test_updates_after_cursor_sees_same_timestamp_entries() {
        let (bus, _) = bus();
        let mut pending = PendingContext::new(AgentRole::Structure);
        pending.publish(Publication::new(AgentRole::Structure, ContextType::Script, "base"));
        pending.publish(Publication::new(AgentRole::Structure, ContextType::Reasoning, "why"));
        let committed = bus.commit(pending);
        assert_eq!(committed[0].timestamp, committed[1].timestamp);

        let seen = &committed[0];
        assert!(bus.updates_since(AgentRole::Critique, seen.timestamp).is_empty());

        let updates = bus.updates_after(AgentRole::Critique, seen.insertion);
        let contents: Vec<_> = updates.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["why"]);
        assert_eq!(bus.updates_after(AgentRole::Critique, 0).len(), 2);
        assert!(bus.updates_after(AgentRole::Structure, 0).is_empty());
    }

    #[test]
    fn test_pending_context_commit_and_discard() {
        let (bus, _) = bus();
        let mut pending = PendingContext::new(AgentRole::Surface);
        pending.publish(Publication::new(AgentRole::Surface, ContextType::Script, "mat"));
        pending.set_shared_asset("scene", AssetValue::Text("s.blend".into()));
        pending.set_insight(serde_json::json!({"materials": 1}));
        assert!(bus.is_empty());

        let committed = bus.commit(pending);
        assert_eq!(committed.len(), 1);
        assert_eq!(bus.shared_asset("scene").unwrap().producer, AgentRole::Surface);
        assert!(bus.insight(AgentRole::Surface).is_some());

        let mut dropped = PendingContext::new(AgentRole::Motion);
        dropped.publish(Publication::new(AgentRole::Motion, ContextType::Script, "anim"));
        bus.discard(dropped);
        assert!(bus.latest(AgentRole::Motion, ContextType::Script).is_none());
        assert_eq!(bus.events_of(EventType::ContextDiscarded).len(), 1);
    }

    #[test]
    fn test_shared_asset_last_writer_wins() {
        let (bus, _) = bus();
        bus.set_shared_asset(AgentRole::Structure, "scene", AssetValue::Text("a".into()));
        bus.set_shared_asset(AgentRole::Surface, "scene", AssetValue::Text("b".into()));
        let asset = bus.shared_asset("scene").unwrap();
        assert_eq!(asset.value, AssetValue::Text("b".into()));
        assert_eq!(asset.producer, AgentRole::Surface);
    }

    #[tokio::test]
    async fn test_subscriber_receives_matching_entries() {
        let (bus, _) = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(AgentRole::Critique, ContextType::Script, move |entry| {
            let _ = tx.send(entry.content);
        });

        bus.publish(Publication::new(AgentRole::Structure, ContextType::Script, "one"));
        bus.publish(Publication::new(AgentRole::Structure, ContextType::Reasoning, "skip"));
        bus.publish(Publication::new(AgentRole::Critique, ContextType::Script, "own"));
        bus.publish(Publication::new(AgentRole::Surface, ContextType::Script, "two"));

        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let (bus, _) = bus();
        let bus = bus.with_queue_capacity(2);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.register_observer(AgentRole::Critique, move |_| {
            std::thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..50 {
            bus.publish(Publication::new(AgentRole::Structure, ContextType::Script, format!("{}", i)));
        }

        assert_eq!(bus.len(), 50);
        assert!(bus.telemetry.snapshot().dropped_notifications > 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_subscriber() {
        let (bus, _) = bus();
        let id = bus.register_observer(AgentRole::Critique, |_| {});
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.unsubscribe(id));
    }

    #[tokio::test]
    async fn test_dead_subscriber_pruned_on_publish() {
        let (bus, _) = bus();
        bus.register_observer(AgentRole::Critique, |_| panic!("observer failed"));
        bus.register_observer(AgentRole::Motion, |_| {});
        assert_eq!(bus.subscriber_count(), 2);

        // The first delivery kills the panicking observer's task
        for attempt in 0..20 {
            bus.publish(Publication::new(AgentRole::Structure, ContextType::Script, format!("s{}", attempt)));
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if bus.subscriber_count() == 1 {
                break;
            }
        }
        assert_eq!(bus.subscriber_count(), 1);
    }
}

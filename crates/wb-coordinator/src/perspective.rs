//! Perspective worker
//!
//! Perspectives are pure folds over a stream's events producing read
//! models. The worker advances claimed checkpoints: read events past the
//! checkpoint boundary, fold the registered apply function, persist the
//! model, and report the advance. Apply functions must be pure and
//! deterministic so retries and partition reassignments are safe.
//!
//! Completions flow through a strategy: batched (flushed with the next
//! exchange, the default) or instant (a dedicated exchange per
//! completion, for test determinism). Either way each tracked completion
//! walks Pending -> Sent -> Acknowledged, and one stuck in Sent past the
//! timeout reverts to Pending with exponential backoff.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use wb_domain::{
    AssociationKind, EventRecord, FailureReason, InstanceIdentity, MessageAssociation,
    PerspectiveCheckpoint,
};
use wb_ports::{CheckpointOutcome, WorkBatchRequest, WorkStore};

use crate::config::CoordinatorConfig;
use crate::router::WorkRouter;

// ============================================================================
// Perspective Registry
// ============================================================================

/// A pure fold producing a read model from a stream of events.
pub trait Perspective: Send + Sync {
    fn name(&self) -> &str;

    /// Event types this perspective folds; drives association
    /// registration and checkpoint auto-creation.
    fn interested_in(&self) -> Vec<String>;

    /// Fold one event into the model. Must be pure: same inputs, same
    /// output, no side effects.
    fn apply(&self, model: serde_json::Value, event: &EventRecord) -> serde_json::Value;
}

/// A perspective built from a closure.
pub struct FnPerspective<F> {
    name: String,
    event_types: Vec<String>,
    apply: F,
}

impl<F> FnPerspective<F>
where
    F: Fn(serde_json::Value, &EventRecord) -> serde_json::Value + Send + Sync,
{
    pub fn new(name: &str, event_types: &[&str], apply: F) -> Self {
        Self {
            name: name.to_string(),
            event_types: event_types.iter().map(|s| s.to_string()).collect(),
            apply,
        }
    }
}

impl<F> Perspective for FnPerspective<F>
where
    F: Fn(serde_json::Value, &EventRecord) -> serde_json::Value + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn interested_in(&self) -> Vec<String> {
        self.event_types.clone()
    }

    fn apply(&self, model: serde_json::Value, event: &EventRecord) -> serde_json::Value {
        (self.apply)(model, event)
    }
}

/// Registry mapping perspective names to their folds.
#[derive(Default)]
pub struct PerspectiveRegistry {
    perspectives: HashMap<String, Arc<dyn Perspective>>,
}

impl PerspectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, perspective: Arc<dyn Perspective>) {
        self.perspectives
            .insert(perspective.name().to_string(), perspective);
    }

    pub fn register_fn<F>(&mut self, name: &str, event_types: &[&str], apply: F)
    where
        F: Fn(serde_json::Value, &EventRecord) -> serde_json::Value + Send + Sync + 'static,
    {
        self.register(Arc::new(FnPerspective::new(name, event_types, apply)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Perspective>> {
        self.perspectives.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.perspectives.is_empty()
    }

    /// The declarative association rows this registry contributes.
    pub fn associations(&self, service_name: &str) -> Vec<MessageAssociation> {
        self.perspectives
            .values()
            .flat_map(|perspective| {
                perspective
                    .interested_in()
                    .into_iter()
                    .map(|message_type| MessageAssociation {
                        message_type,
                        kind: AssociationKind::Perspective,
                        target_name: perspective.name().to_string(),
                        service_name: service_name.to_string(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

// ============================================================================
// Completion Tracking
// ============================================================================

/// How perspective completions reach the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionStrategy {
    /// Accumulate and flush with the next scheduled exchange. Minimises
    /// RPC chatter.
    #[default]
    Batched,
    /// One dedicated exchange per completion. For test determinism.
    Instant,
}

#[derive(Debug, Clone, PartialEq)]
enum CompletionState {
    Pending,
    Sent { sent_at: DateTime<Utc> },
}

struct TrackedCompletion {
    outcome: CheckpointOutcome,
    state: CompletionState,
    retries: u32,
    next_attempt_at: DateTime<Utc>,
}

/// Tracks completion lifecycles across exchanges. Acknowledged entries
/// are dropped; entries stuck in Sent past the timeout revert to Pending
/// with exponential backoff.
pub struct CompletionTracker {
    entries: Mutex<Vec<TrackedCompletion>>,
    sent_timeout: Duration,
}

impl CompletionTracker {
    pub fn new(sent_timeout_secs: i64) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sent_timeout: Duration::seconds(sent_timeout_secs),
        }
    }

    pub fn track(&self, outcome: CheckpointOutcome) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(TrackedCompletion {
            outcome,
            state: CompletionState::Pending,
            retries: 0,
            next_attempt_at: Utc::now(),
        });
    }

    /// Pending entries due for (re)submission; marks them Sent.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<CheckpointOutcome> {
        let mut entries = self.entries.lock().unwrap();
        let mut due = Vec::new();
        for entry in entries.iter_mut() {
            if entry.state == CompletionState::Pending && entry.next_attempt_at <= now {
                entry.state = CompletionState::Sent { sent_at: now };
                due.push(entry.outcome.clone());
            }
        }
        due
    }

    /// The exchange carrying the Sent entries succeeded; they are
    /// acknowledged and dropped.
    pub fn complete_sent(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| matches!(entry.state, CompletionState::Pending));
    }

    /// The exchange failed; Sent entries revert to Pending with backoff.
    pub fn revert_sent(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if matches!(entry.state, CompletionState::Sent { .. }) {
                Self::revert(entry, now);
            }
        }
    }

    /// Revert entries stuck in Sent past the timeout (e.g. an exchange
    /// whose outcome was never learned).
    pub fn revert_stale(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if let CompletionState::Sent { sent_at } = entry.state {
                if sent_at + self.sent_timeout < now {
                    Self::revert(entry, now);
                }
            }
        }
    }

    fn revert(entry: &mut TrackedCompletion, now: DateTime<Utc>) {
        entry.retries += 1;
        // 1s, 2s, 4s, ... capped at 60s.
        let backoff_secs = (1i64 << entry.retries.min(6)).min(60);
        entry.next_attempt_at = now + Duration::seconds(backoff_secs);
        entry.state = CompletionState::Pending;
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.state == CompletionState::Pending)
            .count()
    }

    pub fn sent_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e.state, CompletionState::Sent { .. }))
            .count()
    }
}

// ============================================================================
// Perspective Worker
// ============================================================================

/// The coordinator half of the perspective worker.
pub struct PerspectiveWorker<S> {
    store: Arc<S>,
    config: CoordinatorConfig,
    identity: InstanceIdentity,
    tracker: Arc<CompletionTracker>,
    router: WorkRouter,
    running: Arc<AtomicBool>,
}

impl<S: WorkStore + 'static> PerspectiveWorker<S> {
    pub fn new(
        store: Arc<S>,
        config: CoordinatorConfig,
        identity: InstanceIdentity,
        tracker: Arc<CompletionTracker>,
        router: WorkRouter,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            config,
            identity,
            tracker,
            router,
            running,
        }
    }

    pub async fn run_coordinator(self) {
        let interval = self.config.polling_interval();
        info!(
            interval_ms = self.config.polling_interval_ms,
            "Perspective coordinator started"
        );

        while self.running.load(Ordering::Relaxed) {
            self.tick().await;
            tokio::time::sleep(interval).await;
        }

        info!("Perspective coordinator stopped");
    }

    #[instrument(skip(self), fields(instance_id = %self.identity.instance_id))]
    async fn tick(&self) {
        if !self.store.is_ready().await {
            debug!("Database not ready; skipping exchange");
            return;
        }

        let now = Utc::now();
        self.tracker.revert_stale(now);
        let due = self.tracker.take_due(now);

        let mut request = WorkBatchRequest::new(self.identity.clone(), self.config.control());
        request.perspective_outcomes = due;

        match self.store.process_work_batch(request).await {
            Ok(batch) => {
                self.tracker.complete_sent();
                self.router.route(batch);
            }
            Err(e) => {
                self.tracker.revert_sent(Utc::now());
                warn!(error = %e, "Work batch exchange failed; will retry");
            }
        }
    }
}

/// The processing half: folds claimed checkpoints forward.
pub struct PerspectiveStage<S> {
    store: Arc<S>,
    perspectives: Arc<PerspectiveRegistry>,
    tracker: Arc<CompletionTracker>,
    strategy: CompletionStrategy,
    config: CoordinatorConfig,
    identity: InstanceIdentity,
    running: Arc<AtomicBool>,
}

impl<S: WorkStore + 'static> PerspectiveStage<S> {
    pub fn new(
        store: Arc<S>,
        perspectives: Arc<PerspectiveRegistry>,
        tracker: Arc<CompletionTracker>,
        strategy: CompletionStrategy,
        config: CoordinatorConfig,
        identity: InstanceIdentity,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            perspectives,
            tracker,
            strategy,
            config,
            identity,
            running,
        }
    }

    pub async fn run(self, mut perspective_rx: mpsc::UnboundedReceiver<PerspectiveCheckpoint>) {
        info!(strategy = ?self.strategy, "Perspective stage started");
        while self.running.load(Ordering::Relaxed) {
            let checkpoint = tokio::select! {
                checkpoint = perspective_rx.recv() => checkpoint,
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => continue,
            };
            let Some(checkpoint) = checkpoint else { break };
            self.advance(checkpoint).await;
        }
        info!("Perspective stage stopped");
    }

    #[instrument(
        skip(self, checkpoint),
        fields(stream_id = %checkpoint.stream_id, perspective = %checkpoint.perspective_name)
    )]
    async fn advance(&self, checkpoint: PerspectiveCheckpoint) {
        let Some(perspective) = self.perspectives.get(&checkpoint.perspective_name) else {
            self.report(CheckpointOutcome {
                stream_id: checkpoint.stream_id.clone(),
                perspective_name: checkpoint.perspective_name.clone(),
                last_event_id: None,
                error: Some(format!(
                    "No perspective registered named {}",
                    checkpoint.perspective_name
                )),
                reason: FailureReason::Validation,
            })
            .await;
            return;
        };

        let events = match self
            .store
            .read_events(
                &checkpoint.stream_id,
                checkpoint.last_event_id,
                self.config.batch_size,
            )
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Event read failed");
                self.report(CheckpointOutcome {
                    stream_id: checkpoint.stream_id.clone(),
                    perspective_name: checkpoint.perspective_name.clone(),
                    last_event_id: None,
                    error: Some(e.to_string()),
                    reason: FailureReason::Unknown,
                })
                .await;
                return;
            }
        };

        if events.is_empty() {
            // Already folded up to the head; report the unchanged
            // boundary so the checkpoint settles as up to date.
            if let Some(last) = checkpoint.last_event_id {
                self.report(CheckpointOutcome {
                    stream_id: checkpoint.stream_id.clone(),
                    perspective_name: checkpoint.perspective_name.clone(),
                    last_event_id: Some(last),
                    error: None,
                    reason: FailureReason::None,
                })
                .await;
            }
            return;
        }

        let mut model = match self
            .store
            .load_model(&checkpoint.perspective_name, &checkpoint.stream_id)
            .await
        {
            Ok(model) => model.unwrap_or(serde_json::Value::Null),
            Err(e) => {
                warn!(error = %e, "Model load failed");
                return;
            }
        };

        for event in &events {
            model = perspective.apply(model, event);
        }

        if let Err(e) = self
            .store
            .save_model(&checkpoint.perspective_name, &checkpoint.stream_id, &model)
            .await
        {
            warn!(error = %e, "Model save failed");
            self.report(CheckpointOutcome {
                stream_id: checkpoint.stream_id.clone(),
                perspective_name: checkpoint.perspective_name.clone(),
                last_event_id: None,
                error: Some(e.to_string()),
                reason: FailureReason::Unknown,
            })
            .await;
            return;
        }

        let advanced_to = events.last().map(|e| e.event_id);
        debug!(events = events.len(), "Checkpoint advanced");
        self.report(CheckpointOutcome {
            stream_id: checkpoint.stream_id.clone(),
            perspective_name: checkpoint.perspective_name.clone(),
            last_event_id: advanced_to,
            error: None,
            reason: FailureReason::None,
        })
        .await;
    }

    async fn report(&self, outcome: CheckpointOutcome) {
        match self.strategy {
            CompletionStrategy::Batched => self.tracker.track(outcome),
            CompletionStrategy::Instant => {
                // A dedicated exchange that claims nothing: outcomes only.
                let mut control = self.config.control();
                control.batch_size = 0;
                let mut request = WorkBatchRequest::new(self.identity.clone(), control);
                request.perspective_outcomes = vec![outcome.clone()];
                if let Err(e) = self.store.process_work_batch(request).await {
                    warn!(error = %e, "Instant completion failed; falling back to batched");
                    self.tracker.track(outcome);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn outcome(stream: &str) -> CheckpointOutcome {
        CheckpointOutcome {
            stream_id: stream.to_string(),
            perspective_name: "OrderList".to_string(),
            last_event_id: Some(wb_domain::EventId::new()),
            error: None,
            reason: FailureReason::None,
        }
    }

    #[test]
    fn test_tracker_lifecycle_pending_sent_acknowledged() {
        let tracker = CompletionTracker::new(30);
        tracker.track(outcome("s-1"));
        assert_eq!(tracker.pending_count(), 1);

        let now = Utc::now();
        let due = tracker.take_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(tracker.sent_count(), 1);
        assert_eq!(tracker.pending_count(), 0);

        tracker.complete_sent();
        assert_eq!(tracker.sent_count(), 0);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_failed_exchange_reverts_with_backoff() {
        let tracker = CompletionTracker::new(30);
        tracker.track(outcome("s-1"));
        let now = Utc::now();

        tracker.take_due(now);
        tracker.revert_sent(now);
        assert_eq!(tracker.pending_count(), 1);

        // Backed off: not due immediately.
        assert!(tracker.take_due(now).is_empty());
        // Due again after the first backoff window (2 seconds).
        let later = now + Duration::seconds(3);
        assert_eq!(tracker.take_due(later).len(), 1);
    }

    #[test]
    fn test_stale_sent_entries_revert_after_timeout() {
        let tracker = CompletionTracker::new(5);
        tracker.track(outcome("s-1"));
        let now = Utc::now();
        tracker.take_due(now);

        // Within the timeout nothing changes.
        tracker.revert_stale(now + Duration::seconds(4));
        assert_eq!(tracker.sent_count(), 1);

        tracker.revert_stale(now + Duration::seconds(6));
        assert_eq!(tracker.sent_count(), 0);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let tracker = CompletionTracker::new(30);
        tracker.track(outcome("s-1"));
        let mut now = Utc::now();
        for _ in 0..10 {
            let due = tracker.take_due(now);
            if !due.is_empty() {
                tracker.revert_sent(now);
            }
            now += Duration::seconds(61);
        }
        // Even after many retries the entry keeps coming back within the
        // 60-second cap.
        assert_eq!(tracker.take_due(now + Duration::seconds(61)).len(), 1);
    }

    #[test]
    fn test_registry_associations_cover_every_event_type() {
        let mut registry = PerspectiveRegistry::new();
        registry.register_fn(
            "OrderList",
            &["orders.OrderCreated", "orders.OrderPaid"],
            |model, _event| model,
        );

        let mut associations = registry.associations("orders");
        associations.sort_by(|a, b| a.message_type.cmp(&b.message_type));
        assert_eq!(associations.len(), 2);
        assert!(associations
            .iter()
            .all(|a| a.kind == AssociationKind::Perspective && a.target_name == "OrderList"));
    }

    #[test]
    fn test_apply_purity_same_inputs_same_outputs() {
        let registry = {
            let mut r = PerspectiveRegistry::new();
            r.register_fn("Counter", &["orders.OrderCreated"], |model, event| {
                let count = model.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
                json!({"count": count + 1, "last_version": event.version})
            });
            r
        };
        let perspective = registry.get("Counter").unwrap();

        let event = EventRecord::new(
            "order-1",
            Uuid::now_v7(),
            "Order",
            3,
            "orders.OrderCreated",
            json!({}),
        );
        let model = json!({"count": 2});

        let once = perspective.apply(model.clone(), &event);
        let twice = perspective.apply(model.clone(), &event);
        assert_eq!(once, twice);
        assert_eq!(once, json!({"count": 3, "last_version": 3}));
        // The input model is untouched.
        assert_eq!(model, json!({"count": 2}));
    }
}

//! In-memory work store
//!
//! A complete implementation of the work store contract held in process
//! memory behind a single mutex, which is what makes every exchange
//! atomic. Tests and local runs use it in place of PostgreSQL; the
//! semantics (outcomes before claims, lease discipline, stale-instance
//! GC, checkpoint auto-creation, conflict detection) are identical.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use wb_domain::{
    AssociationKind, CheckpointStatus, EventId, EventRecord, FailureReason, InstanceId,
    MessageAssociation, MessageId, PerspectiveCheckpoint, ServiceInstance, StatusFlags,
    WorkMessage,
};
use wb_ports::{
    AckCounts, Clock, Completion, FailureOutcome, SystemClock, WorkBatch, WorkBatchRequest,
    WorkStore, WorkStoreError,
};

#[derive(Default)]
struct StoreState {
    instances: BTreeMap<InstanceId, ServiceInstance>,
    outbox: BTreeMap<MessageId, WorkMessage>,
    inbox: BTreeMap<MessageId, WorkMessage>,
    events: Vec<EventRecord>,
    event_stream_keys: BTreeSet<(String, u64)>,
    event_aggregate_keys: BTreeSet<(Uuid, u64)>,
    checkpoints: BTreeMap<(String, String), PerspectiveCheckpoint>,
    associations: BTreeSet<MessageAssociation>,
    dedup: BTreeMap<MessageId, DateTime<Utc>>,
    models: BTreeMap<(String, String), serde_json::Value>,
    /// Tombstones for rows deleted on completion, so re-reported
    /// completions are absorbed as no-ops.
    completed_outbox: BTreeSet<MessageId>,
    completed_inbox: BTreeSet<MessageId>,
}

/// In-memory work store.
pub struct MemoryWorkStore {
    clock: Arc<dyn Clock>,
    ready: AtomicBool,
    state: Mutex<StoreState>,
}

impl Default for MemoryWorkStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryWorkStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ready: AtomicBool::new(true),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Flip the readiness probe; workers skip their exchange while false.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Number of live instance rows (visible for tests).
    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    /// Whether an instance row exists (visible for tests).
    pub fn has_instance(&self, instance_id: InstanceId) -> bool {
        self.state.lock().unwrap().instances.contains_key(&instance_id)
    }

    /// Look up an outbox row (visible for tests).
    pub fn outbox_row(&self, message_id: MessageId) -> Option<WorkMessage> {
        self.state.lock().unwrap().outbox.get(&message_id).cloned()
    }

    /// Look up an inbox row (visible for tests).
    pub fn inbox_row(&self, message_id: MessageId) -> Option<WorkMessage> {
        self.state.lock().unwrap().inbox.get(&message_id).cloned()
    }

    /// Look up a checkpoint (visible for tests).
    pub fn checkpoint(&self, stream_id: &str, perspective_name: &str) -> Option<PerspectiveCheckpoint> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .get(&(stream_id.to_string(), perspective_name.to_string()))
            .cloned()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.state.lock().unwrap().checkpoints.len()
    }

    fn apply_completions(
        rows: &mut BTreeMap<MessageId, WorkMessage>,
        tombstones: &mut BTreeSet<MessageId>,
        completions: &[Completion],
        now: DateTime<Utc>,
        done: StatusFlags,
        debug_mode: bool,
        acked: &mut usize,
    ) {
        for completion in completions {
            *acked += 1;
            let Some(row) = rows.get_mut(&completion.message_id) else {
                // Already completed and deleted; absorb the duplicate.
                continue;
            };
            row.status |= completion.status;
            if completion.status.contains(StatusFlags::PUBLISHED) && row.published_at.is_none() {
                row.published_at = Some(now);
            }
            if completion.status.contains(StatusFlags::PROCESSED) && row.processed_at.is_none() {
                row.processed_at = Some(now);
            }
            row.instance_id = None;
            row.lease_expiry = None;

            if row.status.contains(done) && !debug_mode {
                rows.remove(&completion.message_id);
                tombstones.insert(completion.message_id);
            }
        }
    }

    fn apply_failures(
        rows: &mut BTreeMap<MessageId, WorkMessage>,
        failures: &[FailureOutcome],
        max_attempts: u32,
        acked: &mut usize,
    ) {
        for failure in failures {
            *acked += 1;
            let Some(row) = rows.get_mut(&failure.message_id) else {
                continue;
            };
            row.attempts += 1;
            row.error = Some(failure.error.clone());
            row.failure_reason = failure.reason;
            row.instance_id = None;
            row.lease_expiry = None;

            if failure.reason.dead_letters()
                || (failure.reason == FailureReason::Unknown && row.attempts >= max_attempts)
            {
                row.status |= StatusFlags::DEAD_LETTERED;
            } else if failure.reason.is_permanent() {
                row.status |= StatusFlags::FAILED;
            }
            // Retryable reasons leave the row unleased and claimable.
        }
    }

    fn renew_leases(
        rows: &mut BTreeMap<MessageId, WorkMessage>,
        ids: &[MessageId],
        holder: InstanceId,
        lease_until: DateTime<Utc>,
        acked: &mut usize,
    ) {
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.instance_id == Some(holder) {
                    row.lease_expiry = Some(lease_until);
                    *acked += 1;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn claim_rows(
        rows: &mut BTreeMap<MessageId, WorkMessage>,
        now: DateTime<Utc>,
        done: StatusFlags,
        instance_id: InstanceId,
        instance_index: usize,
        instance_count: usize,
        lease_until: DateTime<Utc>,
        batch_size: usize,
        filter: impl Fn(&WorkMessage) -> bool,
    ) -> Vec<WorkMessage> {
        // A row is available when its lease is free or expired, or when the
        // caller itself holds it: deferred work (renewed leases) comes back
        // to its holder on the next exchange.
        let available = |row: &WorkMessage| {
            if row.status.contains(done) || row.status.is_terminal() {
                return false;
            }
            if row.scheduled_for.map(|s| s > now).unwrap_or(false) {
                return false;
            }
            row.is_claimable(now, done) || row.instance_id == Some(instance_id)
        };

        // BTreeMap iteration is message-id order, which is creation-time
        // order for UUIDv7 keys.
        let claimable: Vec<MessageId> = rows
            .values()
            .filter(|row| {
                available(row)
                    && wb_domain::partition::is_assigned(
                        row.partition_number,
                        instance_index,
                        instance_count,
                    )
                    && filter(row)
            })
            .take(batch_size)
            .map(|row| row.message_id)
            .collect();

        claimable
            .into_iter()
            .map(|id| {
                let row = rows.get_mut(&id).unwrap();
                row.instance_id = Some(instance_id);
                row.lease_expiry = Some(lease_until);
                row.clone()
            })
            .collect()
    }
}

impl WorkStore for MemoryWorkStore {
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> Result<WorkBatch, WorkStoreError> {
        let now = self.clock.now();
        let control = request.control;
        let caller = request.instance.instance_id;
        let lease_until = now + Duration::seconds(control.lease_seconds as i64);
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        // Validate event appends before mutating anything, so a conflict
        // aborts the exchange with the store untouched.
        let mut pending_stream_keys = BTreeSet::new();
        for event in &request.new_events {
            let stream_key = (event.stream_id.clone(), event.version);
            if state.event_stream_keys.contains(&stream_key)
                || state
                    .event_aggregate_keys
                    .contains(&(event.aggregate_id, event.version))
                || !pending_stream_keys.insert(stream_key)
            {
                return Err(WorkStoreError::Conflict {
                    stream_id: event.stream_id.clone(),
                    version: event.version,
                });
            }
        }

        let mut acknowledged = AckCounts::default();

        // 1. Heartbeat the caller.
        let identity = request.instance.clone();
        state
            .instances
            .entry(caller)
            .and_modify(|instance| instance.last_heartbeat_at = now)
            .or_insert_with(|| ServiceInstance {
                instance_id: caller,
                service_name: identity.service_name.clone(),
                host_name: identity.host_name.clone(),
                process_id: identity.process_id,
                started_at: now,
                last_heartbeat_at: now,
                metadata: identity.metadata.clone(),
            });

        // 2. Garbage-collect stale instances; their leases lapse on their
        // own, so nothing else needs touching.
        let stale_before = now - Duration::seconds(control.stale_threshold_seconds as i64);
        state
            .instances
            .retain(|_, instance| instance.last_heartbeat_at >= stale_before);

        // 3. Apply outcomes before any new claims.
        Self::apply_completions(
            &mut state.outbox,
            &mut state.completed_outbox,
            &request.outbox_completions,
            now,
            StatusFlags::PUBLISHED,
            control.debug_mode,
            &mut acknowledged.completions,
        );
        Self::apply_completions(
            &mut state.inbox,
            &mut state.completed_inbox,
            &request.inbox_completions,
            now,
            StatusFlags::PROCESSED,
            control.debug_mode,
            &mut acknowledged.completions,
        );
        Self::apply_completions(
            &mut state.inbox,
            &mut state.completed_inbox,
            &request.receptor_completions,
            now,
            StatusFlags::PROCESSED,
            control.debug_mode,
            &mut acknowledged.completions,
        );
        Self::apply_failures(
            &mut state.outbox,
            &request.outbox_failures,
            control.max_attempts,
            &mut acknowledged.failures,
        );
        Self::apply_failures(
            &mut state.inbox,
            &request.inbox_failures,
            control.max_attempts,
            &mut acknowledged.failures,
        );

        for outcome in &request.perspective_outcomes {
            acknowledged.completions += 1;
            let key = (outcome.stream_id.clone(), outcome.perspective_name.clone());
            let Some(checkpoint) = state.checkpoints.get_mut(&key) else {
                continue;
            };
            checkpoint.instance_id = None;
            checkpoint.lease_expiry = None;
            checkpoint.processed_at = Some(now);
            match outcome.last_event_id {
                Some(advanced_to) => {
                    // Monotonic advance only; a stale report never moves
                    // the checkpoint backwards.
                    if checkpoint.last_event_id.map(|cur| advanced_to > cur).unwrap_or(true) {
                        checkpoint.last_event_id = Some(advanced_to);
                    }
                    checkpoint.error = None;
                    let stream_head = state
                        .events
                        .iter()
                        .filter(|e| e.stream_id == outcome.stream_id)
                        .map(|e| e.event_id)
                        .max();
                    checkpoint.status = if stream_head == checkpoint.last_event_id {
                        CheckpointStatus::UpToDate
                    } else {
                        CheckpointStatus::Pending
                    };
                }
                None => {
                    checkpoint.error = outcome.error.clone();
                    checkpoint.status = if outcome.reason.is_retryable() {
                        CheckpointStatus::Pending
                    } else {
                        CheckpointStatus::Faulted
                    };
                }
            }
        }

        // 4. Extend leases for work the caller is deferring.
        Self::renew_leases(
            &mut state.outbox,
            &request.renew_outbox_leases,
            caller,
            lease_until,
            &mut acknowledged.renewals,
        );
        Self::renew_leases(
            &mut state.inbox,
            &request.renew_inbox_leases,
            caller,
            lease_until,
            &mut acknowledged.renewals,
        );

        // 5. Insert new work; duplicates absorbed by message-id uniqueness.
        for mut message in request.new_outbox {
            acknowledged.new_messages += 1;
            if state.outbox.contains_key(&message.message_id)
                || state.completed_outbox.contains(&message.message_id)
            {
                continue;
            }
            message.status |= StatusFlags::STORED;
            state.outbox.insert(message.message_id, message);
        }
        for mut message in request.new_inbox {
            acknowledged.new_messages += 1;
            if state.inbox.contains_key(&message.message_id)
                || state.completed_inbox.contains(&message.message_id)
            {
                continue;
            }
            message.status |= StatusFlags::STORED;
            state.inbox.insert(message.message_id, message);
        }

        // 6. Append events and auto-create perspective checkpoints.
        for event in request.new_events {
            acknowledged.new_events += 1;
            state
                .event_stream_keys
                .insert((event.stream_id.clone(), event.version));
            state
                .event_aggregate_keys
                .insert((event.aggregate_id, event.version));

            let perspectives: Vec<String> = state
                .associations
                .iter()
                .filter(|a| {
                    a.kind == AssociationKind::Perspective && a.message_type == event.event_type
                })
                .map(|a| a.target_name.clone())
                .collect();
            for perspective_name in perspectives {
                let key = (event.stream_id.clone(), perspective_name.clone());
                state
                    .checkpoints
                    .entry(key)
                    .and_modify(|cp| cp.status = CheckpointStatus::Pending)
                    .or_insert_with(|| {
                        PerspectiveCheckpoint::new(
                            &event.stream_id,
                            &perspective_name,
                            control.partition_count,
                        )
                    });
            }
            state.events.push(event);
        }

        // 7. Compute this caller's partition slice and claim work.
        let live: Vec<InstanceId> = state.instances.keys().copied().collect();
        let instance_count = live.len();
        let instance_index = live
            .iter()
            .position(|id| *id == caller)
            .expect("caller heartbeat was just recorded");

        let outbox = Self::claim_rows(
            &mut state.outbox,
            now,
            StatusFlags::PUBLISHED,
            caller,
            instance_index,
            instance_count,
            lease_until,
            control.batch_size,
            |_| true,
        );

        let service_name = identity.service_name.clone();
        let receptor_types: BTreeSet<String> = state
            .associations
            .iter()
            .filter(|a| a.kind == AssociationKind::Receptor && a.service_name == service_name)
            .map(|a| a.message_type.clone())
            .collect();

        let receptors = Self::claim_rows(
            &mut state.inbox,
            now,
            StatusFlags::PROCESSED,
            caller,
            instance_index,
            instance_count,
            lease_until,
            control.batch_size,
            |row| receptor_types.contains(&row.message_type),
        );
        let inbox = Self::claim_rows(
            &mut state.inbox,
            now,
            StatusFlags::PROCESSED,
            caller,
            instance_index,
            instance_count,
            lease_until,
            control.batch_size,
            |row| !receptor_types.contains(&row.message_type),
        );

        let mut perspectives = Vec::new();
        let claimable_checkpoints: Vec<(String, String)> = state
            .checkpoints
            .values()
            .filter(|cp| {
                cp.is_claimable(now)
                    && wb_domain::partition::is_assigned(
                        cp.partition_number,
                        instance_index,
                        instance_count,
                    )
            })
            .take(control.batch_size)
            .map(|cp| (cp.stream_id.clone(), cp.perspective_name.clone()))
            .collect();
        for key in claimable_checkpoints {
            let checkpoint = state.checkpoints.get_mut(&key).unwrap();
            checkpoint.instance_id = Some(caller);
            checkpoint.lease_expiry = Some(lease_until);
            perspectives.push(checkpoint.clone());
        }

        debug!(
            outbox = outbox.len(),
            inbox = inbox.len(),
            receptors = receptors.len(),
            perspectives = perspectives.len(),
            "Work batch exchanged"
        );

        Ok(WorkBatch {
            outbox,
            inbox,
            receptors,
            perspectives,
            acknowledged,
        })
    }

    async fn read_events(
        &self,
        stream_id: &str,
        after: Option<EventId>,
        limit: usize,
    ) -> Result<Vec<EventRecord>, WorkStoreError> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .filter(|e| after.map(|boundary| e.event_id > boundary).unwrap_or(true))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        events.truncate(limit);
        Ok(events)
    }

    async fn load_model(
        &self,
        perspective_name: &str,
        stream_id: &str,
    ) -> Result<Option<serde_json::Value>, WorkStoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .models
            .get(&(perspective_name.to_string(), stream_id.to_string()))
            .cloned())
    }

    async fn save_model(
        &self,
        perspective_name: &str,
        stream_id: &str,
        model: &serde_json::Value,
    ) -> Result<(), WorkStoreError> {
        let mut state = self.state.lock().unwrap();
        state.models.insert(
            (perspective_name.to_string(), stream_id.to_string()),
            model.clone(),
        );
        Ok(())
    }

    async fn record_dedup(&self, message_id: MessageId) -> Result<bool, WorkStoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        match state.dedup.entry(message_id) {
            std::collections::btree_map::Entry::Occupied(_) => Ok(false),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(now);
                Ok(true)
            }
        }
    }

    async fn register_association(
        &self,
        association: MessageAssociation,
    ) -> Result<(), WorkStoreError> {
        let mut state = self.state.lock().unwrap();
        state.associations.insert(association);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wb_domain::InstanceIdentity;
    use wb_ports::{BatchControl, ManualClock};

    fn identity(service: &str) -> InstanceIdentity {
        InstanceIdentity {
            instance_id: InstanceId::new(),
            service_name: service.to_string(),
            host_name: "test-host".to_string(),
            process_id: 42,
            metadata: BTreeMap::new(),
        }
    }

    fn control() -> BatchControl {
        BatchControl {
            partition_count: 64,
            lease_seconds: 5,
            stale_threshold_seconds: 10,
            batch_size: 100,
            max_attempts: 3,
            debug_mode: true,
        }
    }

    fn outbox_message(stream: &str) -> WorkMessage {
        WorkMessage::new(
            MessageId::new(),
            "orders",
            "orders.OrderCreated",
            json!({"v": 1}),
            stream,
            64,
        )
    }

    fn manual_store() -> (Arc<ManualClock>, MemoryWorkStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryWorkStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_insert_then_claim_in_one_exchange() {
        let (_, store) = manual_store();
        let id = identity("orders");
        let message = outbox_message("order-1");
        let message_id = message.message_id;

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_outbox.push(message);
        let batch = store.process_work_batch(request).await.unwrap();

        assert_eq!(batch.outbox.len(), 1);
        assert_eq!(batch.outbox[0].message_id, message_id);
        assert_eq!(batch.outbox[0].instance_id, Some(id.instance_id));
        assert_eq!(batch.acknowledged.new_messages, 1);
    }

    #[tokio::test]
    async fn test_completion_is_applied_before_claims() {
        let (_, store) = manual_store();
        let id = identity("orders");

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        let batch = store.process_work_batch(request).await.unwrap();
        let claimed = batch.outbox[0].message_id;

        // Report the publish and ask for more work in the same exchange;
        // the completed row must not come back.
        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.outbox_completions.push(Completion {
            message_id: claimed,
            status: StatusFlags::PUBLISHED,
        });
        let batch = store.process_work_batch(request).await.unwrap();
        assert!(batch.outbox.is_empty());
        assert_eq!(batch.acknowledged.completions, 1);

        let row = store.outbox_row(claimed).unwrap();
        assert!(row.status.contains(StatusFlags::PUBLISHED));
        assert!(row.published_at.is_some());
        assert!(row.instance_id.is_none());
    }

    #[tokio::test]
    async fn test_completed_rows_deleted_unless_debug_mode() {
        let (_, store) = manual_store();
        let id = identity("orders");
        let mut non_debug = control();
        non_debug.debug_mode = false;

        let mut request = WorkBatchRequest::new(id.clone(), non_debug);
        request.new_outbox.push(outbox_message("order-1"));
        let batch = store.process_work_batch(request).await.unwrap();
        let claimed = batch.outbox[0].message_id;

        let mut request = WorkBatchRequest::new(id.clone(), non_debug);
        request.outbox_completions.push(Completion {
            message_id: claimed,
            status: StatusFlags::PUBLISHED,
        });
        store.process_work_batch(request).await.unwrap();
        assert!(store.outbox_row(claimed).is_none());

        // A duplicate completion report is absorbed, not an error.
        let mut request = WorkBatchRequest::new(id.clone(), non_debug);
        request.outbox_completions.push(Completion {
            message_id: claimed,
            status: StatusFlags::PUBLISHED,
        });
        let batch = store.process_work_batch(request).await.unwrap();
        assert_eq!(batch.acknowledged.completions, 1);
    }

    #[tokio::test]
    async fn test_leased_row_is_invisible_to_other_instances() {
        let (_, store) = manual_store();
        let a = identity("orders");
        let b = identity("orders");

        let mut request = WorkBatchRequest::new(a.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        let batch = store.process_work_batch(request).await.unwrap();
        assert_eq!(batch.outbox.len(), 1);

        let batch = store
            .process_work_batch(WorkBatchRequest::new(b.clone(), control()))
            .await
            .unwrap();
        assert!(batch.outbox.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_and_stale_instance_reassignment() {
        let (clock, store) = manual_store();
        let a = identity("orders");
        let b = identity("orders");

        let mut request = WorkBatchRequest::new(a.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        let batch = store.process_work_batch(request).await.unwrap();
        let row_id = batch.outbox[0].message_id;

        // A crashes. Past the stale threshold, B's exchange GCs A and
        // claims the row whose lease has lapsed.
        clock.advance(Duration::seconds(11));
        let batch = store
            .process_work_batch(WorkBatchRequest::new(b.clone(), control()))
            .await
            .unwrap();
        assert_eq!(batch.outbox.len(), 1);
        assert_eq!(batch.outbox[0].message_id, row_id);
        assert_eq!(batch.outbox[0].instance_id, Some(b.instance_id));
        assert!(!store.has_instance(a.instance_id));
    }

    #[tokio::test]
    async fn test_lease_renewal_defers_reclaim() {
        let (clock, store) = manual_store();
        let a = identity("orders");
        let b = identity("orders");

        let mut request = WorkBatchRequest::new(a.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        let batch = store.process_work_batch(request).await.unwrap();
        let row_id = batch.outbox[0].message_id;

        // Renew at t+4 (lease would lapse at t+5); the new lease runs to
        // t+9. Deferred work comes back to its own holder.
        clock.advance(Duration::seconds(4));
        let mut request = WorkBatchRequest::new(a.clone(), control());
        request.renew_outbox_leases.push(row_id);
        let batch = store.process_work_batch(request).await.unwrap();
        assert_eq!(batch.acknowledged.renewals, 1);
        assert_eq!(batch.outbox.len(), 1);
        assert_eq!(batch.outbox[0].message_id, row_id);

        // At t+8 the original lease would have expired; the renewal keeps
        // the row invisible to B.
        clock.advance(Duration::seconds(4));
        let batch = store
            .process_work_batch(WorkBatchRequest::new(b.clone(), control()))
            .await
            .unwrap();
        assert!(batch.outbox.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failures_requeue_and_permanent_failures_park() {
        let (_, store) = manual_store();
        let id = identity("orders");

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        request.new_outbox.push(outbox_message("order-2"));
        let batch = store.process_work_batch(request).await.unwrap();
        let retryable = batch.outbox[0].message_id;
        let poisoned = batch.outbox[1].message_id;

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.outbox_failures.push(FailureOutcome {
            message_id: retryable,
            error: "connection reset".to_string(),
            reason: FailureReason::TransportException,
        });
        request.outbox_failures.push(FailureOutcome {
            message_id: poisoned,
            error: "unreadable payload".to_string(),
            reason: FailureReason::Serialization,
        });
        let batch = store.process_work_batch(request).await.unwrap();
        assert_eq!(batch.acknowledged.failures, 2);

        // The retryable row came straight back; the poisoned one is parked.
        assert_eq!(batch.outbox.len(), 1);
        assert_eq!(batch.outbox[0].message_id, retryable);
        assert_eq!(batch.outbox[0].attempts, 1);
        let parked = store.outbox_row(poisoned).unwrap();
        assert!(parked.status.contains(StatusFlags::FAILED));
    }

    #[tokio::test]
    async fn test_unknown_failures_dead_letter_at_the_attempt_ceiling() {
        let (_, store) = manual_store();
        let id = identity("orders");

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        let batch = store.process_work_batch(request).await.unwrap();
        let row_id = batch.outbox[0].message_id;

        for attempt in 1..=3u32 {
            let mut request = WorkBatchRequest::new(id.clone(), control());
            request.outbox_failures.push(FailureOutcome {
                message_id: row_id,
                error: "boom".to_string(),
                reason: FailureReason::Unknown,
            });
            store.process_work_batch(request).await.unwrap();
            let row = store.outbox_row(row_id).unwrap();
            assert_eq!(row.attempts, attempt);
        }

        let row = store.outbox_row(row_id).unwrap();
        assert!(row.status.contains(StatusFlags::DEAD_LETTERED));
    }

    #[tokio::test]
    async fn test_permanent_reject_dead_letters_immediately() {
        let (_, store) = manual_store();
        let id = identity("orders");

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        let batch = store.process_work_batch(request).await.unwrap();
        let row_id = batch.outbox[0].message_id;

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.outbox_failures.push(FailureOutcome {
            message_id: row_id,
            error: "rejected".to_string(),
            reason: FailureReason::PermanentReject,
        });
        let batch = store.process_work_batch(request).await.unwrap();
        assert!(batch.outbox.is_empty());
        let row = store.outbox_row(row_id).unwrap();
        assert!(row.status.contains(StatusFlags::DEAD_LETTERED));
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn test_event_append_conflict_aborts_the_exchange() {
        let (_, store) = manual_store();
        let id = identity("orders");
        let aggregate = Uuid::now_v7();

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_events.push(EventRecord::new(
            "order-1",
            aggregate,
            "Order",
            1,
            "OrderCreated",
            json!({}),
        ));
        store.process_work_batch(request).await.unwrap();

        // Same (stream, version) again: conflict, and the colliding
        // sibling outbox insert must not have happened either.
        let mut request = WorkBatchRequest::new(id.clone(), control());
        let side_effect = outbox_message("order-9");
        let side_effect_id = side_effect.message_id;
        request.new_outbox.push(side_effect);
        request.new_events.push(EventRecord::new(
            "order-1",
            Uuid::now_v7(),
            "Order",
            1,
            "OrderCreated",
            json!({}),
        ));
        let err = store.process_work_batch(request).await.unwrap_err();
        assert!(matches!(err, WorkStoreError::Conflict { version: 1, .. }));
        assert!(store.outbox_row(side_effect_id).is_none());
    }

    #[tokio::test]
    async fn test_perspective_association_auto_creates_checkpoint_once() {
        let (_, store) = manual_store();
        let id = identity("orders");

        store
            .register_association(MessageAssociation {
                message_type: "OrderCreated".to_string(),
                kind: AssociationKind::Perspective,
                target_name: "OrderList".to_string(),
                service_name: "orders".to_string(),
            })
            .await
            .unwrap();
        store
            .register_association(MessageAssociation {
                message_type: "OrderCreated".to_string(),
                kind: AssociationKind::Receptor,
                target_name: "order-receptor".to_string(),
                service_name: "orders".to_string(),
            })
            .await
            .unwrap();

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_events.push(EventRecord::new(
            "order-1",
            Uuid::now_v7(),
            "Order",
            1,
            "OrderCreated",
            json!({}),
        ));
        let batch = store.process_work_batch(request).await.unwrap();

        // One checkpoint from the perspective association; the receptor
        // association creates none. The checkpoint is claimable at once.
        assert_eq!(store.checkpoint_count(), 1);
        assert!(store.checkpoint("order-1", "OrderList").is_some());
        assert_eq!(batch.perspectives.len(), 1);

        // A second event on the stream does not duplicate it.
        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_events.push(EventRecord::new(
            "order-1",
            Uuid::now_v7(),
            "Order",
            2,
            "OrderCreated",
            json!({}),
        ));
        store.process_work_batch(request).await.unwrap();
        assert_eq!(store.checkpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_receptor_work_is_split_from_plain_inbox_work() {
        let (_, store) = manual_store();
        let id = identity("orders");

        store
            .register_association(MessageAssociation {
                message_type: "orders.OrderCreated".to_string(),
                kind: AssociationKind::Receptor,
                target_name: "order-receptor".to_string(),
                service_name: "orders".to_string(),
            })
            .await
            .unwrap();

        let mut request = WorkBatchRequest::new(id.clone(), control());
        let mut handled = outbox_message("order-1");
        handled.message_type = "orders.OrderCreated".to_string();
        let mut unhandled = outbox_message("order-2");
        unhandled.message_type = "orders.Unknown".to_string();
        request.new_inbox.push(handled);
        request.new_inbox.push(unhandled);
        let batch = store.process_work_batch(request).await.unwrap();

        assert_eq!(batch.receptors.len(), 1);
        assert_eq!(batch.receptors[0].message_type, "orders.OrderCreated");
        assert_eq!(batch.inbox.len(), 1);
        assert_eq!(batch.inbox[0].message_type, "orders.Unknown");
    }

    #[tokio::test]
    async fn test_partitions_split_between_live_instances() {
        let (_, store) = manual_store();
        let a = identity("orders");
        let b = identity("orders");

        // Make both instances known before seeding work.
        store
            .process_work_batch(WorkBatchRequest::new(a.clone(), control()))
            .await
            .unwrap();
        store
            .process_work_batch(WorkBatchRequest::new(b.clone(), control()))
            .await
            .unwrap();

        let mut request = WorkBatchRequest::new(a.clone(), control());
        for i in 0..40 {
            request.new_outbox.push(outbox_message(&format!("order-{}", i)));
        }
        let batch_a = store.process_work_batch(request).await.unwrap();
        let batch_b = store
            .process_work_batch(WorkBatchRequest::new(b.clone(), control()))
            .await
            .unwrap();

        // Between them they own every row exactly once.
        assert_eq!(batch_a.outbox.len() + batch_b.outbox.len(), 40);
        let ids_a: BTreeSet<MessageId> = batch_a.outbox.iter().map(|m| m.message_id).collect();
        let ids_b: BTreeSet<MessageId> = batch_b.outbox.iter().map(|m| m.message_id).collect();
        assert!(ids_a.is_disjoint(&ids_b));
        // With 40 distinct streams both sides get a share.
        assert!(!ids_a.is_empty());
        assert!(!ids_b.is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_exchange_with_unchanged_state() {
        let (_, store) = manual_store();
        let id = identity("orders");

        let mut request = WorkBatchRequest::new(id.clone(), control());
        request.new_outbox.push(outbox_message("order-1"));
        let first = store.process_work_batch(request.clone()).await.unwrap();
        // Same request again: the new message is absorbed by id
        // uniqueness, and the row comes back to its own holder with an
        // extended lease. Store state is as if the call ran once.
        let second = store.process_work_batch(request).await.unwrap();
        assert_eq!(first.outbox.len(), 1);
        assert_eq!(second.outbox.len(), 1);
        assert_eq!(second.outbox[0].message_id, first.outbox[0].message_id);
        assert_eq!(second.acknowledged.new_messages, 1);
        let row = store.outbox_row(first.outbox[0].message_id).unwrap();
        assert_eq!(row.instance_id, Some(id.instance_id));
        assert_eq!(row.attempts, 0);
    }

    #[tokio::test]
    async fn test_dedup_records_each_id_once() {
        let (_, store) = manual_store();
        let id = MessageId::new();
        assert!(store.record_dedup(id).await.unwrap());
        assert!(!store.record_dedup(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_events_after_boundary() {
        let (_, store) = manual_store();
        let id = identity("orders");
        let aggregate = Uuid::now_v7();

        let mut request = WorkBatchRequest::new(id.clone(), control());
        for version in 1..=3u64 {
            request.new_events.push(EventRecord::new(
                "order-1",
                aggregate,
                "Order",
                version,
                "OrderCreated",
                json!({"v": version}),
            ));
        }
        store.process_work_batch(request).await.unwrap();

        let all = store.read_events("order-1", None, 100).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let rest = store
            .read_events("order-1", Some(all[0].event_id), 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].version, 2);
    }
}

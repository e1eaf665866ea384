//! Consumer worker
//!
//! Three cooperating pieces:
//! - Ingest stages, one per subscription, pulling envelopes from a
//!   transport (continuously in processor mode, on an interval in polling
//!   mode), deduplicating, invoking receptors, and staging inbox rows.
//! - A coordinator loop owning the consumer's batch exchange.
//! - A receptor stage retrying claimed receptor work that failed on the
//!   ingest path, and rejecting inbox rows no receptor handles.
//!
//! Exactly-once processing comes from the dedup table: a transport may
//! redeliver, but only the first delivery reaches a receptor; later ones
//! are acknowledged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use chrono::Utc;
use wb_domain::{
    envelope::hop_meta, Envelope, FailureReason, InstanceIdentity, StatusFlags, WorkMessage,
};
use wb_policy::ExecutionStrategy;
use wb_ports::{
    Completion, FailureOutcome, SubscribeTarget, Subscription, SubscriptionMode, Transport,
    WorkBatchRequest, WorkStore,
};

use crate::config::CoordinatorConfig;
use crate::outcomes::Outcomes;
use crate::receptor::ReceptorRegistry;
use crate::router::WorkRouter;

/// Idle backoff for processor-mode subscriptions when the pull comes back
/// empty, milliseconds.
const PROCESSOR_IDLE_BACKOFF_MS: u64 = 25;

/// The coordinator half of the consumer worker.
pub struct ConsumerWorker<S> {
    store: Arc<S>,
    config: CoordinatorConfig,
    identity: InstanceIdentity,
    outcomes: Arc<Outcomes>,
    router: WorkRouter,
    running: Arc<AtomicBool>,
}

impl<S: WorkStore + 'static> ConsumerWorker<S> {
    pub fn new(
        store: Arc<S>,
        config: CoordinatorConfig,
        identity: InstanceIdentity,
        outcomes: Arc<Outcomes>,
        router: WorkRouter,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            config,
            identity,
            outcomes,
            router,
            running,
        }
    }

    pub async fn run_coordinator(self) {
        let interval = self.config.polling_interval();
        info!(
            interval_ms = self.config.polling_interval_ms,
            "Consumer coordinator started"
        );

        while self.running.load(Ordering::Relaxed) {
            self.tick().await;
            tokio::time::sleep(interval).await;
        }

        info!("Consumer coordinator stopped");
    }

    #[instrument(skip(self), fields(instance_id = %self.identity.instance_id))]
    async fn tick(&self) {
        if !self.store.is_ready().await {
            debug!("Database not ready; skipping exchange");
            return;
        }

        let completions = self.outcomes.inbox_completions.snapshot();
        let failures = self.outcomes.inbox_failures.snapshot();
        let receptor_completions = self.outcomes.receptor_completions.snapshot();
        let renewals = self.outcomes.renew_inbox.snapshot();
        let staged_inbox = self.outcomes.staged_inbox.snapshot();

        let mut request = WorkBatchRequest::new(self.identity.clone(), self.config.control());
        request.inbox_completions = completions.clone();
        request.inbox_failures = failures.clone();
        request.receptor_completions = receptor_completions.clone();
        request.renew_inbox_leases = renewals.clone();
        request.new_inbox = staged_inbox.clone();

        match self.store.process_work_batch(request).await {
            Ok(batch) => {
                self.outcomes.inbox_completions.ack(completions.len());
                self.outcomes.inbox_failures.ack(failures.len());
                self.outcomes.receptor_completions.ack(receptor_completions.len());
                self.outcomes.renew_inbox.ack(renewals.len());
                self.outcomes.staged_inbox.ack(staged_inbox.len());
                self.router.route(batch);
            }
            Err(e) => {
                warn!(error = %e, "Work batch exchange failed; will retry");
            }
        }
    }
}

// ============================================================================
// Ingest Stage
// ============================================================================

/// One subscription's pull loop.
pub struct IngestStage<S> {
    store: Arc<S>,
    receptors: Arc<ReceptorRegistry>,
    config: CoordinatorConfig,
    identity: InstanceIdentity,
    outcomes: Arc<Outcomes>,
    running: Arc<AtomicBool>,
}

impl<S: WorkStore + 'static> IngestStage<S> {
    pub fn new(
        store: Arc<S>,
        receptors: Arc<ReceptorRegistry>,
        config: CoordinatorConfig,
        identity: InstanceIdentity,
        outcomes: Arc<Outcomes>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            receptors,
            config,
            identity,
            outcomes,
            running,
        }
    }

    /// Drive one subscription until shutdown. Both consumption modes pull
    /// through the same seam; the mode only decides how long to sleep
    /// when the pull comes back empty.
    pub async fn run(self, transport: Arc<dyn Transport>, target: SubscribeTarget) {
        let idle_backoff = match target.mode {
            SubscriptionMode::Processor => {
                std::time::Duration::from_millis(PROCESSOR_IDLE_BACKOFF_MS)
            }
            SubscriptionMode::Polling => {
                std::time::Duration::from_millis(target.polling_interval_ms)
            }
        };

        let mut subscription = loop {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            match transport.subscribe(&target).await {
                Ok(subscription) => break subscription,
                Err(e) => {
                    warn!(topic = %target.topic, error = %e, "Subscribe failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        };

        info!(topic = %target.topic, consumer_group = %target.consumer_group, "Ingest started");

        while self.running.load(Ordering::Relaxed) {
            match subscription.receive().await {
                Ok(Some(envelope)) => {
                    self.handle_delivery(envelope, &target.topic).await;
                }
                Ok(None) => {
                    tokio::time::sleep(idle_backoff).await;
                }
                Err(e) => {
                    warn!(topic = %target.topic, error = %e, "Receive failed");
                    tokio::time::sleep(idle_backoff).await;
                }
            }
        }

        info!(topic = %target.topic, "Ingest stopped");
    }

    #[instrument(skip(self, envelope), fields(message_id = %envelope.message_id, topic = %topic))]
    async fn handle_delivery(&self, mut envelope: Envelope, topic: &str) {
        // Exactly-once guard: only the first delivery proceeds.
        match self.store.record_dedup(envelope.message_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Duplicate delivery dropped");
                return;
            }
            Err(e) => {
                // Leave the message to transport redelivery.
                warn!(error = %e, "Dedup check failed; deferring to redelivery");
                return;
            }
        }

        envelope.record_receipt(&self.identity.service_name, self.identity.instance_id, topic);

        let mut row = match inbox_row(&envelope, topic, self.config.partition_count) {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "Envelope not storable; dropping");
                return;
            }
        };

        match self.receptors.resolve(&envelope.payload_type) {
            Some(receptor) => match receptor.handle(&envelope).await {
                Ok(()) => {
                    row.status |= StatusFlags::PROCESSED;
                    row.processed_at = Some(Utc::now());
                    debug!("Receptor completed");
                }
                Err(e) => {
                    let reason = e.classify();
                    row.attempts = 1;
                    row.error = Some(e.to_string());
                    row.failure_reason = reason;
                    if reason.dead_letters() {
                        row.status |= StatusFlags::DEAD_LETTERED;
                    } else if reason.is_permanent() {
                        row.status |= StatusFlags::FAILED;
                    }
                    // Retryable failures leave the row claimable as
                    // receptor work on a future exchange.
                    warn!(error = %e, reason = ?reason, "Receptor failed");
                }
            },
            None => {
                row.error = Some(format!(
                    "No receptor registered for {}",
                    envelope.payload_type
                ));
                row.failure_reason = FailureReason::PermanentReject;
                row.status |= StatusFlags::DEAD_LETTERED;
                warn!(payload_type = %envelope.payload_type, "Unknown message type rejected");
            }
        }

        self.outcomes.staged_inbox.push(row);
    }
}

/// Build the durable inbox row for a received envelope. The stored
/// payload is the full envelope, receipt hop included; the stream id
/// comes from the publish hop's stream key.
fn inbox_row(
    envelope: &Envelope,
    topic: &str,
    partition_count: u32,
) -> Result<WorkMessage, serde_json::Error> {
    let stream_id = envelope
        .hops
        .iter()
        .rev()
        .find_map(|h| h.metadata.get(hop_meta::STREAM_KEY))
        .cloned()
        .unwrap_or_else(|| envelope.message_id.to_string());
    let payload = serde_json::to_value(envelope)?;
    let mut row = WorkMessage::new(
        envelope.message_id,
        topic,
        &envelope.payload_type,
        payload,
        &stream_id,
        partition_count,
    );
    row.scope = envelope.scope.clone();
    Ok(row)
}

// ============================================================================
// Receptor Stage
// ============================================================================

/// Executes claimed receptor work (the durable retry path) and rejects
/// inbox rows that no receptor handles.
pub struct ReceptorStage {
    receptors: Arc<ReceptorRegistry>,
    outcomes: Arc<Outcomes>,
    execution: ExecutionStrategy,
    running: Arc<AtomicBool>,
}

impl ReceptorStage {
    pub fn new(
        receptors: Arc<ReceptorRegistry>,
        outcomes: Arc<Outcomes>,
        execution: ExecutionStrategy,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            receptors,
            outcomes,
            execution,
            running,
        }
    }

    pub async fn run(
        self,
        mut receptor_rx: mpsc::UnboundedReceiver<WorkMessage>,
        mut inbox_rx: mpsc::UnboundedReceiver<WorkMessage>,
    ) {
        info!(execution = ?self.execution, "Receptor stage started");
        let mut tasks = tokio::task::JoinSet::new();
        let max_concurrency = match self.execution {
            ExecutionStrategy::Serial => 1,
            ExecutionStrategy::Parallel { max_concurrency } => max_concurrency.max(1),
        };

        while self.running.load(Ordering::Relaxed) {
            tokio::select! {
                message = receptor_rx.recv() => {
                    let Some(message) = message else { break };
                    while tasks.len() >= max_concurrency {
                        tasks.join_next().await;
                    }
                    let receptors = self.receptors.clone();
                    let outcomes = self.outcomes.clone();
                    tasks.spawn(async move {
                        execute_receptor_work(receptors, outcomes, message).await;
                    });
                }
                message = inbox_rx.recv() => {
                    let Some(message) = message else { break };
                    // Plain inbox work means no receptor association for
                    // this service; reject permanently rather than retry.
                    self.outcomes.inbox_failures.push(FailureOutcome {
                        message_id: message.message_id,
                        error: format!("No receptor registered for {}", message.message_type),
                        reason: FailureReason::PermanentReject,
                    });
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("Receptor stage stopped");
    }
}

async fn execute_receptor_work(
    receptors: Arc<ReceptorRegistry>,
    outcomes: Arc<Outcomes>,
    message: WorkMessage,
) {
    let envelope: Envelope = match serde_json::from_value(message.payload.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            outcomes.inbox_failures.push(FailureOutcome {
                message_id: message.message_id,
                error: format!("Unreadable stored envelope: {}", e),
                reason: FailureReason::Serialization,
            });
            return;
        }
    };

    match receptors.resolve(&envelope.payload_type) {
        Some(receptor) => match receptor.handle(&envelope).await {
            Ok(()) => {
                outcomes.receptor_completions.push(Completion {
                    message_id: message.message_id,
                    status: StatusFlags::PROCESSED,
                });
            }
            Err(e) => {
                outcomes.inbox_failures.push(FailureOutcome {
                    message_id: message.message_id,
                    error: e.to_string(),
                    reason: e.classify(),
                });
            }
        },
        None => {
            outcomes.inbox_failures.push(FailureOutcome {
                message_id: message.message_id,
                error: format!("No receptor registered for {}", envelope.payload_type),
                reason: FailureReason::PermanentReject,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wb_domain::InstanceId;

    #[test]
    fn test_inbox_row_uses_the_publish_hop_stream_key() {
        let mut envelope = Envelope::new("orders.OrderCreated", json!({"v": 1}));
        envelope.record_origin("orders", InstanceId::new(), "orders");
        envelope.record_publish("orders", InstanceId::new(), "orders", "order-7");
        envelope.record_receipt("billing", InstanceId::new(), "orders");

        let row = inbox_row(&envelope, "orders", 64).unwrap();
        assert_eq!(row.stream_id, "order-7");
        assert_eq!(row.message_id, envelope.message_id);
        assert_eq!(row.message_type, "orders.OrderCreated");

        let stored: Envelope = serde_json::from_value(row.payload).unwrap();
        assert_eq!(stored.hops.len(), 3);
    }

    #[test]
    fn test_inbox_row_falls_back_to_message_id_stream() {
        let mut envelope = Envelope::new("orders.OrderCreated", json!({}));
        envelope.record_origin("orders", InstanceId::new(), "orders");

        let row = inbox_row(&envelope, "orders", 64).unwrap();
        assert_eq!(row.stream_id, envelope.message_id.to_string());
    }

    #[tokio::test]
    async fn test_receptor_work_execution_reports_completion() {
        let mut registry = ReceptorRegistry::new();
        registry.register_fn("orders.OrderCreated", |_| async { Ok(()) });
        let receptors = Arc::new(registry);
        let outcomes = Arc::new(Outcomes::new());

        let mut envelope = Envelope::new("orders.OrderCreated", json!({}));
        envelope.record_origin("orders", InstanceId::new(), "orders");
        let row = inbox_row(&envelope, "orders", 64).unwrap();
        let id = row.message_id;

        execute_receptor_work(receptors, outcomes.clone(), row).await;
        let completions = outcomes.receptor_completions.snapshot();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].message_id, id);
        assert!(completions[0].status.contains(StatusFlags::PROCESSED));
    }

    #[tokio::test]
    async fn test_unknown_type_is_permanently_rejected() {
        let receptors = Arc::new(ReceptorRegistry::new());
        let outcomes = Arc::new(Outcomes::new());

        let mut envelope = Envelope::new("orders.Mystery", json!({}));
        envelope.record_origin("orders", InstanceId::new(), "orders");
        let row = inbox_row(&envelope, "orders", 64).unwrap();

        execute_receptor_work(receptors, outcomes.clone(), row).await;
        let failures = outcomes.inbox_failures.snapshot();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, FailureReason::PermanentReject);
    }
}

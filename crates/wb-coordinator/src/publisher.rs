//! Publisher worker
//!
//! Two cooperative tasks: a coordinator loop that owns the batch exchange
//! (reporting accumulated publish outcomes, staging dispatched messages,
//! receiving leased work) and a publish stage that drains the outbox
//! channel into the transports. They communicate only through the work
//! channel and the outcome bags.
//!
//! Deferral discipline: a transport that is not ready, or that fails with
//! a transport-class error, does not fail the row; the row's lease is
//! renewed and publish is retried on a future tick. Only non-transport
//! failures are reported as failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use wb_domain::{Envelope, InstanceIdentity, StatusFlags, WorkMessage};
use wb_ports::{
    Completion, FailureOutcome, PublishTarget, TopicRoutingStrategy, WorkBatchRequest, WorkStore,
    WorkStoreError,
};

use crate::config::CoordinatorConfig;
use crate::dispatcher::work_meta;
use crate::idle::IdleTracker;
use crate::outcomes::Outcomes;
use crate::router::{TransportSet, WorkRouter};

/// Consecutive not-ready polls before escalating to `warn`.
const NOT_READY_WARN_THRESHOLD: u32 = 10;

/// The coordinator half of the publisher worker.
pub struct PublisherWorker<S> {
    store: Arc<S>,
    config: CoordinatorConfig,
    identity: InstanceIdentity,
    outcomes: Arc<Outcomes>,
    router: WorkRouter,
    idle: IdleTracker,
    running: Arc<AtomicBool>,
}

impl<S: WorkStore + 'static> PublisherWorker<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        config: CoordinatorConfig,
        identity: InstanceIdentity,
        outcomes: Arc<Outcomes>,
        router: WorkRouter,
        idle: IdleTracker,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            config,
            identity,
            outcomes,
            router,
            idle,
            running,
        }
    }

    /// Run the coordinator loop. The first exchange happens immediately,
    /// before the first sleep, so pre-seeded messages do not wait a tick.
    pub async fn run_coordinator(mut self) {
        let interval = self.config.polling_interval();
        let mut not_ready = 0u32;
        info!(
            interval_ms = self.config.polling_interval_ms,
            "Publisher coordinator started"
        );

        while self.running.load(Ordering::Relaxed) {
            self.tick(&mut not_ready).await;
            tokio::time::sleep(interval).await;
        }

        info!("Publisher coordinator stopped");
    }

    #[instrument(skip(self), fields(instance_id = %self.identity.instance_id))]
    async fn tick(&mut self, not_ready: &mut u32) {
        if !self.store.is_ready().await {
            *not_ready += 1;
            if *not_ready >= NOT_READY_WARN_THRESHOLD {
                warn!(consecutive = *not_ready, "Database not ready");
            } else {
                info!(consecutive = *not_ready, "Database not ready; skipping exchange");
            }
            return;
        }
        *not_ready = 0;

        let completions = self.outcomes.outbox_completions.snapshot();
        let failures = self.outcomes.outbox_failures.snapshot();
        let renewals = self.outcomes.renew_outbox.snapshot();
        let staged_outbox = self.outcomes.staged_outbox.snapshot();
        let staged_events = self.outcomes.staged_events.snapshot();

        let mut request = WorkBatchRequest::new(self.identity.clone(), self.config.control());
        request.outbox_completions = completions.clone();
        request.outbox_failures = failures.clone();
        request.renew_outbox_leases = renewals.clone();
        request.new_outbox = staged_outbox.clone();
        request.new_events = staged_events.clone();

        match self.store.process_work_batch(request).await {
            Ok(batch) => {
                self.outcomes.outbox_completions.ack(completions.len());
                self.outcomes.outbox_failures.ack(failures.len());
                self.outcomes.renew_outbox.ack(renewals.len());
                self.outcomes.staged_outbox.ack(staged_outbox.len());
                self.outcomes.staged_events.ack(staged_events.len());

                self.idle.observe(batch.is_empty());
                self.router.route(batch);
            }
            Err(WorkStoreError::Conflict { stream_id, version }) => {
                // An optimistic concurrency conflict poisons the staged
                // events; drop them so the exchange can proceed. The
                // producer re-fetches the current version and reattempts.
                error!(
                    stream_id = %stream_id,
                    version = version,
                    dropped_events = staged_events.len(),
                    "Event append conflict; staged events dropped"
                );
                self.outcomes.staged_events.ack(staged_events.len());
            }
            Err(e) => {
                // Nothing happened; the same outcomes are resubmitted on
                // the next tick.
                warn!(error = %e, "Work batch exchange failed; will retry");
            }
        }
    }
}

/// The publish half: drains the outbox channel into the transports.
pub struct PublishStage {
    transports: Arc<TransportSet>,
    routing: Arc<dyn TopicRoutingStrategy>,
    identity: InstanceIdentity,
    outcomes: Arc<Outcomes>,
    running: Arc<AtomicBool>,
}

impl PublishStage {
    pub fn new(
        transports: Arc<TransportSet>,
        routing: Arc<dyn TopicRoutingStrategy>,
        identity: InstanceIdentity,
        outcomes: Arc<Outcomes>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transports,
            routing,
            identity,
            outcomes,
            running,
        }
    }

    pub async fn run(self, mut outbox_rx: mpsc::UnboundedReceiver<Vec<WorkMessage>>) {
        info!("Publish stage started");
        while self.running.load(Ordering::Relaxed) {
            let batch = tokio::select! {
                batch = outbox_rx.recv() => batch,
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => continue,
            };
            let Some(batch) = batch else { break };
            for message in batch {
                self.publish_one(message).await;
            }
        }
        info!("Publish stage stopped");
    }

    fn targets_for(&self, message: &WorkMessage) -> Result<Vec<PublishTarget>, String> {
        match message.metadata.get(work_meta::PUBLISH_TARGETS) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| e.to_string()),
            None => Ok(vec![PublishTarget::new(
                self.transports.default_name(),
                &message.destination,
            )]),
        }
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    async fn publish_one(&self, message: WorkMessage) {
        let targets = match self.targets_for(&message) {
            Ok(targets) => targets,
            Err(e) => {
                self.outcomes.outbox_failures.push(FailureOutcome {
                    message_id: message.message_id,
                    error: format!("Unreadable publish targets: {}", e),
                    reason: wb_domain::FailureReason::Serialization,
                });
                return;
            }
        };

        // Defer the whole message while any of its transports is not
        // ready; the row stays leased and is retried next tick.
        let mut resolved = Vec::with_capacity(targets.len());
        for target in &targets {
            let Some(transport) = self.transports.get(&target.transport) else {
                self.outcomes.outbox_failures.push(FailureOutcome {
                    message_id: message.message_id,
                    error: format!("Unknown transport: {}", target.transport),
                    reason: wb_domain::FailureReason::Validation,
                });
                return;
            };
            if !transport.is_ready() {
                debug!(transport = %target.transport, "Transport not ready; renewing lease");
                self.outcomes.renew_outbox.push(message.message_id);
                return;
            }
            resolved.push((transport, target));
        }

        let mut envelope: Envelope = match serde_json::from_value(message.payload.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.outcomes.outbox_failures.push(FailureOutcome {
                    message_id: message.message_id,
                    error: format!("Unreadable stored envelope: {}", e),
                    reason: wb_domain::FailureReason::Serialization,
                });
                return;
            }
        };
        envelope.record_publish(
            &self.identity.service_name,
            self.identity.instance_id,
            &message.destination,
            &message.stream_id,
        );

        for (transport, target) in &resolved {
            for destination in self.routing.resolve(&target.destination, &message.stream_id) {
                if let Err(e) = transport.publish(&envelope, &destination).await {
                    let reason = e.classify();
                    if reason == wb_domain::FailureReason::TransportException {
                        debug!(error = %e, "Transport publish failed; renewing lease");
                        self.outcomes.renew_outbox.push(message.message_id);
                    } else {
                        self.outcomes.outbox_failures.push(FailureOutcome {
                            message_id: message.message_id,
                            error: e.to_string(),
                            reason,
                        });
                    }
                    return;
                }
            }
        }

        self.outcomes.outbox_completions.push(Completion {
            message_id: message.message_id,
            status: StatusFlags::PUBLISHED,
        });
        debug!("Message published");
    }
}

//! Supervisor
//!
//! Builds and runs the three worker loops plus their processing stages,
//! registers message associations with the store, initializes transports,
//! and stops everything cooperatively on shutdown. In-flight exchanges
//! run to completion (the loops check the running flag between ticks);
//! abandoned publishes are reclaimed by lease expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use wb_domain::{InstanceId, InstanceIdentity};
use wb_policy::{ExecutionStrategy, PolicyEngine};
use wb_ports::{DirectTopicRouting, SubscribeTarget, TopicRoutingStrategy, WorkStore, WorkStoreError};

use crate::config::CoordinatorConfig;
use crate::consumer::{ConsumerWorker, IngestStage, ReceptorStage};
use crate::dispatcher::Dispatcher;
use crate::idle::IdleTracker;
use crate::outcomes::Outcomes;
use crate::perspective::{
    CompletionStrategy, CompletionTracker, PerspectiveRegistry, PerspectiveStage, PerspectiveWorker,
};
use crate::publisher::{PublishStage, PublisherWorker};
use crate::receptor::ReceptorRegistry;
use crate::router::{TransportSet, WorkRouter};

/// Sent-completion timeout before the tracker reverts an unresolved
/// perspective completion, seconds.
const COMPLETION_SENT_TIMEOUT_SECS: i64 = 30;

/// Graceful shutdown window per task before it is aborted.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Store error during startup: {0}")]
    Store(#[from] WorkStoreError),

    #[error("Subscription names unknown transport: {name}")]
    UnknownTransport { name: String },
}

/// Builder for the worker runtime.
pub struct WorkCoordinatorBuilder<S> {
    store: Arc<S>,
    config: CoordinatorConfig,
    engine: Arc<PolicyEngine>,
    transports: TransportSet,
    routing: Arc<dyn TopicRoutingStrategy>,
    receptors: ReceptorRegistry,
    perspectives: PerspectiveRegistry,
    subscriptions: Vec<SubscribeTarget>,
    completion_strategy: CompletionStrategy,
    execution: ExecutionStrategy,
    on_idle: Option<Box<dyn Fn() + Send + Sync>>,
    on_started: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<S: WorkStore + 'static> WorkCoordinatorBuilder<S> {
    pub fn new(
        store: Arc<S>,
        config: CoordinatorConfig,
        engine: Arc<PolicyEngine>,
        default_transport: Arc<dyn wb_ports::Transport>,
    ) -> Self {
        Self {
            store,
            config,
            engine,
            transports: TransportSet::new(default_transport),
            routing: Arc::new(DirectTopicRouting),
            receptors: ReceptorRegistry::new(),
            perspectives: PerspectiveRegistry::new(),
            subscriptions: Vec::new(),
            completion_strategy: CompletionStrategy::Batched,
            execution: ExecutionStrategy::Serial,
            on_idle: None,
            on_started: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn wb_ports::Transport>) -> Self {
        self.transports.insert(transport);
        self
    }

    pub fn topic_routing(mut self, routing: Arc<dyn TopicRoutingStrategy>) -> Self {
        self.routing = routing;
        self
    }

    pub fn receptors(mut self, receptors: ReceptorRegistry) -> Self {
        self.receptors = receptors;
        self
    }

    pub fn perspectives(mut self, perspectives: PerspectiveRegistry) -> Self {
        self.perspectives = perspectives;
        self
    }

    pub fn subscribe(mut self, target: SubscribeTarget) -> Self {
        self.subscriptions.push(target);
        self
    }

    pub fn completion_strategy(mut self, strategy: CompletionStrategy) -> Self {
        self.completion_strategy = strategy;
        self
    }

    pub fn execution_strategy(mut self, execution: ExecutionStrategy) -> Self {
        self.execution = execution;
        self
    }

    /// Callback raised after the configured number of consecutive empty
    /// publisher batches.
    pub fn on_idle(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_idle = Some(Box::new(callback));
        self
    }

    /// Callback raised on the first non-empty publisher batch after idle.
    pub fn on_started(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_started = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> WorkCoordinator<S> {
        WorkCoordinator { builder: self }
    }
}

/// The assembled, not-yet-started runtime.
pub struct WorkCoordinator<S> {
    builder: WorkCoordinatorBuilder<S>,
}

impl<S: WorkStore + 'static> WorkCoordinator<S> {
    /// Start the worker loops. Returns a handle owning the dispatcher and
    /// the shutdown switch.
    pub async fn start(self) -> Result<CoordinatorHandle, StartError> {
        let b = self.builder;
        let identity = b.config.new_identity();
        info!(
            instance_id = %identity.instance_id,
            service = %b.config.service_name,
            "Starting work coordinator"
        );

        // Validate subscriptions before spawning anything.
        for target in &b.subscriptions {
            if b.transports.get(&target.transport).is_none() {
                return Err(StartError::UnknownTransport {
                    name: target.transport.clone(),
                });
            }
        }

        // Transports that fail to initialize stay not-ready; the
        // publisher defers their messages via lease renewal.
        for transport in b.transports.all() {
            if let Err(e) = transport.initialize().await {
                warn!(transport = %transport.name(), error = %e, "Transport initialization failed");
            }
        }

        // Declare this service's associations.
        for association in b
            .receptors
            .associations(&b.config.service_name)
            .into_iter()
            .chain(b.perspectives.associations(&b.config.service_name))
        {
            b.store.register_association(association).await?;
        }

        let outcomes = Arc::new(Outcomes::new());
        let tracker = Arc::new(CompletionTracker::new(COMPLETION_SENT_TIMEOUT_SECS));
        let transports = Arc::new(b.transports);
        let receptors = Arc::new(b.receptors);
        let perspectives = Arc::new(b.perspectives);
        let running = Arc::new(AtomicBool::new(true));
        let (router, channels) = WorkRouter::channel();

        let mut idle = IdleTracker::new(b.config.idle_threshold_polls);
        if let Some(callback) = b.on_idle {
            idle.on_idle(callback);
        }
        if let Some(callback) = b.on_started {
            idle.on_started(callback);
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Publisher: coordinator + publish stage.
        let publisher = PublisherWorker::new(
            b.store.clone(),
            b.config.clone(),
            identity.clone(),
            outcomes.clone(),
            router.clone(),
            idle,
            running.clone(),
        );
        tasks.push(tokio::spawn(publisher.run_coordinator()));

        let publish_stage = PublishStage::new(
            transports.clone(),
            b.routing.clone(),
            identity.clone(),
            outcomes.clone(),
            running.clone(),
        );
        tasks.push(tokio::spawn(publish_stage.run(channels.outbox_rx)));

        // Consumer: coordinator + ingest per subscription + receptor stage.
        let consumer = ConsumerWorker::new(
            b.store.clone(),
            b.config.clone(),
            identity.clone(),
            outcomes.clone(),
            router.clone(),
            running.clone(),
        );
        tasks.push(tokio::spawn(consumer.run_coordinator()));

        for target in b.subscriptions {
            let transport = transports
                .get(&target.transport)
                .expect("subscriptions were validated above");
            let ingest = IngestStage::new(
                b.store.clone(),
                receptors.clone(),
                b.config.clone(),
                identity.clone(),
                outcomes.clone(),
                running.clone(),
            );
            tasks.push(tokio::spawn(ingest.run(transport, target)));
        }

        let receptor_stage = ReceptorStage::new(
            receptors.clone(),
            outcomes.clone(),
            b.execution,
            running.clone(),
        );
        tasks.push(tokio::spawn(
            receptor_stage.run(channels.receptor_rx, channels.inbox_rx),
        ));

        // Perspective: coordinator + stage.
        let perspective_worker = PerspectiveWorker::new(
            b.store.clone(),
            b.config.clone(),
            identity.clone(),
            tracker.clone(),
            router.clone(),
            running.clone(),
        );
        tasks.push(tokio::spawn(perspective_worker.run_coordinator()));

        let perspective_stage = PerspectiveStage::new(
            b.store.clone(),
            perspectives.clone(),
            tracker.clone(),
            b.completion_strategy,
            b.config.clone(),
            identity.clone(),
            running.clone(),
        );
        tasks.push(tokio::spawn(perspective_stage.run(channels.perspective_rx)));

        let dispatcher = Arc::new(Dispatcher::new(
            b.engine,
            b.config,
            identity.clone(),
            outcomes.clone(),
        ));

        Ok(CoordinatorHandle {
            running,
            tasks,
            dispatcher,
            identity,
        })
    }
}

/// Handle to a running coordinator.
pub struct CoordinatorHandle {
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
    identity: InstanceIdentity,
}

impl CoordinatorHandle {
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.identity.instance_id
    }

    /// Stop all loops cooperatively. Loops finish their current tick
    /// (in-flight exchanges complete); tasks that outlive the grace
    /// window are aborted and their leases lapse.
    pub async fn shutdown(mut self) {
        info!(instance_id = %self.identity.instance_id, "Shutting down work coordinator");
        self.running.store(false, Ordering::Relaxed);

        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!("Worker task did not stop in time; aborting");
                task.abort();
            }
        }
        info!("Work coordinator stopped");
    }
}

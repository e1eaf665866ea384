//! Work store port: the batch coordinator contract
//!
//! The store exposes one atomic exchange, `process_work_batch`: the caller
//! reports everything that happened since its last call and receives its
//! next slice of leased work. Outcomes are applied before new claims, so a
//! retrying instance can never both report a success and receive the same
//! row again. Any error aborts the whole exchange; the caller treats it as
//! "nothing happened" and resubmits the same arrays on the next tick.

use std::future::Future;

use serde::{Deserialize, Serialize};
use wb_domain::{
    EventId, EventRecord, FailureReason, InstanceIdentity, MessageAssociation, MessageId,
    PerspectiveCheckpoint, StatusFlags, WorkMessage,
};

/// A successfully handled work row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub message_id: MessageId,
    /// Status bits to OR into the row, e.g. `PUBLISHED` or `PROCESSED`.
    pub status: StatusFlags,
}

/// A failed work row with its classified reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureOutcome {
    pub message_id: MessageId,
    pub error: String,
    pub reason: FailureReason,
}

/// Outcome of advancing one perspective checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    pub stream_id: String,
    pub perspective_name: String,
    /// Last event folded; `None` reports a failure without progress.
    pub last_event_id: Option<EventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reason: FailureReason,
}

/// Knobs the caller passes on every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchControl {
    pub partition_count: u32,
    pub lease_seconds: u32,
    pub stale_threshold_seconds: u32,
    /// Upper bound on rows claimed per entity class per call.
    pub batch_size: usize,
    /// Attempt ceiling for `Unknown` failures before dead-lettering.
    pub max_attempts: u32,
    /// Preserve completed rows instead of deleting them.
    pub debug_mode: bool,
}

impl Default for BatchControl {
    fn default() -> Self {
        Self {
            partition_count: 10_000,
            lease_seconds: 300,
            stale_threshold_seconds: 600,
            batch_size: 100,
            max_attempts: 5,
            debug_mode: false,
        }
    }
}

/// Everything an instance reports and requests in one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkBatchRequest {
    pub instance: InstanceIdentity,
    pub outbox_completions: Vec<Completion>,
    pub outbox_failures: Vec<FailureOutcome>,
    pub inbox_completions: Vec<Completion>,
    pub inbox_failures: Vec<FailureOutcome>,
    pub receptor_completions: Vec<Completion>,
    pub perspective_outcomes: Vec<CheckpointOutcome>,
    pub new_outbox: Vec<WorkMessage>,
    pub new_inbox: Vec<WorkMessage>,
    pub new_events: Vec<EventRecord>,
    /// Rows that stay claimed but could not be published this tick.
    pub renew_outbox_leases: Vec<MessageId>,
    pub renew_inbox_leases: Vec<MessageId>,
    pub control: BatchControl,
}

impl WorkBatchRequest {
    pub fn new(instance: InstanceIdentity, control: BatchControl) -> Self {
        Self {
            instance,
            outbox_completions: Vec::new(),
            outbox_failures: Vec::new(),
            inbox_completions: Vec::new(),
            inbox_failures: Vec::new(),
            receptor_completions: Vec::new(),
            perspective_outcomes: Vec::new(),
            new_outbox: Vec::new(),
            new_inbox: Vec::new(),
            new_events: Vec::new(),
            renew_outbox_leases: Vec::new(),
            renew_inbox_leases: Vec::new(),
            control,
        }
    }
}

/// Counts acknowledging what the store consumed from the request. The
/// caller holds its outcome bags until these confirm consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckCounts {
    pub completions: usize,
    pub failures: usize,
    pub renewals: usize,
    pub new_messages: usize,
    pub new_events: usize,
}

/// Work newly leased to the calling instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkBatch {
    pub outbox: Vec<WorkMessage>,
    pub inbox: Vec<WorkMessage>,
    /// Inbox rows whose message type has a receptor association for the
    /// calling service.
    pub receptors: Vec<WorkMessage>,
    pub perspectives: Vec<PerspectiveCheckpoint>,
    pub acknowledged: AckCounts,
}

impl WorkBatch {
    /// No work of any kind was leased; feeds the idle tracker.
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty()
            && self.inbox.is_empty()
            && self.receptors.is_empty()
            && self.perspectives.is_empty()
    }
}

/// Work store errors
#[derive(Debug, thiserror::Error)]
pub enum WorkStoreError {
    /// Optimistic concurrency collision on event append. The caller
    /// re-fetches the current version and reattempts.
    #[error("Version conflict on stream {stream_id} at version {version}")]
    Conflict { stream_id: String, version: u64 },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Store misconfiguration: {message}")]
    Misconfigured { message: String },
}

/// The relational store behind the work coordinator.
pub trait WorkStore: Send + Sync {
    /// The single atomic exchange: apply reported outcomes, renew leases,
    /// insert new work, auto-create checkpoints, then claim and return the
    /// caller's next batch. All or nothing.
    fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> impl Future<Output = Result<WorkBatch, WorkStoreError>> + Send;

    /// Read events on a stream after the given event id, oldest first.
    fn read_events(
        &self,
        stream_id: &str,
        after: Option<EventId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<EventRecord>, WorkStoreError>> + Send;

    /// Load a perspective's read model for one stream.
    fn load_model(
        &self,
        perspective_name: &str,
        stream_id: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, WorkStoreError>> + Send;

    /// Persist a perspective's read model for one stream.
    fn save_model(
        &self,
        perspective_name: &str,
        stream_id: &str,
        model: &serde_json::Value,
    ) -> impl Future<Output = Result<(), WorkStoreError>> + Send;

    /// Record a message id as seen. Returns `true` the first time, `false`
    /// when the id was already recorded — the exactly-once guard for
    /// replaying transports.
    fn record_dedup(
        &self,
        message_id: MessageId,
    ) -> impl Future<Output = Result<bool, WorkStoreError>> + Send;

    /// Register a message association (receptor or perspective binding).
    fn register_association(
        &self,
        association: MessageAssociation,
    ) -> impl Future<Output = Result<(), WorkStoreError>> + Send;

    /// Readiness probe; workers skip the exchange while this is false.
    fn is_ready(&self) -> impl Future<Output = bool> + Send;
}

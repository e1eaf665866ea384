//! Dispatcher
//!
//! The producer-facing entry point. A message handed to the dispatcher is
//! evaluated against the policy engine, wrapped in an envelope with an
//! origin hop, sharded onto its stream's partition, and staged for the
//! next batch exchange, which writes it durably to the outbox. From there
//! the publisher worker owns it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use wb_domain::{
    envelope::hop_meta, AggregateMessage, DomainMessage, Envelope, EventId, EventRecord, MessageId,
    SecurityScope, WorkMessage,
};
use wb_policy::{PolicyContext, PolicyEngine};

use crate::config::CoordinatorConfig;
use crate::outcomes::Outcomes;

/// Work-message metadata keys the dispatcher writes and the publisher
/// reads back.
pub mod work_meta {
    /// JSON-encoded publish target list from the winning policy.
    pub const PUBLISH_TARGETS: &str = "publish_targets";
    /// JSON-encoded policy decision trail (debug mode only).
    pub const POLICY_TRAIL: &str = "policy_trail";
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No policy matched and no catch-all was registered. This is a
    /// configuration error, not a message error.
    #[error("No policy matched message type {message_type}")]
    NoPolicyMatched { message_type: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

/// Per-send options: envelope metadata, scope, and causation.
#[derive(Default)]
pub struct SendOptions {
    pub tags: Vec<String>,
    pub flags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub scope: Option<SecurityScope>,
    /// The message being handled when this one was created.
    pub caused_by: Option<Envelope>,
}

impl SendOptions {
    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn flag(mut self, flag: &str) -> Self {
        self.flags.push(flag.to_string());
        self
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn scope(mut self, scope: SecurityScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn caused_by(mut self, parent: &Envelope) -> Self {
        self.caused_by = Some(parent.clone());
        self
    }
}

/// The producer-facing dispatcher.
pub struct Dispatcher {
    engine: Arc<PolicyEngine>,
    config: CoordinatorConfig,
    identity: wb_domain::InstanceIdentity,
    outcomes: Arc<Outcomes>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<PolicyEngine>,
        config: CoordinatorConfig,
        identity: wb_domain::InstanceIdentity,
        outcomes: Arc<Outcomes>,
    ) -> Self {
        Self {
            engine,
            config,
            identity,
            outcomes,
        }
    }

    /// Route a message and stage it for the outbox.
    pub fn send<M: DomainMessage>(&self, message: &M) -> Result<MessageId, DispatchError> {
        self.dispatch(message, SendOptions::default(), None)
    }

    /// Route a message with explicit options.
    pub fn send_with<M: DomainMessage>(
        &self,
        message: &M,
        options: SendOptions,
    ) -> Result<MessageId, DispatchError> {
        self.dispatch(message, options, None)
    }

    /// Route an aggregate event; policies can match on the aggregate.
    pub fn send_aggregate<M: AggregateMessage>(
        &self,
        message: &M,
    ) -> Result<MessageId, DispatchError> {
        self.dispatch(
            message,
            SendOptions::default(),
            Some((M::AGGREGATE, message.aggregate_id())),
        )
    }

    /// Stage an event-store append. Versions are the optimistic
    /// concurrency handle: an append at an already-taken version surfaces
    /// as a conflict on the next exchange.
    pub fn append_event<M: AggregateMessage>(
        &self,
        message: &M,
        version: u64,
    ) -> Result<EventId, DispatchError> {
        let stream_id = message.stream_hint().unwrap_or_else(|| {
            format!(
                "{}-{}",
                M::AGGREGATE.to_lowercase(),
                message.aggregate_id()
            )
        });
        let event_data =
            serde_json::to_value(message).map_err(|e| DispatchError::Serialization {
                message: e.to_string(),
            })?;
        let record = EventRecord::new(
            &stream_id,
            message.aggregate_id(),
            M::AGGREGATE,
            version,
            M::PAYLOAD_TYPE,
            event_data,
        );
        let event_id = record.event_id;
        self.outcomes.staged_events.push(record);
        Ok(event_id)
    }

    fn dispatch<M: DomainMessage>(
        &self,
        message: &M,
        options: SendOptions,
        aggregate: Option<(&str, Uuid)>,
    ) -> Result<MessageId, DispatchError> {
        let payload = serde_json::to_value(message).map_err(|e| DispatchError::Serialization {
            message: e.to_string(),
        })?;

        let mut envelope = Envelope::new(M::PAYLOAD_TYPE, payload);
        if let Some(scope) = options.scope {
            envelope.scope = Some(scope);
        }
        envelope.record_origin(
            &self.identity.service_name,
            self.identity.instance_id,
            "",
        );
        if let Some(origin) = envelope.hops.first_mut() {
            if !options.tags.is_empty() {
                origin
                    .metadata
                    .insert("tags".to_string(), options.tags.join(","));
            }
            for flag in &options.flags {
                origin.metadata.insert(flag.clone(), "true".to_string());
            }
            for (key, value) in &options.metadata {
                origin.metadata.insert(key.clone(), value.clone());
            }
        }
        if let Some(parent) = &options.caused_by {
            envelope.caused_by(parent);
        }

        let mut ctx = PolicyContext::new(&envelope, &self.config.environment, Utc::now());
        if let Some((aggregate_type, aggregate_id)) = aggregate {
            ctx = ctx.with_aggregate(aggregate_type, aggregate_id);
        }

        let outcome = self.engine.evaluate(&ctx);
        let Some(policy_config) = outcome.configuration else {
            return Err(DispatchError::NoPolicyMatched {
                message_type: M::PAYLOAD_TYPE.to_string(),
            });
        };

        let stream_hint = message.stream_hint();
        let stream_key = policy_config
            .stream_key
            .resolve(&ctx, stream_hint.as_deref());
        let partition = policy_config
            .partition_router
            .route(&stream_key, policy_config.partition_count);
        drop(ctx);

        if let Some(origin) = envelope.hops.first_mut() {
            origin.topic = policy_config.topic.clone();
            if self.config.debug_mode {
                if let Ok(trail_json) = serde_json::to_string(&outcome.trail) {
                    origin
                        .metadata
                        .insert(hop_meta::POLICY_TRAIL.to_string(), trail_json);
                }
            }
        }

        let envelope_json =
            serde_json::to_value(&envelope).map_err(|e| DispatchError::Serialization {
                message: e.to_string(),
            })?;

        let mut work = WorkMessage::new(
            envelope.message_id,
            &policy_config.topic,
            M::PAYLOAD_TYPE,
            envelope_json,
            &stream_key,
            policy_config.partition_count,
        );
        work.partition_number = partition;
        work.scope = envelope.scope.clone();
        if !policy_config.publish_targets.is_empty() {
            work.metadata.insert(
                work_meta::PUBLISH_TARGETS.to_string(),
                serde_json::to_string(&policy_config.publish_targets).map_err(|e| {
                    DispatchError::Serialization {
                        message: e.to_string(),
                    }
                })?,
            );
        }
        if self.config.debug_mode {
            work.metadata.insert(
                work_meta::POLICY_TRAIL.to_string(),
                serde_json::to_string(&outcome.trail).map_err(|e| {
                    DispatchError::Serialization {
                        message: e.to_string(),
                    }
                })?,
            );
        }

        let message_id = envelope.message_id;
        self.outcomes.staged_outbox.push(work);
        Ok(message_id)
    }
}

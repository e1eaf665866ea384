//! Transport port: publish/subscribe with readiness signalling
//!
//! The core treats every transport uniformly: at-least-once publish keyed
//! on `MessageId` for broker-side idempotency, pull-based subscriptions,
//! and a readiness probe the publisher consults before each attempt. The
//! traits are object-safe (boxed futures) so a process can hold a mixed
//! set of transports behind one map.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use wb_domain::{partition::stream_hash, Envelope, FailureReason};

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not ready")]
    NotReady,

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Publish error: {message}")]
    Publish { message: String },

    #[error("Subscribe error: {message}")]
    Subscribe { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl TransportError {
    /// Map onto the work-row failure taxonomy. Broker trouble renews the
    /// lease; malformed payloads fail permanently.
    pub fn classify(&self) -> FailureReason {
        match self {
            Self::NotReady | Self::Connection { .. } | Self::Publish { .. } | Self::Subscribe { .. } => {
                FailureReason::TransportException
            }
            Self::Serialization { .. } => FailureReason::Serialization,
        }
    }
}

/// How a subscription is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Transport-driven continuous delivery (production).
    #[default]
    Processor,
    /// The worker pulls on an interval (emulators and tests).
    Polling,
}

/// Where a transport publishes a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub transport: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

impl PublishTarget {
    pub fn new(transport: &str, destination: &str) -> Self {
        Self {
            transport: transport.to_string(),
            destination: destination.to_string(),
            routing_key: None,
        }
    }
}

/// What a consumer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeTarget {
    pub transport: String,
    pub topic: String,
    /// Consumer group / subscription / queue, depending on the broker.
    pub consumer_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub mode: SubscriptionMode,
    /// Pull interval for `Polling` mode, milliseconds.
    pub polling_interval_ms: u64,
}

impl SubscribeTarget {
    pub fn new(transport: &str, topic: &str, consumer_group: &str) -> Self {
        Self {
            transport: transport.to_string(),
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            filter: None,
            mode: SubscriptionMode::Processor,
            polling_interval_ms: 500,
        }
    }

    pub fn polling(mut self, interval_ms: u64) -> Self {
        self.mode = SubscriptionMode::Polling;
        self.polling_interval_ms = interval_ms;
        self
    }
}

/// An open subscription streaming envelopes to the consumer worker.
pub trait Subscription: Send {
    /// Next envelope, or `None` when the subscription has drained/closed.
    /// At-least-once: redelivery after a crash is expected and absorbed by
    /// the inbox dedup.
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Envelope>, TransportError>>;
}

/// A message broker adapter.
pub trait Transport: Send + Sync {
    /// Name used by publish/subscribe targets to pick this transport.
    fn name(&self) -> &str;

    /// One-time startup handshake.
    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Readiness probe; the publisher defers (renewing leases) while false.
    fn is_ready(&self) -> bool;

    /// Publish an envelope at-least-once. Resending the same `MessageId`
    /// must be idempotent on the broker side.
    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Open a subscription.
    fn subscribe<'a>(
        &'a self,
        target: &'a SubscribeTarget,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>, TransportError>>;
}

// ============================================================================
// Topic Routing
// ============================================================================

/// Maps a logical topic to physical destinations.
pub trait TopicRoutingStrategy: Send + Sync {
    /// Destination(s) for publishing one message on `topic`.
    fn resolve(&self, topic: &str, stream_id: &str) -> Vec<String>;

    /// Every physical topic a subscriber of `topic` must consume.
    fn subscription_topics(&self, topic: &str) -> Vec<String>;
}

/// The default 1:1 mapping.
pub struct DirectTopicRouting;

impl TopicRoutingStrategy for DirectTopicRouting {
    fn resolve(&self, topic: &str, _stream_id: &str) -> Vec<String> {
        vec![topic.to_string()]
    }

    fn subscription_topics(&self, topic: &str) -> Vec<String> {
        vec![topic.to_string()]
    }
}

/// Hash-distributes messages across `topic-00 … topic-(N-1)` so consumer
/// configurations stay simple on brokers with weak filter support.
/// Subscribers consume all generic topics and filter in-process.
pub struct GenericTopicRouting {
    fan_out: u32,
}

impl GenericTopicRouting {
    pub fn new(fan_out: u32) -> Self {
        assert!(fan_out > 0, "fan_out must be positive");
        Self { fan_out }
    }
}

impl TopicRoutingStrategy for GenericTopicRouting {
    fn resolve(&self, topic: &str, stream_id: &str) -> Vec<String> {
        let slot = stream_hash(stream_id) % self.fan_out as u64;
        vec![format!("{}-{:02}", topic, slot)]
    }

    fn subscription_topics(&self, topic: &str) -> Vec<String> {
        (0..self.fan_out)
            .map(|slot| format!("{}-{:02}", topic, slot))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert_eq!(
            TransportError::NotReady.classify(),
            FailureReason::TransportException
        );
        assert_eq!(
            TransportError::Publish {
                message: "broker refused".to_string()
            }
            .classify(),
            FailureReason::TransportException
        );
        assert_eq!(
            TransportError::Serialization {
                message: "bad json".to_string()
            }
            .classify(),
            FailureReason::Serialization
        );
    }

    #[test]
    fn test_direct_routing_is_identity() {
        let routing = DirectTopicRouting;
        assert_eq!(routing.resolve("orders", "order-1"), vec!["orders"]);
        assert_eq!(routing.subscription_topics("orders"), vec!["orders"]);
    }

    #[test]
    fn test_generic_routing_is_stable_and_bounded() {
        let routing = GenericTopicRouting::new(4);
        let a = routing.resolve("orders", "order-1");
        let b = routing.resolve("orders", "order-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert!(a[0].starts_with("orders-"));

        let subs = routing.subscription_topics("orders");
        assert_eq!(
            subs,
            vec!["orders-00", "orders-01", "orders-02", "orders-03"]
        );
        // Every resolved destination is one a subscriber consumes.
        assert!(subs.contains(&a[0]));
    }

    #[test]
    fn test_subscribe_target_polling_builder() {
        let target = SubscribeTarget::new("memory", "orders", "billing").polling(250);
        assert_eq!(target.mode, SubscriptionMode::Polling);
        assert_eq!(target.polling_interval_ms, 250);
    }
}

//! NATS JetStream transport
//!
//! Implements the transport port over NATS JetStream:
//! - One JetStream stream per logical topic, created on first use
//! - Publish with `Nats-Msg-Id` set to the message id, so broker-side
//!   duplicate detection absorbs resends of the same message
//! - Durable pull consumers per consumer group; both processor and
//!   polling consumption modes pull through the same seam
//! - Envelope identity, hops, and scope travel as message headers; the
//!   payload is the message body

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy, DeliverPolicy, ReplayPolicy},
    stream::Config as StreamConfig,
    Context as JetStreamContext,
};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

use wb_domain::Envelope;
use wb_ports::{SubscribeTarget, Subscription, Transport, TransportError};

/// NATS JetStream configuration
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// Stream/subject prefix for Whizbang topics
    pub stream_prefix: String,
    /// Message TTL in seconds (default: 7 days)
    pub message_ttl_secs: u64,
    /// Duplicate detection window in seconds (default: 2 minutes)
    pub duplicate_window_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_prefix: "wb".to_string(),
            message_ttl_secs: 7 * 24 * 60 * 60,
            duplicate_window_secs: 120,
        }
    }
}

impl NatsConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            stream_prefix: std::env::var("NATS_STREAM_PREFIX").unwrap_or_else(|_| "wb".to_string()),
            message_ttl_secs: std::env::var("NATS_MESSAGE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7 * 24 * 60 * 60),
            duplicate_window_secs: std::env::var("NATS_DUPLICATE_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(120),
        }
    }
}

/// NATS JetStream transport implementation
pub struct NatsTransport {
    name: String,
    jetstream: JetStreamContext,
    config: NatsConfig,
    initialized: AtomicBool,
}

impl NatsTransport {
    /// Connect to NATS and initialize JetStream
    pub async fn connect(name: &str, config: NatsConfig) -> Result<Self, TransportError> {
        info!(url = %config.url, "Connecting to NATS");

        let client =
            async_nats::connect(&config.url)
                .await
                .map_err(|e| TransportError::Connection {
                    message: format!("Failed to connect to NATS: {}", e),
                })?;
        let jetstream = jetstream::new(client);

        Ok(Self {
            name: name.to_string(),
            jetstream,
            config,
            initialized: AtomicBool::new(false),
        })
    }

    fn stream_name(&self, topic: &str) -> String {
        format!("{}-{}", self.config.stream_prefix, topic)
    }

    fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.config.stream_prefix, topic)
    }

    /// Create or update the stream backing a topic
    async fn ensure_stream(&self, topic: &str) -> Result<(), TransportError> {
        let stream_name = self.stream_name(topic);
        let config = StreamConfig {
            name: stream_name.clone(),
            subjects: vec![self.subject(topic)],
            max_age: std::time::Duration::from_secs(self.config.message_ttl_secs),
            duplicate_window: std::time::Duration::from_secs(self.config.duplicate_window_secs),
            ..Default::default()
        };

        match self.jetstream.get_stream(&stream_name).await {
            Ok(_) => {
                debug!(stream = %stream_name, "Stream exists, updating config");
                self.jetstream.update_stream(config).await.map_err(|e| {
                    TransportError::Connection {
                        message: format!("Failed to update stream: {}", e),
                    }
                })?;
            }
            Err(_) => {
                info!(stream = %stream_name, "Creating new stream");
                self.jetstream.create_stream(config).await.map_err(|e| {
                    TransportError::Connection {
                        message: format!("Failed to create stream: {}", e),
                    }
                })?;
            }
        }

        Ok(())
    }
}

impl Transport for NatsTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            // Connection is already established; a round-trip through the
            // JetStream API confirms the server speaks JetStream.
            self.jetstream
                .query_account()
                .await
                .map_err(|e| TransportError::Connection {
                    message: format!("JetStream not available: {}", e),
                })?;
            self.initialized.store(true, Ordering::Relaxed);
            info!("NATS JetStream transport initialized");
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    #[allow(clippy::needless_lifetimes)]
    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.is_ready() {
                return Err(TransportError::NotReady);
            }
            self.ensure_stream(destination).await?;

            let mut headers = async_nats::HeaderMap::new();
            // Broker-side duplicate detection keys on the message id.
            headers.insert("Nats-Msg-Id", envelope.message_id.to_string());
            for (name, value) in envelope.to_headers().map_err(|e| {
                TransportError::Serialization {
                    message: e.to_string(),
                }
            })? {
                headers.insert(name.as_str(), value.as_str());
            }

            let payload =
                serde_json::to_vec(&envelope.payload).map_err(|e| TransportError::Serialization {
                    message: e.to_string(),
                })?;

            let ack = self
                .jetstream
                .publish_with_headers(self.subject(destination), headers, payload.into())
                .await
                .map_err(|e| TransportError::Publish {
                    message: format!("Failed to publish: {}", e),
                })?;

            // Wait for ack from JetStream
            ack.await.map_err(|e| TransportError::Publish {
                message: format!("Failed to get publish ack: {}", e),
            })?;

            debug!(destination = %destination, message_id = %envelope.message_id, "Envelope published");
            Ok(())
        })
    }

    #[allow(clippy::needless_lifetimes)]
    fn subscribe<'a>(
        &'a self,
        target: &'a SubscribeTarget,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>, TransportError>> {
        Box::pin(async move {
            self.ensure_stream(&target.topic).await?;

            let stream = self
                .jetstream
                .get_stream(self.stream_name(&target.topic))
                .await
                .map_err(|e| TransportError::Subscribe {
                    message: format!("Failed to get stream: {}", e),
                })?;

            let durable_name = format!("{}-{}", self.config.stream_prefix, target.consumer_group);
            let consumer_config = PullConsumerConfig {
                durable_name: Some(durable_name.clone()),
                ack_policy: AckPolicy::Explicit,
                deliver_policy: DeliverPolicy::All,
                replay_policy: ReplayPolicy::Instant,
                filter_subject: target.filter.clone().unwrap_or_default(),
                ..Default::default()
            };

            let consumer = stream
                .get_or_create_consumer(&durable_name, consumer_config)
                .await
                .map_err(|e| TransportError::Subscribe {
                    message: format!("Failed to create consumer: {}", e),
                })?;

            info!(
                topic = %target.topic,
                consumer = %durable_name,
                "Subscription opened"
            );

            Ok(Box::new(NatsSubscription { consumer }) as Box<dyn Subscription>)
        })
    }
}

/// One open pull-consumer subscription.
pub struct NatsSubscription {
    consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
}

impl Subscription for NatsSubscription {
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Envelope>, TransportError>> {
        Box::pin(async move {
            let mut messages = self
                .consumer
                .fetch()
                .max_messages(1)
                .messages()
                .await
                .map_err(|e| TransportError::Connection {
                    message: format!("Failed to fetch messages: {}", e),
                })?;

            let Some(message) = messages.next().await else {
                return Ok(None);
            };
            let message = message.map_err(|e| TransportError::Connection {
                message: format!("Failed to receive message: {}", e),
            })?;

            let mut header_map = BTreeMap::new();
            if let Some(nats_headers) = &message.headers {
                for (name, value) in nats_headers.iter() {
                    if let Some(first) = value.first() {
                        header_map.insert(name.to_string(), first.as_str().to_string());
                    }
                }
            }

            let payload: serde_json::Value = serde_json::from_slice(&message.payload)
                .map_err(|e| TransportError::Serialization {
                    message: e.to_string(),
                })?;

            match Envelope::from_headers(&header_map, payload) {
                Ok(envelope) => {
                    // At-least-once: ack after handoff; a crash before the
                    // inbox write redelivers, and dedup absorbs it.
                    if let Err(e) = message.ack().await {
                        warn!(error = %e, "Failed to ack message");
                    }
                    Ok(Some(envelope))
                }
                Err(e) => {
                    // Malformed envelope: terminate so it does not loop.
                    warn!(error = %e, "Discarding undecodable message");
                    if let Err(term_err) = message
                        .ack_with(jetstream::message::AckKind::Term)
                        .await
                    {
                        warn!(error = %term_err, "Failed to terminate message");
                    }
                    Err(TransportError::Serialization {
                        message: e.to_string(),
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.stream_prefix, "wb");
        assert_eq!(config.duplicate_window_secs, 120);
    }

    #[test]
    fn test_stream_and_subject_naming() {
        let config = NatsConfig::default();
        assert_eq!(format!("{}-{}", config.stream_prefix, "orders"), "wb-orders");
        assert_eq!(format!("{}.{}", config.stream_prefix, "orders"), "wb.orders");
    }
}

//! Policy configuration: what the winning policy decides for a message
//!
//! Topic, stream key, partitioning, execution strategy, and the publish
//! and subscribe targets. Defaults give the standard configuration: hash
//! partition routing and serial execution, which together preserve
//! per-stream ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use wb_domain::partition::partition_for_stream;
use wb_ports::{PublishTarget, SubscribeTarget};

use crate::context::PolicyContext;

/// Default number of hash buckets streams shard into.
pub const DEFAULT_PARTITION_COUNT: u32 = 10_000;

/// The ordering boundary for a message.
#[derive(Clone)]
pub enum StreamKey {
    /// Use the message's own stream hint, falling back to its id (every
    /// message its own stream).
    PerMessage,
    /// A constant stream for all matched messages.
    Fixed(String),
    /// Computed from the evaluation context.
    Computed(Arc<dyn Fn(&PolicyContext<'_>) -> String + Send + Sync>),
}

impl StreamKey {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&PolicyContext<'_>) -> String + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    pub fn resolve(&self, ctx: &PolicyContext<'_>, stream_hint: Option<&str>) -> String {
        match self {
            Self::PerMessage => stream_hint
                .map(|s| s.to_string())
                .unwrap_or_else(|| ctx.envelope.message_id.to_string()),
            Self::Fixed(key) => key.clone(),
            Self::Computed(f) => f(ctx),
        }
    }
}

impl std::fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerMessage => write!(f, "PerMessage"),
            Self::Fixed(key) => f.debug_tuple("Fixed").field(key).finish(),
            Self::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

/// How a stream key maps to a partition number.
#[derive(Clone)]
pub enum PartitionRouter {
    /// Stable hash of the stream key; the standard, ordering-preserving
    /// configuration.
    Hash,
    /// Spreads messages evenly regardless of stream; forfeits per-stream
    /// ordering.
    RoundRobin(Arc<AtomicU64>),
}

impl PartitionRouter {
    pub fn round_robin() -> Self {
        Self::RoundRobin(Arc::new(AtomicU64::new(0)))
    }

    pub fn route(&self, stream_key: &str, partition_count: u32) -> u32 {
        match self {
            Self::Hash => partition_for_stream(stream_key, partition_count),
            Self::RoundRobin(cursor) => {
                (cursor.fetch_add(1, Ordering::Relaxed) % partition_count as u64) as u32
            }
        }
    }
}

impl std::fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hash => write!(f, "Hash"),
            Self::RoundRobin(_) => write!(f, "RoundRobin"),
        }
    }
}

/// How matched messages are executed on the consuming side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// One at a time, in order. Required for per-stream ordering.
    Serial,
    /// Concurrently, up to `max_concurrency` in flight.
    Parallel { max_concurrency: usize },
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::Serial
    }
}

/// Pluggable monotonic sequence generator per stream.
pub trait SequenceProvider: Send + Sync {
    fn next(&self, stream_id: &str) -> u64;
}

/// Process-local sequence provider; per-stream counters starting at 1.
#[derive(Default)]
pub struct InMemorySequenceProvider {
    counters: Mutex<std::collections::HashMap<String, u64>>,
}

impl InMemorySequenceProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceProvider for InMemorySequenceProvider {
    fn next(&self, stream_id: &str) -> u64 {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(stream_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// The configuration the winning policy builds for a message.
#[derive(Clone)]
pub struct PolicyConfiguration {
    /// Logical routing destination.
    pub topic: String,
    pub stream_key: StreamKey,
    pub partition_count: u32,
    pub partition_router: PartitionRouter,
    pub execution: ExecutionStrategy,
    pub sequence_provider: Option<Arc<dyn SequenceProvider>>,
    pub publish_targets: Vec<PublishTarget>,
    pub subscribe_targets: Vec<SubscribeTarget>,
}

impl Default for PolicyConfiguration {
    fn default() -> Self {
        Self {
            topic: String::new(),
            stream_key: StreamKey::PerMessage,
            partition_count: DEFAULT_PARTITION_COUNT,
            partition_router: PartitionRouter::Hash,
            execution: ExecutionStrategy::Serial,
            sequence_provider: None,
            publish_targets: Vec::new(),
            subscribe_targets: Vec::new(),
        }
    }
}

impl std::fmt::Debug for PolicyConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyConfiguration")
            .field("topic", &self.topic)
            .field("stream_key", &self.stream_key)
            .field("partition_count", &self.partition_count)
            .field("partition_router", &self.partition_router)
            .field("execution", &self.execution)
            .field("publish_targets", &self.publish_targets)
            .field("subscribe_targets", &self.subscribe_targets)
            .finish()
    }
}

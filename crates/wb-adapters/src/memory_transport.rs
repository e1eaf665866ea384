//! In-memory transport
//!
//! A broker shim backed by per-consumer-group queues. Publishing delivers
//! one copy of the envelope to every consumer group subscribed to the
//! destination; replaying the same `MessageId` to the same destination is
//! absorbed, mirroring broker-side duplicate detection. Tests use it both
//! as the fan-out broker and, via `inject`, to force the redeliveries the
//! inbox dedup must absorb.

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use wb_domain::{Envelope, MessageId};
use wb_ports::{SubscribeTarget, Subscription, Transport, TransportError};

#[derive(Default)]
struct BusState {
    /// destination -> consumer group -> pending envelopes.
    queues: HashMap<String, HashMap<String, VecDeque<Envelope>>>,
    /// Broker-side duplicate detection window.
    seen: HashSet<(String, MessageId)>,
    /// Everything ever accepted, for test assertions.
    published: Vec<(String, MessageId)>,
}

struct Inner {
    name: String,
    initialized: AtomicBool,
    ready: AtomicBool,
    state: Mutex<BusState>,
}

/// In-memory transport shim.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                initialized: AtomicBool::new(false),
                ready: AtomicBool::new(true),
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    /// Flip the readiness probe; the publisher defers while false.
    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::Relaxed);
    }

    /// Message ids accepted for a destination, in publish order.
    pub fn published(&self, destination: &str) -> Vec<MessageId> {
        let state = self.inner.state.lock().unwrap();
        state
            .published
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Total accepted publishes across destinations.
    pub fn published_count(&self) -> usize {
        self.inner.state.lock().unwrap().published.len()
    }

    /// Deliver an envelope to every group on `destination`, bypassing the
    /// duplicate window. Simulates broker redelivery.
    pub fn inject(&self, destination: &str, envelope: Envelope) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(groups) = state.queues.get_mut(destination) {
            for queue in groups.values_mut() {
                queue.push_back(envelope.clone());
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner.initialized.store(true, Ordering::Relaxed);
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        self.inner.initialized.load(Ordering::Relaxed) && self.inner.ready.load(Ordering::Relaxed)
    }

    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.is_ready() {
                return Err(TransportError::NotReady);
            }
            let mut state = self.inner.state.lock().unwrap();
            let key = (destination.to_string(), envelope.message_id);
            if !state.seen.insert(key) {
                // Same message id resent; idempotent accept.
                debug!(message_id = %envelope.message_id, "Duplicate publish absorbed");
                return Ok(());
            }
            state
                .published
                .push((destination.to_string(), envelope.message_id));
            if let Some(groups) = state.queues.get_mut(destination) {
                for queue in groups.values_mut() {
                    queue.push_back(envelope.clone());
                }
            }
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        target: &'a SubscribeTarget,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>, TransportError>> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            state
                .queues
                .entry(target.topic.clone())
                .or_default()
                .entry(target.consumer_group.clone())
                .or_default();
            drop(state);

            Ok(Box::new(MemorySubscription {
                inner: self.inner.clone(),
                topic: target.topic.clone(),
                consumer_group: target.consumer_group.clone(),
                filter: target.filter.clone(),
            }) as Box<dyn Subscription>)
        })
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    consumer_group: String,
    filter: Option<String>,
}

impl Subscription for MemorySubscription {
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Envelope>, TransportError>> {
        Box::pin(async move {
            loop {
                let next = {
                    let mut state = self.inner.state.lock().unwrap();
                    state
                        .queues
                        .get_mut(&self.topic)
                        .and_then(|groups| groups.get_mut(&self.consumer_group))
                        .and_then(|queue| queue.pop_front())
                };
                match next {
                    Some(envelope) => {
                        if let Some(filter) = &self.filter {
                            if &envelope.payload_type != filter {
                                continue;
                            }
                        }
                        return Ok(Some(envelope));
                    }
                    None => return Ok(None),
                }
            }
        })
    }
}

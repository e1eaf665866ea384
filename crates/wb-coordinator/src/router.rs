//! Work routing and transport lookup
//!
//! Every worker's batch exchange can return all four classes of work; the
//! router funnels each class to the processing stage that owns it, no
//! matter which worker's call claimed it. Channels are unbounded: the
//! batch size bounds what the store hands out per tick.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use wb_domain::{PerspectiveCheckpoint, WorkMessage};
use wb_ports::{Transport, WorkBatch};

/// Senders feeding the processing stages.
#[derive(Clone)]
pub struct WorkRouter {
    outbox_tx: mpsc::UnboundedSender<Vec<WorkMessage>>,
    receptor_tx: mpsc::UnboundedSender<WorkMessage>,
    inbox_tx: mpsc::UnboundedSender<WorkMessage>,
    perspective_tx: mpsc::UnboundedSender<PerspectiveCheckpoint>,
}

/// Receivers owned by the processing stages.
pub struct WorkChannels {
    pub outbox_rx: mpsc::UnboundedReceiver<Vec<WorkMessage>>,
    pub receptor_rx: mpsc::UnboundedReceiver<WorkMessage>,
    pub inbox_rx: mpsc::UnboundedReceiver<WorkMessage>,
    pub perspective_rx: mpsc::UnboundedReceiver<PerspectiveCheckpoint>,
}

impl WorkRouter {
    pub fn channel() -> (Self, WorkChannels) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (receptor_tx, receptor_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (perspective_tx, perspective_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox_tx,
                receptor_tx,
                inbox_tx,
                perspective_tx,
            },
            WorkChannels {
                outbox_rx,
                receptor_rx,
                inbox_rx,
                perspective_rx,
            },
        )
    }

    /// Funnel one exchange's work to the stages. The outbox slice is
    /// sorted by message id first, the secondary ordering safeguard
    /// within a tick.
    pub fn route(&self, mut batch: WorkBatch) {
        if !batch.outbox.is_empty() {
            batch.outbox.sort_by_key(|m| m.message_id);
            // Send errors only happen during shutdown, when the stage has
            // already gone away; the lease lapses on its own.
            if self.outbox_tx.send(batch.outbox).is_err() {
                warn!("Outbox stage gone; leaving claimed work to lease expiry");
            }
        }
        for message in batch.receptors {
            let _ = self.receptor_tx.send(message);
        }
        for message in batch.inbox {
            let _ = self.inbox_tx.send(message);
        }
        for checkpoint in batch.perspectives {
            let _ = self.perspective_tx.send(checkpoint);
        }
    }
}

/// Named transports plus the default used when a policy names none.
pub struct TransportSet {
    transports: HashMap<String, Arc<dyn Transport>>,
    default_name: String,
}

impl TransportSet {
    pub fn new(default_transport: Arc<dyn Transport>) -> Self {
        let default_name = default_transport.name().to_string();
        let mut transports = HashMap::new();
        transports.insert(default_name.clone(), default_transport);
        Self {
            transports,
            default_name,
        }
    }

    pub fn insert(&mut self, transport: Arc<dyn Transport>) {
        self.transports
            .insert(transport.name().to_string(), transport);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).cloned()
    }

    pub fn default_transport(&self) -> Arc<dyn Transport> {
        self.transports[&self.default_name].clone()
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wb_domain::MessageId;

    fn message(stream: &str) -> WorkMessage {
        WorkMessage::new(
            MessageId::new(),
            "orders",
            "orders.OrderCreated",
            json!({}),
            stream,
            64,
        )
    }

    #[tokio::test]
    async fn test_route_sorts_outbox_by_message_id() {
        let (router, mut channels) = WorkRouter::channel();

        let a = message("s-1");
        let b = message("s-2");
        let c = message("s-3");
        // Deliver out of order; ids are time-ordered so a < b < c.
        let batch = WorkBatch {
            outbox: vec![c.clone(), a.clone(), b.clone()],
            ..Default::default()
        };
        router.route(batch);

        let delivered = channels.outbox_rx.recv().await.unwrap();
        let ids: Vec<MessageId> = delivered.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![a.message_id, b.message_id, c.message_id]);
    }

    #[tokio::test]
    async fn test_route_splits_classes() {
        let (router, mut channels) = WorkRouter::channel();
        let batch = WorkBatch {
            receptors: vec![message("r")],
            inbox: vec![message("i")],
            perspectives: vec![PerspectiveCheckpoint::new("s", "p", 64)],
            ..Default::default()
        };
        router.route(batch);

        assert!(channels.receptor_rx.recv().await.is_some());
        assert!(channels.inbox_rx.recv().await.is_some());
        assert!(channels.perspective_rx.recv().await.is_some());
        // Empty outbox slices are not sent at all.
        assert!(channels.outbox_rx.try_recv().is_err());
    }
}

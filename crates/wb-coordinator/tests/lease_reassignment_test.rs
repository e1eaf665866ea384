//! Lease expiry and reassignment tests
//!
//! Drives the store contract directly with a manual clock:
//! 1. A crashed instance's claims become reclaimable once it passes the
//!    stale threshold, and its instance row is garbage-collected
//! 2. Rebalance converges when an instance joins
//! 3. Two full coordinators on one store publish every message exactly
//!    once between them

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use wb_adapters::{MemoryTransport, MemoryWorkStore};
use wb_coordinator::{CoordinatorConfig, WorkCoordinatorBuilder};
use wb_domain::{DomainMessage, InstanceId, InstanceIdentity, MessageId, StatusFlags, WorkMessage};
use wb_policy::PolicyEngine;
use wb_ports::{BatchControl, ManualClock, Transport, WorkBatchRequest, WorkStore};

fn identity(service: &str) -> InstanceIdentity {
    InstanceIdentity {
        instance_id: InstanceId::new(),
        service_name: service.to_string(),
        host_name: "test-host".to_string(),
        process_id: 7,
        metadata: BTreeMap::new(),
    }
}

fn short_leases() -> BatchControl {
    BatchControl {
        partition_count: 64,
        lease_seconds: 5,
        stale_threshold_seconds: 10,
        batch_size: 100,
        max_attempts: 5,
        debug_mode: true,
    }
}

fn outbox_message(stream: &str) -> WorkMessage {
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
async fn test_crashed_instance_work_is_reassigned() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let store = MemoryWorkStore::new(clock.clone());
    let a = identity("orders");
    let b = identity("orders");

    // A claims the row, then crashes (never calls again).
    let mut request = WorkBatchRequest::new(a.clone(), short_leases());
    request.new_outbox.push(outbox_message("order-1"));
    let batch = store.process_work_batch(request).await.unwrap();
    assert_eq!(batch.outbox.len(), 1);
    let row_id = batch.outbox[0].message_id;

    // Past the stale threshold, B's exchange both garbage-collects A and
    // claims the orphaned row.
    clock.advance(chrono::Duration::seconds(11));
    let batch = store
        .process_work_batch(WorkBatchRequest::new(b.clone(), short_leases()))
        .await
        .unwrap();
    assert_eq!(batch.outbox.len(), 1);
    assert_eq!(batch.outbox[0].message_id, row_id);
    assert_eq!(batch.outbox[0].instance_id, Some(b.instance_id));
    assert!(!store.has_instance(a.instance_id));
    assert!(store.has_instance(b.instance_id));
}

#[tokio::test]
async fn test_rebalance_when_an_instance_joins() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let store = MemoryWorkStore::new(clock.clone());
    let a = identity("orders");
    let b = identity("orders");

    // A alone owns every partition.
    let mut request = WorkBatchRequest::new(a.clone(), short_leases());
    for i in 0..20 {
        request.new_outbox.push(outbox_message(&format!("order-{}", i)));
    }
    let batch = store.process_work_batch(request).await.unwrap();
    assert_eq!(batch.outbox.len(), 20);

    // B joins. Within one exchange each, the split converges: leases A
    // holds stay with A, but expired ones follow the new assignment.
    clock.advance(chrono::Duration::seconds(6));
    let batch_b = store
        .process_work_batch(WorkBatchRequest::new(b.clone(), short_leases()))
        .await
        .unwrap();
    let batch_a = store
        .process_work_batch(WorkBatchRequest::new(a.clone(), short_leases()))
        .await
        .unwrap();

    // Every expired row lands with exactly one of the two.
    assert_eq!(batch_a.outbox.len() + batch_b.outbox.len(), 20);
    let ids_a: std::collections::BTreeSet<MessageId> =
        batch_a.outbox.iter().map(|m| m.message_id).collect();
    let ids_b: std::collections::BTreeSet<MessageId> =
        batch_b.outbox.iter().map(|m| m.message_id).collect();
    assert!(ids_a.is_disjoint(&ids_b));
    assert!(!ids_b.is_empty(), "the joiner picks up a share");
}

#[derive(Serialize)]
struct OrderUpdated {
    order: String,
}

impl DomainMessage for OrderUpdated {
    const PAYLOAD_TYPE: &'static str = "orders.OrderUpdated";

    fn stream_hint(&self) -> Option<String> {
        Some(self.order.clone())
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_two_coordinators_share_one_store_without_overlap() {
    let store = Arc::new(MemoryWorkStore::default());
    let transport = MemoryTransport::new("memory");
    transport.initialize().await.unwrap();

    let engine = || {
        Arc::new(
            PolicyEngine::builder()
                .default_policy("orders", |_, cfg| cfg.topic = "orders".to_string())
                .build(),
        )
    };
    let config = CoordinatorConfig {
        service_name: "orders".to_string(),
        polling_interval_ms: 20,
        debug_mode: true,
        ..Default::default()
    };

    let handle_a = WorkCoordinatorBuilder::new(
        store.clone(),
        config.clone(),
        engine(),
        Arc::new(transport.clone()),
    )
    .build()
    .start()
    .await
    .unwrap();
    let handle_b = WorkCoordinatorBuilder::new(
        store.clone(),
        config.clone(),
        engine(),
        Arc::new(transport.clone()),
    )
    .build()
    .start()
    .await
    .unwrap();

    let dispatcher = handle_a.dispatcher();
    let mut sent = Vec::new();
    for i in 0..20 {
        sent.push(
            dispatcher
                .send(&OrderUpdated {
                    order: format!("order-{}", i),
                })
                .unwrap(),
        );
    }

    assert!(
        wait_until(Duration::from_secs(5), || transport.published_count() == 20).await,
        "both instances together publish everything exactly once"
    );
    assert!(
        wait_until(Duration::from_secs(5), || {
            sent.iter().all(|id| {
                store
                    .outbox_row(*id)
                    .map(|row| row.status.contains(StatusFlags::PUBLISHED))
                    .unwrap_or(false)
            })
        })
        .await
    );

    handle_a.shutdown().await;
    handle_b.shutdown().await;
}

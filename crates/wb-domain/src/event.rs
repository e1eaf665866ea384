//! Event store records and perspective checkpoints
//!
//! Events append to a stream with strictly increasing versions starting at
//! 1; uniqueness on `(stream_id, version)` and `(aggregate_id, version)` is
//! the optimistic concurrency guard. Checkpoints track how far each
//! perspective has folded a stream and only ever advance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::envelope::SecurityScope;
use crate::ids::EventId;

/// One appended domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub stream_id: String,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    /// Strictly increasing per stream, starting at 1.
    pub version: u64,
    pub event_type: String,
    pub event_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SecurityScope>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        stream_id: &str,
        aggregate_id: Uuid,
        aggregate_type: &str,
        version: u64,
        event_type: &str,
        event_data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            stream_id: stream_id.to_string(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            version,
            event_type: event_type.to_string(),
            event_data,
            metadata: BTreeMap::new(),
            scope: None,
            created_at: Utc::now(),
        }
    }
}

/// Processing state of a perspective checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Pending,
    UpToDate,
    Faulted,
}

/// Where a perspective stands on one stream. Auto-created by the batch
/// routine when an event arrives whose type has a perspective association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveCheckpoint {
    pub stream_id: String,
    pub perspective_name: String,
    /// Last event folded into the read model; advances monotonically in
    /// event `created_at` order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<EventId>,
    pub status: CheckpointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<crate::ids::InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expiry: Option<DateTime<Utc>>,
    pub partition_number: u32,
}

impl PerspectiveCheckpoint {
    pub fn new(stream_id: &str, perspective_name: &str, partition_count: u32) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            perspective_name: perspective_name.to_string(),
            last_event_id: None,
            status: CheckpointStatus::Pending,
            processed_at: None,
            error: None,
            instance_id: None,
            lease_expiry: None,
            partition_number: crate::partition::partition_for_stream(stream_id, partition_count),
        }
    }

    /// Claimable: pending work, lease free or expired.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.status != CheckpointStatus::Pending {
            return false;
        }
        match (self.instance_id, self.lease_expiry) {
            (None, _) => true,
            (Some(_), Some(expiry)) => expiry < now,
            (Some(_), None) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_ids_follow_append_order() {
        let a = EventRecord::new("order-1", Uuid::now_v7(), "Order", 1, "OrderCreated", json!({}));
        let b = EventRecord::new("order-1", Uuid::now_v7(), "Order", 2, "OrderPaid", json!({}));
        assert!(a.event_id <= b.event_id);
    }

    #[test]
    fn test_fresh_checkpoint_is_claimable() {
        let cp = PerspectiveCheckpoint::new("order-1", "OrderList", 10_000);
        assert!(cp.is_claimable(Utc::now()));
        assert_eq!(cp.status, CheckpointStatus::Pending);
        assert!(cp.last_event_id.is_none());
    }

    #[test]
    fn test_up_to_date_checkpoint_is_not_claimable() {
        let mut cp = PerspectiveCheckpoint::new("order-1", "OrderList", 10_000);
        cp.status = CheckpointStatus::UpToDate;
        assert!(!cp.is_claimable(Utc::now()));
    }
}

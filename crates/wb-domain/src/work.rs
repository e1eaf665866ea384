//! Outbox/inbox work rows, status flags, and the failure taxonomy
//!
//! Outbox and inbox rows share one shape; the routing fields describe the
//! destination for outbox rows and the source subscription for inbox rows.
//! A row's `(instance_id, lease_expiry)` pair is the cooperative lock: a
//! row is claimable iff it is not yet published/processed and either no
//! instance holds it or the holder's lease has expired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};

use crate::envelope::SecurityScope;
use crate::ids::{InstanceId, MessageId};
use crate::partition::partition_for_stream;

// ============================================================================
// Status Flags
// ============================================================================

/// Lifecycle bitfield of a work row. Bits are only ever set, never cleared,
/// so status is monotonically non-decreasing under bitwise-or.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusFlags(u32);

impl StatusFlags {
    pub const NONE: Self = Self(0);
    /// Durably written to the store.
    pub const STORED: Self = Self(1);
    /// Handed to a transport and acknowledged.
    pub const PUBLISHED: Self = Self(1 << 1);
    /// Fully handled by the receiving side.
    pub const PROCESSED: Self = Self(1 << 2);
    /// Permanently failed; no further retries.
    pub const FAILED: Self = Self(1 << 3);
    /// Rejected outright; parked for operator inspection.
    pub const DEAD_LETTERED: Self = Self(1 << 4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Terminal states: nothing will claim this row again.
    pub fn is_terminal(self) -> bool {
        self.contains(Self::FAILED) || self.contains(Self::DEAD_LETTERED)
    }
}

impl BitOr for StatusFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ============================================================================
// Failure Taxonomy
// ============================================================================

/// Why a work row failed. Drives retry/dead-letter decisions in the batch
/// routine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[default]
    None,
    /// Unclassified; retried until the attempt ceiling, then dead-lettered.
    Unknown,
    /// The broker was unreachable or refused the message; the lease is
    /// renewed rather than the row failed.
    TransportException,
    /// The payload cannot be (de)serialized; permanent.
    Serialization,
    /// The message violates a handler precondition; permanent.
    Validation,
    /// The handler timed out; the lease expires naturally and the row is
    /// reclaimed.
    Timeout,
    /// Rejected outright; dead-lettered without retry.
    PermanentReject,
}

impl FailureReason {
    /// Permanent failures mark the row `FAILED` with no retry.
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::Serialization | Self::Validation)
    }

    /// Dead-letter immediately, skipping the retry ladder.
    pub fn dead_letters(self) -> bool {
        matches!(self, Self::PermanentReject)
    }

    /// Retryable failures re-lease (or let the lease lapse) instead of
    /// marking the row failed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unknown | Self::TransportException | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Unknown => "unknown",
            Self::TransportException => "transport_exception",
            Self::Serialization => "serialization",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::PermanentReject => "permanent_reject",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "transport_exception" => Self::TransportException,
            "serialization" => Self::Serialization,
            "validation" => Self::Validation,
            "timeout" => Self::Timeout,
            "permanent_reject" => Self::PermanentReject,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Work Message
// ============================================================================

/// One outbox or inbox row. Everything except the lease/status/attempt
/// fields is immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub message_id: MessageId,
    /// Destination topic for outbox rows; source subscription for inbox rows.
    pub destination: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SecurityScope>,
    pub status: StatusFlags,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expiry: Option<DateTime<Utc>>,
    pub stream_id: String,
    pub partition_number: u32,
    pub failure_reason: FailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl WorkMessage {
    /// Build a fresh row for a message headed to `destination`, sharded by
    /// `stream_id`.
    pub fn new(
        message_id: MessageId,
        destination: &str,
        message_type: &str,
        payload: serde_json::Value,
        stream_id: &str,
        partition_count: u32,
    ) -> Self {
        Self {
            message_id,
            destination: destination.to_string(),
            message_type: message_type.to_string(),
            payload,
            metadata: BTreeMap::new(),
            scope: None,
            status: StatusFlags::STORED,
            attempts: 0,
            error: None,
            created_at: Utc::now(),
            published_at: None,
            processed_at: None,
            instance_id: None,
            lease_expiry: None,
            stream_id: stream_id.to_string(),
            partition_number: partition_for_stream(stream_id, partition_count),
            failure_reason: FailureReason::None,
            scheduled_for: None,
        }
    }

    /// Claimable: not yet published, not terminal, lease free or expired,
    /// and not scheduled for the future.
    pub fn is_claimable(&self, now: DateTime<Utc>, done: StatusFlags) -> bool {
        if self.status.contains(done) || self.status.is_terminal() {
            return false;
        }
        if let Some(scheduled) = self.scheduled_for {
            if scheduled > now {
                return false;
            }
        }
        match (self.instance_id, self.lease_expiry) {
            (None, _) => true,
            (Some(_), Some(expiry)) => expiry < now,
            (Some(_), None) => true,
        }
    }
}

// ============================================================================
// Service Instances
// ============================================================================

/// The identity a caller presents to the batch coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// One live (or recently live) service process as recorded by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

// ============================================================================
// Message Associations
// ============================================================================

/// What a message type is associated with on the consuming side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    /// A handler invoked per inbound message.
    Receptor,
    /// A read model folded over the event stream; triggers checkpoint
    /// auto-creation in the batch routine.
    Perspective,
}

/// Declarative registry row telling the batch routine which checkpoints to
/// materialize and which inbox rows need receptor handling.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageAssociation {
    pub message_type: String,
    pub kind: AssociationKind,
    pub target_name: String,
    pub service_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn row() -> WorkMessage {
        WorkMessage::new(
            MessageId::new(),
            "orders",
            "orders.OrderCreated",
            json!({"v": 1}),
            "order-1",
            10_000,
        )
    }

    #[test]
    fn test_status_flags_are_monotonic_under_or() {
        let mut status = StatusFlags::STORED;
        status |= StatusFlags::PUBLISHED;
        assert!(status.contains(StatusFlags::STORED));
        assert!(status.contains(StatusFlags::PUBLISHED));

        // Re-applying a completion never unsets bits.
        status |= StatusFlags::PUBLISHED;
        assert!(status.contains(StatusFlags::STORED | StatusFlags::PUBLISHED));
    }

    #[test]
    fn test_terminal_flags() {
        assert!(!StatusFlags::PUBLISHED.is_terminal());
        assert!(StatusFlags::FAILED.is_terminal());
        assert!((StatusFlags::STORED | StatusFlags::DEAD_LETTERED).is_terminal());
    }

    #[test]
    fn test_failure_reason_classification() {
        assert!(FailureReason::TransportException.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(FailureReason::Unknown.is_retryable());
        assert!(FailureReason::Serialization.is_permanent());
        assert!(FailureReason::Validation.is_permanent());
        assert!(FailureReason::PermanentReject.dead_letters());
        assert!(!FailureReason::PermanentReject.is_retryable());
    }

    #[test]
    fn test_failure_reason_string_round_trip() {
        for reason in [
            FailureReason::None,
            FailureReason::Unknown,
            FailureReason::TransportException,
            FailureReason::Serialization,
            FailureReason::Validation,
            FailureReason::Timeout,
            FailureReason::PermanentReject,
        ] {
            assert_eq!(FailureReason::from_str_lossy(reason.as_str()), reason);
        }
    }

    #[test]
    fn test_fresh_row_is_claimable() {
        let now = Utc::now();
        assert!(row().is_claimable(now, StatusFlags::PUBLISHED));
    }

    #[test]
    fn test_leased_row_is_not_claimable_until_expiry() {
        let now = Utc::now();
        let mut r = row();
        r.instance_id = Some(InstanceId::new());
        r.lease_expiry = Some(now + Duration::seconds(300));
        assert!(!r.is_claimable(now, StatusFlags::PUBLISHED));

        r.lease_expiry = Some(now - Duration::seconds(1));
        assert!(r.is_claimable(now, StatusFlags::PUBLISHED));
    }

    #[test]
    fn test_published_row_is_never_reclaimed() {
        let now = Utc::now();
        let mut r = row();
        r.status |= StatusFlags::PUBLISHED;
        assert!(!r.is_claimable(now, StatusFlags::PUBLISHED));
    }

    #[test]
    fn test_scheduled_row_waits_its_turn() {
        let now = Utc::now();
        let mut r = row();
        r.scheduled_for = Some(now + Duration::seconds(60));
        assert!(!r.is_claimable(now, StatusFlags::PUBLISHED));
        assert!(r.is_claimable(now + Duration::seconds(61), StatusFlags::PUBLISHED));
    }
}

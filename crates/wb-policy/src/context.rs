//! Policy evaluation context
//!
//! The context is an explicit struct threaded through evaluation; there is
//! no ambient container. Predicates must be pure: the engine makes no
//! caching guarantees and may evaluate a predicate more than once per
//! message.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use wb_domain::{AggregateMessage, Envelope};

/// The aggregate a message belongs to, when it is an aggregate event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRef {
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
}

/// Everything a policy predicate may probe.
pub struct PolicyContext<'a> {
    pub envelope: &'a Envelope,
    pub environment: &'a str,
    pub now: DateTime<Utc>,
    pub aggregate: Option<AggregateRef>,
}

impl<'a> PolicyContext<'a> {
    pub fn new(envelope: &'a Envelope, environment: &'a str, now: DateTime<Utc>) -> Self {
        Self {
            envelope,
            environment,
            now,
            aggregate: None,
        }
    }

    pub fn with_aggregate(mut self, aggregate_type: &str, aggregate_id: Uuid) -> Self {
        self.aggregate = Some(AggregateRef {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
        });
        self
    }

    /// The message's payload type name.
    pub fn message_type(&self) -> &str {
        &self.envelope.payload_type
    }

    /// Envelope metadata, as recorded on the origin hop.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.envelope
            .origin_hop()
            .and_then(|h| h.metadata.get(key))
            .map(|s| s.as_str())
    }

    /// True when `tag` appears in the origin hop's comma-separated `tags`
    /// metadata entry.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata("tags")
            .map(|tags| tags.split(',').any(|t| t.trim() == tag))
            .unwrap_or(false)
    }

    /// True when the metadata entry named `flag` is set truthy.
    pub fn has_flag(&self, flag: &str) -> bool {
        matches!(self.metadata(flag), Some("true") | Some("1"))
    }

    /// True when the message is an aggregate event for `T`.
    pub fn matches_aggregate<T: AggregateMessage>(&self) -> bool {
        self.aggregate
            .as_ref()
            .map(|a| a.aggregate_type == T::AGGREGATE)
            .unwrap_or(false)
    }

    /// The aggregate identifier, when present.
    pub fn aggregate_id(&self) -> Option<Uuid> {
        self.aggregate.as_ref().map(|a| a.aggregate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;
    use wb_domain::{DomainMessage, InstanceId};

    #[derive(Serialize)]
    struct OrderCreated;

    impl DomainMessage for OrderCreated {
        const PAYLOAD_TYPE: &'static str = "orders.OrderCreated";
    }

    impl AggregateMessage for OrderCreated {
        const AGGREGATE: &'static str = "Order";

        fn aggregate_id(&self) -> Uuid {
            Uuid::nil()
        }
    }

    #[derive(Serialize)]
    struct InvoiceRaised;

    impl DomainMessage for InvoiceRaised {
        const PAYLOAD_TYPE: &'static str = "billing.InvoiceRaised";
    }

    impl AggregateMessage for InvoiceRaised {
        const AGGREGATE: &'static str = "Invoice";

        fn aggregate_id(&self) -> Uuid {
            Uuid::nil()
        }
    }

    fn envelope_with_tags(tags: &str) -> Envelope {
        let mut env = Envelope::new("orders.OrderCreated", json!({}));
        env.record_origin("orders", InstanceId::new(), "orders");
        if let Some(origin) = env.hops.first_mut() {
            origin.metadata.insert("tags".to_string(), tags.to_string());
            origin.metadata.insert("replay".to_string(), "true".to_string());
        }
        env
    }

    #[test]
    fn test_tag_and_flag_probing() {
        let env = envelope_with_tags("priority:high, audited");
        let ctx = PolicyContext::new(&env, "test", Utc::now());

        assert!(ctx.has_tag("priority:high"));
        assert!(ctx.has_tag("audited"));
        assert!(!ctx.has_tag("priority:low"));
        assert!(ctx.has_flag("replay"));
        assert!(!ctx.has_flag("missing"));
    }

    #[test]
    fn test_aggregate_matching() {
        let env = envelope_with_tags("");
        let id = Uuid::now_v7();
        let ctx = PolicyContext::new(&env, "test", Utc::now()).with_aggregate("Order", id);

        assert!(ctx.matches_aggregate::<OrderCreated>());
        assert!(!ctx.matches_aggregate::<InvoiceRaised>());
        assert_eq!(ctx.aggregate_id(), Some(id));
    }

    #[test]
    fn test_no_aggregate_matches_nothing() {
        let env = envelope_with_tags("");
        let ctx = PolicyContext::new(&env, "test", Utc::now());
        assert!(!ctx.matches_aggregate::<OrderCreated>());
        assert_eq!(ctx.aggregate_id(), None);
    }
}

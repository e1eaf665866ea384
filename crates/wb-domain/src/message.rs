//! Traits user message types implement
//!
//! Dispatch is by explicit registration keyed on the payload type string;
//! there is no runtime reflection. A message type declares its payload type
//! name once, and aggregate events additionally name their aggregate so
//! policies can match on it.

use serde::Serialize;
use uuid::Uuid;

/// A domain message that can be dispatched through Whizbang.
pub trait DomainMessage: Serialize {
    /// Fully qualified payload type name; the wire-level dispatch key.
    const PAYLOAD_TYPE: &'static str;

    /// Stream the message belongs to, when the type itself knows it.
    /// Policies may override this via their stream key.
    fn stream_hint(&self) -> Option<String> {
        None
    }
}

/// A message that is an event of a named aggregate.
pub trait AggregateMessage: DomainMessage {
    /// Aggregate type name, e.g. `"Order"`.
    const AGGREGATE: &'static str;

    fn aggregate_id(&self) -> Uuid;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct OrderCreated {
        order_id: Uuid,
    }

    impl DomainMessage for OrderCreated {
        const PAYLOAD_TYPE: &'static str = "orders.OrderCreated";

        fn stream_hint(&self) -> Option<String> {
            Some(format!("order-{}", self.order_id))
        }
    }

    impl AggregateMessage for OrderCreated {
        const AGGREGATE: &'static str = "Order";

        fn aggregate_id(&self) -> Uuid {
            self.order_id
        }
    }

    #[test]
    fn test_payload_type_and_stream_hint() {
        let id = Uuid::now_v7();
        let msg = OrderCreated { order_id: id };
        assert_eq!(OrderCreated::PAYLOAD_TYPE, "orders.OrderCreated");
        assert_eq!(msg.stream_hint(), Some(format!("order-{}", id)));
        assert_eq!(msg.aggregate_id(), id);
    }
}

//! Message envelope and hop chain
//!
//! The envelope is the on-wire carrier of a domain message. Its identity
//! never changes; every service that touches it appends a hop, and the hop
//! chain is the causation/trace record. The last `current` hop carries the
//! outgoing routing context, including the payload type the receiver needs
//! to deserialize without a global type registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::EnvelopeError;
use crate::ids::{InstanceId, MessageId};

/// Hop metadata keys shared between sender and receiver.
pub mod hop_meta {
    pub const PAYLOAD_TYPE: &str = "PayloadType";
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const CAUSATION_ID: &str = "CausationId";
    pub const STREAM_KEY: &str = "StreamKey";
    pub const POLICY_TRAIL: &str = "PolicyTrail";
}

/// Transport header names (bit-exact wire contract).
pub mod headers {
    pub const MESSAGE_ID: &str = "MessageId";
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const CAUSATION_ID: &str = "CausationId";
    pub const PAYLOAD_TYPE: &str = "PayloadType";
    pub const HOPS: &str = "Hops";
    pub const SECURITY_CONTEXT: &str = "SecurityContext";
    pub const POLICY_TRAIL: &str = "PolicyTrail";
}

/// Kind of a hop in the causation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopKind {
    /// The hop recorded where the message was created.
    Origin,
    /// A hop recorded on publish or receipt by a service.
    Current,
}

/// One link in an envelope's causation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHop {
    pub kind: HopKind,
    pub service_name: String,
    pub instance_id: InstanceId,
    pub topic: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl MessageHop {
    pub fn new(kind: HopKind, service_name: &str, instance_id: InstanceId, topic: &str) -> Self {
        Self {
            kind,
            service_name: service_name.to_string(),
            instance_id,
            topic: topic.to_string(),
            recorded_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Security principal set attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// The envelope: message identity, payload, hop chain, and scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub payload_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub hops: Vec<MessageHop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SecurityScope>,
}

impl Envelope {
    pub fn new(payload_type: &str, payload: serde_json::Value) -> Self {
        Self {
            message_id: MessageId::new(),
            payload_type: payload_type.to_string(),
            payload,
            hops: Vec::new(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: SecurityScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// The hop recorded where this message was created.
    pub fn origin_hop(&self) -> Option<&MessageHop> {
        self.hops.first()
    }

    /// The most recent `current` hop; carries the outgoing routing context.
    pub fn current_hop(&self) -> Option<&MessageHop> {
        self.hops.iter().rev().find(|h| h.kind == HopKind::Current)
    }

    /// Correlation id derived from the origin hop. Falls back to the
    /// message's own id when the message is itself the root of a trace.
    pub fn correlation_id(&self) -> String {
        self.origin_hop()
            .and_then(|h| h.metadata.get(hop_meta::CORRELATION_ID))
            .cloned()
            .unwrap_or_else(|| self.message_id.to_string())
    }

    /// Message id of the message being handled when this one was created.
    pub fn causation_id(&self) -> Option<String> {
        self.origin_hop()
            .and_then(|h| h.metadata.get(hop_meta::CAUSATION_ID))
            .cloned()
    }

    /// Record the origin hop. Called once, by the dispatcher, when a
    /// producer hands over the message.
    pub fn record_origin(&mut self, service_name: &str, instance_id: InstanceId, topic: &str) {
        let hop = MessageHop::new(HopKind::Origin, service_name, instance_id, topic)
            .with_metadata(hop_meta::PAYLOAD_TYPE, &self.payload_type);
        self.hops.insert(0, hop);
    }

    /// Mark this message as caused by another. Copies the parent's
    /// correlation id and records the parent's message id as causation.
    /// Must be called before [`record_origin`](Self::record_origin) takes
    /// effect on the wire, i.e. while building the message.
    pub fn caused_by(&mut self, parent: &Envelope) {
        let correlation = parent.correlation_id();
        let causation = parent.message_id.to_string();
        match self.hops.first_mut() {
            Some(origin) if origin.kind == HopKind::Origin => {
                origin
                    .metadata
                    .insert(hop_meta::CORRELATION_ID.to_string(), correlation);
                origin
                    .metadata
                    .insert(hop_meta::CAUSATION_ID.to_string(), causation);
            }
            _ => {
                // No origin hop yet; stash on a placeholder that
                // record_origin will not overwrite.
                let mut hop = MessageHop::new(
                    HopKind::Origin,
                    "",
                    InstanceId::from_uuid(uuid::Uuid::nil()),
                    "",
                );
                hop.metadata
                    .insert(hop_meta::CORRELATION_ID.to_string(), correlation);
                hop.metadata
                    .insert(hop_meta::CAUSATION_ID.to_string(), causation);
                self.hops.push(hop);
            }
        }
    }

    /// Append a `current` hop on publish. The hop metadata carries the
    /// payload type so receivers can deserialize.
    pub fn record_publish(
        &mut self,
        service_name: &str,
        instance_id: InstanceId,
        topic: &str,
        stream_key: &str,
    ) {
        let hop = MessageHop::new(HopKind::Current, service_name, instance_id, topic)
            .with_metadata(hop_meta::PAYLOAD_TYPE, &self.payload_type)
            .with_metadata(hop_meta::STREAM_KEY, stream_key);
        self.hops.push(hop);
    }

    /// Append a `current` hop on receipt, tagged with the consuming
    /// service's identity.
    pub fn record_receipt(&mut self, service_name: &str, instance_id: InstanceId, topic: &str) {
        let hop = MessageHop::new(HopKind::Current, service_name, instance_id, topic);
        self.hops.push(hop);
    }

    /// Transport headers for this envelope. The payload travels as the
    /// message body; everything else rides in headers.
    pub fn to_headers(&self) -> Result<BTreeMap<String, String>, EnvelopeError> {
        let mut h = BTreeMap::new();
        h.insert(headers::MESSAGE_ID.to_string(), self.message_id.to_string());
        h.insert(headers::CORRELATION_ID.to_string(), self.correlation_id());
        if let Some(causation) = self.causation_id() {
            h.insert(headers::CAUSATION_ID.to_string(), causation);
        }
        h.insert(headers::PAYLOAD_TYPE.to_string(), self.payload_type.clone());
        h.insert(
            headers::HOPS.to_string(),
            serde_json::to_string(&self.hops).map_err(EnvelopeError::encode)?,
        );
        if let Some(scope) = &self.scope {
            h.insert(
                headers::SECURITY_CONTEXT.to_string(),
                serde_json::to_string(scope).map_err(EnvelopeError::encode)?,
            );
        }
        if let Some(trail) = self
            .origin_hop()
            .and_then(|hop| hop.metadata.get(hop_meta::POLICY_TRAIL))
        {
            h.insert(headers::POLICY_TRAIL.to_string(), trail.clone());
        }
        Ok(h)
    }

    /// Rebuild an envelope from transport headers and the message body.
    pub fn from_headers(
        headers_map: &BTreeMap<String, String>,
        payload: serde_json::Value,
    ) -> Result<Self, EnvelopeError> {
        let require = |name: &str| {
            headers_map
                .get(name)
                .ok_or_else(|| EnvelopeError::MissingHeader {
                    name: name.to_string(),
                })
        };

        let message_id: MessageId = require(headers::MESSAGE_ID)?
            .parse()
            .map_err(EnvelopeError::decode)?;
        let payload_type = require(headers::PAYLOAD_TYPE)?.clone();
        let hops: Vec<MessageHop> = match headers_map.get(headers::HOPS) {
            Some(raw) => serde_json::from_str(raw).map_err(EnvelopeError::decode)?,
            None => Vec::new(),
        };
        let scope = match headers_map.get(headers::SECURITY_CONTEXT) {
            Some(raw) => Some(serde_json::from_str(raw).map_err(EnvelopeError::decode)?),
            None => None,
        };

        Ok(Self {
            message_id,
            payload_type,
            payload,
            hops,
            scope,
        })
    }
}

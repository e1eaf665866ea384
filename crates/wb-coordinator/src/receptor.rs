//! Receptor registry
//!
//! Receptors are user handlers invoked per inbound message type. Dispatch
//! is by explicit registration keyed on the payload type string; an
//! inbound message with no registered receptor is permanently rejected.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

use wb_domain::{AssociationKind, Envelope, FailureReason, MessageAssociation};

/// Receptor errors, classified onto the work-row failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ReceptorError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Deserialization failed: {message}")]
    Deserialization { message: String },

    #[error("Handler timed out: {message}")]
    Timeout { message: String },

    #[error("Message rejected: {message}")]
    Rejected { message: String },

    #[error("Handler error: {message}")]
    Other { message: String },
}

impl ReceptorError {
    pub fn classify(&self) -> FailureReason {
        match self {
            Self::Validation { .. } => FailureReason::Validation,
            Self::Deserialization { .. } => FailureReason::Serialization,
            Self::Timeout { .. } => FailureReason::Timeout,
            Self::Rejected { .. } => FailureReason::PermanentReject,
            Self::Other { .. } => FailureReason::Unknown,
        }
    }
}

/// A user-provided handler for one inbound message type.
pub trait Receptor: Send + Sync {
    /// Payload type this receptor handles; the dispatch key.
    fn payload_type(&self) -> &str;

    /// Handler name recorded in the message association registry.
    fn name(&self) -> &str {
        self.payload_type()
    }

    fn handle<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), ReceptorError>>;
}

/// A receptor built from a closure.
pub struct FnReceptor<F> {
    payload_type: String,
    name: String,
    handler: F,
}

impl<F, Fut> FnReceptor<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ReceptorError>> + Send + 'static,
{
    pub fn new(payload_type: &str, handler: F) -> Self {
        Self {
            payload_type: payload_type.to_string(),
            name: format!("{}-receptor", payload_type),
            handler,
        }
    }
}

impl<F, Fut> Receptor for FnReceptor<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ReceptorError>> + Send + 'static,
{
    fn payload_type(&self) -> &str {
        &self.payload_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), ReceptorError>> {
        Box::pin((self.handler)(envelope.clone()))
    }
}

/// Registry mapping payload types to receptors.
#[derive(Default)]
pub struct ReceptorRegistry {
    receptors: HashMap<String, Arc<dyn Receptor>>,
}

impl ReceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receptor; the last registration for a payload type wins.
    pub fn register(&mut self, receptor: Arc<dyn Receptor>) {
        self.receptors
            .insert(receptor.payload_type().to_string(), receptor);
    }

    /// Register a closure for a payload type.
    pub fn register_fn<F, Fut>(&mut self, payload_type: &str, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ReceptorError>> + Send + 'static,
    {
        self.register(Arc::new(FnReceptor::new(payload_type, handler)));
    }

    pub fn resolve(&self, payload_type: &str) -> Option<Arc<dyn Receptor>> {
        self.receptors.get(payload_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.receptors.is_empty()
    }

    /// The declarative association rows this registry contributes, for
    /// registration with the store at startup.
    pub fn associations(&self, service_name: &str) -> Vec<MessageAssociation> {
        self.receptors
            .values()
            .map(|receptor| MessageAssociation {
                message_type: receptor.payload_type().to_string(),
                kind: AssociationKind::Receptor,
                target_name: receptor.name().to_string(),
                service_name: service_name.to_string(),
            })
            .collect()
    }
}

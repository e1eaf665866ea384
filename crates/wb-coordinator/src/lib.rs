//! Whizbang Work Coordinator
//!
//! The worker runtime over the batch exchange: three cooperative loops per
//! process (publisher, consumer, perspective) that report accumulated
//! outcomes, receive leased work, and funnel it to the right processing
//! stage. Across processes, the store's lease discipline provides mutual
//! exclusion; within a process the loops share outcome bags and typed work
//! channels.

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod idle;
pub mod outcomes;
pub mod perspective;
pub mod publisher;
pub mod receptor;
pub mod router;
pub mod supervisor;

pub use config::CoordinatorConfig;
pub use consumer::ConsumerWorker;
pub use dispatcher::{DispatchError, Dispatcher, SendOptions};
pub use idle::IdleTracker;
pub use outcomes::{Outcomes, OutcomeBag};
pub use perspective::{
    CompletionStrategy, CompletionTracker, Perspective, PerspectiveRegistry, PerspectiveWorker,
};
pub use publisher::PublisherWorker;
pub use receptor::{FnReceptor, Receptor, ReceptorError, ReceptorRegistry};
pub use router::{TransportSet, WorkChannels, WorkRouter};
pub use supervisor::{CoordinatorHandle, WorkCoordinator, WorkCoordinatorBuilder};

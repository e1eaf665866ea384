//! Whizbang Port Traits
//!
//! This crate defines the port interfaces (traits) that adapters must
//! implement:
//! - `WorkStore` — the single atomic batch exchange with the relational store
//! - `Transport` / `Subscription` — publish/subscribe with readiness signalling
//! - `TopicRoutingStrategy` — logical topic to physical destination mapping
//! - `Clock` — deterministic time handling

pub mod clock;
pub mod store;
pub mod transport;

pub use clock::*;
pub use store::*;
pub use transport::*;

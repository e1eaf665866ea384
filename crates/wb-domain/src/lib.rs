//! Whizbang Domain Core
//!
//! This crate contains the pure domain types for Whizbang, including:
//! - Time-ordered identifiers (UUIDv7 newtypes)
//! - The message envelope with its hop/causation chain and security scope
//! - Outbox/inbox work rows, status flags, and the failure taxonomy
//! - Event store records, perspective checkpoints, and message associations
//! - Stream-to-partition hashing and partition assignment math
//!
//! This crate MUST NOT import DB clients, HTTP frameworks, or broker SDKs.

pub mod envelope;
pub mod errors;
pub mod event;
pub mod ids;
pub mod message;
pub mod partition;
pub mod work;

pub use envelope::*;
pub use errors::*;
pub use event::*;
pub use ids::*;
pub use message::*;
pub use partition::*;
pub use work::*;

//! Whizbang Adapter Implementations
//!
//! This crate provides adapter implementations for the ports defined in
//! wb-ports:
//! - PostgreSQL work store (the atomic batch routine over sqlx)
//! - In-memory work store (the same contract, for tests and local runs)
//! - NATS JetStream transport
//! - In-memory transport (broker shim; exercises polling-mode consumers)

pub mod config;
pub mod memory;
pub mod memory_transport;
pub mod nats;
pub mod postgres;

pub use config::*;
pub use memory::MemoryWorkStore;
pub use memory_transport::MemoryTransport;
pub use nats::{NatsConfig, NatsTransport};
pub use postgres::PostgresWorkStore;

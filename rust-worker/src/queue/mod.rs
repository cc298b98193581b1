//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The email request message type
//! - The connection manager that owns the broker connection and topology
//!
//! ## Topology
//!
//! ```text
//! exchange (durable, typed) --binding_key--> queue (durable) --auto-ack--> delivery loop
//! ```

pub mod connection;
pub mod types;

pub use connection::{exchange_kind, ConnectionManager, ConnectionState, ConsumptionHandle};
pub use types::EmailRequest;

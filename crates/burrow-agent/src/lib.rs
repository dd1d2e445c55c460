//! Burrow Agent Library
//!
//! Private side of the tunnel:
//! - Connection manager that dials the broker over mTLS and keeps the
//!   envelope stream alive, reconnecting with exponential backoff
//! - Request handler that forwards tunnelled requests to the local service
//! - Heartbeat loop
//! - Local HTTP forwarder

pub mod forwarder;
pub mod tunnel;

pub use forwarder::{Forward, LocalForwarder};
pub use tunnel::{ConnectionManager, ConnectionState, TunnelClientError, TunnelConfig};

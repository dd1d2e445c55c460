//! Tunnel client connecting the agent to the broker.
//!
//! Provides outbound tunnel connectivity with automatic reconnection,
//! envelope-level request handling, and heartbeat keepalive.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod state;
pub mod tls;

pub use client::ConnectionManager;
pub use config::{ReconnectPolicy, TunnelConfig};
pub use error::TunnelClientError;
pub use handler::RequestHandler;
pub use state::ConnectionState;

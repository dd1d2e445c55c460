//! gRPC server implementations for the broker.

pub mod tunnel_svc;

pub use tunnel_svc::{TunnelServiceImpl, peer_agent_id};

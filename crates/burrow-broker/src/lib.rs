//! Burrow Broker Library
//!
//! Public side of the tunnel:
//! - Tunnel registry holding the single active agent session
//! - gRPC `TunnelService` accepting the agent's mTLS stream
//! - HTTP ingress gateway that turns public requests into tunnel requests
//! - File-backed domain routing table
//! - TLS configuration for the gRPC listener

pub mod gateway;
pub mod registry;
pub mod routing;
pub mod server;
pub mod tls;

// Every accepted body, plus headers, must fit in one tunnel envelope.
const _: () =
    assert!(burrow_core::config::MAX_BODY_BYTES_LIMIT < burrow_proto::MAX_ENVELOPE_BYTES);

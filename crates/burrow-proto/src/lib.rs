//! Burrow Protocol Buffers
//!
//! Generated protobuf code for the burrow tunnel protocol.
//!
//! This crate contains:
//! - `TunnelService` (`Ping` and the bidirectional `EstablishTunnel` stream)
//! - the `Envelope` message and its request/response/control payloads
//! - constructors and an exhaustive view over envelopes ([`EnvelopeKind`])
//! - named control commands shared by agent and broker

#![allow(clippy::derive_partial_eq_without_eq)]

/// Burrow v1 API definitions.
pub mod v1 {
    tonic::include_proto!("burrow.v1");
}

pub mod control;
pub mod envelope;

// Re-export v1 as the default API version for convenience
pub use envelope::{EnvelopeKind, now_ms};
pub use v1::*;

/// Largest envelope either side will encode or decode.
///
/// Sized for a 16 MiB body plus headers and framing.
pub const MAX_ENVELOPE_BYTES: usize = 17 * 1024 * 1024;

//! Burrow Core Library
//!
//! Shared functionality for the agent and the broker:
//! - Configuration files and their defaults
//! - Tracing subscriber setup
//! - Replay/freshness guard for tunnel envelopes
//! - Common error types

pub mod config;
pub mod error;
pub mod replay;
pub mod tracing_init;

pub use config::{AgentSettings, BrokerSettings};
pub use error::{Error, Result};
pub use replay::{ReplayGuard, ReplayVerdict};

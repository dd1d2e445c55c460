//! Named control commands exchanged in `Control` envelopes.
//!
//! Shared between the agent (command table) and the broker so that command
//! names stay in sync without duplicating string literals.

/// Broker asks the agent to confirm it is alive and processing envelopes.
pub const CMD_HEALTH_CHECK: &str = "health_check";

/// Agent's answer to [`CMD_HEALTH_CHECK`].
pub const CMD_HEALTH_CHECK_RESPONSE: &str = "health_check_response";

/// Data carried by a healthy [`CMD_HEALTH_CHECK_RESPONSE`].
pub const HEALTH_OK: &str = "OK";
